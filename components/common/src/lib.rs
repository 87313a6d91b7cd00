// Copyright 2024 mftfs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

pub const MFTFS: &str = "mftfs";

pub const MAX_NAME_LENGTH: usize = 255;
pub const DOT: &str = ".";

// Block size reported through statfs and used for `blocks` in attributes.
pub const BLOCK_SIZE: usize = 4 << 10; // 4 KiB

pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(60);

// 1 TiB
pub const DEFAULT_CAPACITY: u64 = 1 << 40;

// largest object a session backend rebuilds in memory, 4 GiB
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 4 << 30;

pub const DEFAULT_WRITE_RETRIES: usize = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const MFTFS_DEBUG_MOUNT_POINT: &str = "/tmp/mftfs";
pub const MFTFS_DEBUG_CACHE: &str = "/tmp/mftfs.cache";
pub const MFTFS_DEBUG_SERVER_ADDR: &str = "127.0.0.1:7878";
pub const MFTFS_HOME_ENV: &str = "MFTFS_HOME";

pub type FH = u64;
