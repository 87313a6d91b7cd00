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

use std::path::Path;

use fuser::{spawn_mount2, Filesystem, MountOption};
use mftfs_common::MFTFS;
use snafu::{ResultExt, Whatever};

/// A file system that answers nothing. Mounting it first tells whether the
/// mount point is usable before any backend is connected.
struct NullFs {}

impl Filesystem for NullFs {}

pub fn mount_check<P: AsRef<Path>>(mountpoint: P) -> Result<(), Whatever> {
    let mountpoint = mountpoint.as_ref();
    let options = [MountOption::FSName(String::from(MFTFS))];
    let session = spawn_mount2(NullFs {}, mountpoint, &options).with_whatever_context(|e| {
        format!("failed to mount null fs on {}; {}", mountpoint.display(), e)
    })?;
    drop(session);

    Ok(())
}
