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

use std::{path::PathBuf, time::Duration};

use fuser::MountOption;
use mftfs_common::{
    DEFAULT_CAPACITY, DEFAULT_ENTRY_TTL, DEFAULT_REQUEST_TIMEOUT, MFTFS, MFTFS_DEBUG_MOUNT_POINT,
};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone)]
pub struct FuseConfig {
    pub mount_point:        PathBuf,
    pub mount_options:      Vec<MountOption>,
    pub async_work_threads: usize,
    /// Deadline given to every kernel request, `None` waits forever.
    pub request_timeout:    Option<Duration>,
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            mount_point:        PathBuf::from(MFTFS_DEBUG_MOUNT_POINT),
            mount_options:      vec![
                MountOption::FSName(MFTFS.to_string()),
                MountOption::DefaultPermissions,
                MountOption::NoAtime,
            ],
            async_work_threads: 4,
            request_timeout:    Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

/// What a lookup answers when the name is absent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum LookupMissPolicy {
    /// A successful reply carrying inode 0, which the kernel caches as a
    /// negative entry for the ttl.
    #[default]
    NegativeEntry,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub entry_ttl:      Duration,
    pub lookup_miss:    LookupMissPolicy,
    /// Drop an inode's record once the kernel forgot every reference to it.
    pub forget_deletes: bool,
    /// Bytes reported as total space by statfs.
    pub capacity:       u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            entry_ttl:      DEFAULT_ENTRY_TTL,
            lookup_miss:    LookupMissPolicy::default(),
            forget_deletes: true,
            capacity:       DEFAULT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn lookup_miss_policy_names() {
        assert_eq!(
            LookupMissPolicy::from_str("negative-entry").unwrap(),
            LookupMissPolicy::NegativeEntry
        );
        assert_eq!(
            LookupMissPolicy::from_str("not-found").unwrap(),
            LookupMissPolicy::NotFound
        );
        assert_eq!(LookupMissPolicy::NotFound.to_string(), "not-found");
    }
}
