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

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use mftfs_common::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_WRITE_RETRIES, MFTFS_DEBUG_CACHE, MFTFS_DEBUG_SERVER_ADDR};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::debug;

use crate::{
    local::LocalFsManager, manager::BackendRef, remote::RemoteFsManager,
    session::SessionFsManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Session,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local { root: PathBuf },
    Session {
        /// An opendal scheme such as `sftp`, `fs` or `memory`.
        scheme:  String,
        options: HashMap<String, String>,
    },
    Remote(RemoteConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Local { .. } => BackendKind::Local,
            BackendConfig::Session { .. } => BackendKind::Session,
            BackendConfig::Remote(_) => BackendKind::Remote,
        }
    }

    pub fn build(&self) -> BackendRef {
        debug!("building backend [{}]", self.kind());
        match self {
            BackendConfig::Local { root } => Arc::new(LocalFsManager::new(root)),
            BackendConfig::Session { scheme, options } => {
                Arc::new(SessionFsManager::new(scheme, options.clone()))
            }
            BackendConfig::Remote(rc) => Arc::new(RemoteFsManager::new(rc.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub addr:      String,
    /// One cache file per inode lives here.
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub coherence: CoherenceConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            addr:      MFTFS_DEBUG_SERVER_ADDR.to_string(),
            cache_dir: PathBuf::from(MFTFS_DEBUG_CACHE),
            coherence: CoherenceConfig::default(),
        }
    }
}

impl RemoteConfig {
    pub fn with_addr(&mut self, addr: &str) -> &mut Self {
        self.addr = addr.to_string();
        self
    }

    pub fn with_cache_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.cache_dir = dir.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherenceConfig {
    /// How many times a declined write refreshes and asks again. Zero gives
    /// up on the first decline.
    pub write_retries:   usize,
    pub request_timeout: Duration,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            write_retries:   DEFAULT_WRITE_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}
