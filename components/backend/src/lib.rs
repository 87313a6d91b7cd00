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

pub mod coherence;
pub mod config;
pub mod err;
pub mod local;
pub mod manager;
pub mod remote;
pub mod session;

pub use coherence::CoherentManager;
pub use config::{BackendConfig, BackendKind, CoherenceConfig, RemoteConfig};
pub use err::{Error, Result};
pub use local::LocalFsManager;
pub use manager::{BackendRef, FsManager};
pub use remote::{RemoteFsManager, RemoteServer, ServerConfig};
pub use session::SessionFsManager;
