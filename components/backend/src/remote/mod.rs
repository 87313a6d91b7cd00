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

//! The remote backend: a client that keeps a local copy of file contents and
//! asks an authoritative server for permission before trusting or changing
//! it, plus that server.

pub mod cache;
pub mod client;
mod manager;
pub mod server;
pub mod wire;

pub use manager::RemoteFsManager;
pub use server::{RemoteServer, ServerConfig};

#[cfg(test)]
pub(crate) mod test_util {
    use std::{path::Path, sync::Arc, time::Duration};

    use mftfs_meta::RequestContext;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use super::RemoteServer;
    use crate::{coherence::CoherentManager, local::LocalFsManager, manager::FsManager};

    /// Serves `root` on an ephemeral port, returns its address.
    pub async fn spawn_server(root: &Path, shutdown: CancellationToken) -> String {
        let coherent = Arc::new(CoherentManager::new(Arc::new(LocalFsManager::new(root))));
        coherent.start(&RequestContext::background()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(RemoteServer::new(coherent, Duration::from_secs(5)));
        tokio::spawn(server.serve(listener, shutdown));
        addr
    }
}
