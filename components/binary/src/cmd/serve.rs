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

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Args;
use mftfs_backend::{CoherentManager, FsManager, LocalFsManager, RemoteServer, ServerConfig};
use mftfs_common::MFTFS_DEBUG_SERVER_ADDR;
use mftfs_meta::RequestContext;
use snafu::{ResultExt, Whatever};
use tokio::{net::TcpListener, runtime};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{log_versions, LoggingArgs};

const SERVER_OPTIONS_HEADER: &str = "Server options";

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Serve a local directory to remote mounts, arbitrating their caches.
Examples:

mftfs serve /srv/data --listen 0.0.0.0:7878
")]
pub struct ServeArgs {
    #[arg(help = "Directory to serve", value_name = "ROOT")]
    pub root: PathBuf,

    #[arg(
    long,
    help = "Address to listen on",
    help_heading = SERVER_OPTIONS_HEADER,
    default_value = MFTFS_DEBUG_SERVER_ADDR,
    )]
    pub listen: String,

    #[arg(
    long,
    help = "Seconds a request may wait for an inode lock",
    help_heading = SERVER_OPTIONS_HEADER,
    default_value = "30",
    )]
    pub lock_timeout_secs: u64,

    #[arg(
    long,
    help = "Number of threads to use for tokio async runtime",
    help_heading = SERVER_OPTIONS_HEADER,
    default_value = "8",
    )]
    pub async_work_threads: usize,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl ServeArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen:       self.listen.clone(),
            root:         self.root.clone(),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
        }
    }

    pub fn run(self) -> Result<(), Whatever> {
        let _guard = self
            .logging
            .load_logging_opts()
            .map(|opts| mftfs_utils::logger::init_global_logging("mftfs-server", &opts));
        log_versions();

        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(self.async_work_threads)
            .thread_name("mftfs-server-runtime")
            .enable_all()
            .build()
            .with_whatever_context(|e| format!("unable to built tokio runtime {e} "))?;
        runtime.block_on(serve(self.server_config()))
    }
}

async fn serve(config: ServerConfig) -> Result<(), Whatever> {
    let manager = Arc::new(CoherentManager::new(Arc::new(LocalFsManager::new(
        &config.root,
    ))));
    manager
        .start(&RequestContext::background())
        .await
        .with_whatever_context(|e| format!("failed to open {}: {e}", config.root.display()))?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_whatever_context(|e| format!("failed to listen on {}: {e}", config.listen))?;

    let shutdown = CancellationToken::new();
    let server = Arc::new(RemoteServer::new(manager.clone(), config.lock_timeout));
    let serving = tokio::spawn(server.serve(listener, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .with_whatever_context(|e| format!("failed to wait for ctrl-c: {e}"))?;
    info!("shutting down");
    shutdown.cancel();
    let _ = serving.await;
    manager
        .teardown()
        .await
        .with_whatever_context(|e| format!("failed to tear down backend: {e}"))
}
