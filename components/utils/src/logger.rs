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

use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub const DEFAULT_LOG_DIR: &str = "/tmp/mftfs.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Directory for rolling log files, empty to disable file logging.
    pub dir:           String,
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level:         Option<String>,
    pub append_stdout: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            dir:           DEFAULT_LOG_DIR.to_string(),
            level:         Some("info".to_string()),
            append_stdout: true,
        }
    }
}

fn env_filter(opts: &LoggingOptions) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(opts.level.as_deref().unwrap_or("info")))
}

/// Installs the global subscriber. The returned guards flush the file
/// writers when dropped, keep them alive for the life of the process.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    let mut guards = vec![];

    let stdout_layer = if opts.append_stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_filter(env_filter(opts)),
        )
    } else {
        None
    };

    let file_layer = if !opts.dir.is_empty() {
        let appender = tracing_appender::rolling::daily(&opts.dir, app_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(opts)),
        )
    } else {
        None
    };

    // a subscriber may already be installed by an embedding program.
    let _ = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
    tracing::info!("logging started for {app_name}");

    guards
}

static INSTALL_FMT_LOG: Once = Once::new();

/// Test helper: pretty stdout logging honoring `RUST_LOG`.
pub fn install_fmt_log() {
    INSTALL_FMT_LOG.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))),
            )
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logging_writes_into_dir() {
        let dir = tempfile::tempdir().unwrap();
        let opts = LoggingOptions {
            dir:           dir.path().to_string_lossy().to_string(),
            level:         Some("info".to_string()),
            append_stdout: false,
        };
        let guards = init_global_logging("mftfs-test", &opts);
        assert_eq!(guards.len(), 1);
        drop(guards);
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
