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

pub mod mount;
pub mod registry;
pub mod serve;
pub mod unmount;

use clap::Args;
use mftfs_utils::logger::{LoggingOptions, DEFAULT_LOG_DIR};
use tracing::info;

pub const LOGGING_OPTIONS_HEADER: &str = "Logging options";

#[derive(Debug, Clone, Args)]
pub struct LoggingArgs {
    #[clap(
    long,
    help = "Write log files to a directory",
    help_heading = LOGGING_OPTIONS_HEADER,
    value_name = "DIRECTORY",
    default_value = DEFAULT_LOG_DIR
    )]
    pub log_directory: String,

    #[clap(
    short,
    long,
    help = "Log level",
    help_heading = LOGGING_OPTIONS_HEADER,
    value_name = "LEVEL",
    default_value = "info"
    )]
    pub level: Option<String>,

    #[clap(
    long,
    help = "Append stdout to log files",
    help_heading = LOGGING_OPTIONS_HEADER,
    default_value = "true",
    )]
    pub append_stdout: bool,

    #[clap(
    long,
    help = "Disable all logging. You will still see stdout messages.",
    help_heading = LOGGING_OPTIONS_HEADER,
    conflicts_with_all(["log_directory", "level"])
    )]
    pub no_log: bool,
}

impl LoggingArgs {
    pub fn load_logging_opts(&self) -> Option<LoggingOptions> {
        if self.no_log {
            return None;
        }
        Some(LoggingOptions {
            dir:           self.log_directory.clone(),
            level:         self.level.clone(),
            append_stdout: self.append_stdout,
        })
    }
}

pub fn log_versions() {
    info!("PKG_VERSION: {}", env!("CARGO_PKG_VERSION"));
    info!("command line arguments");
    for argument in std::env::args() {
        info!("argument: {}", argument);
    }
}
