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

use std::path::PathBuf;

use clap::Args;
use snafu::{OptionExt, Whatever};

use super::mount::absolute;
use crate::registry::Registry;

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

List the mounts remembered for remount.
")]
pub struct ListArgs {
    #[arg(long, help = "Print the full configuration as json")]
    pub json: bool,
}

impl ListArgs {
    pub fn run(&self) -> Result<(), Whatever> {
        let registry = Registry::load(&Registry::default_path()?)?;
        for entry in registry.entries() {
            if self.json {
                match serde_json::to_string(entry) {
                    Ok(line) => println!("{line}"),
                    Err(e) => snafu::whatever!("failed to encode {}: {e}", entry.id),
                }
            } else {
                println!("{}\t{}\t{}", entry.id, entry.kind, entry.path.display());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Forget a mount remembered for remount.
")]
pub struct UnregisterArgs {
    #[arg(help = "Mount point to forget", value_name = "MOUNT_POINT")]
    pub mount_point: PathBuf,
}

impl UnregisterArgs {
    pub fn run(&self) -> Result<(), Whatever> {
        let path = Registry::default_path()?;
        let mut registry = Registry::load(&path)?;
        // the directory may be gone already, fall back to the path as given
        let mount_point = absolute(&self.mount_point).unwrap_or_else(|_| self.mount_point.clone());
        let entry = registry
            .unregister(&mount_point)
            .with_whatever_context(|| format!("{} is not registered", mount_point.display()))?;
        registry.save(&path)?;
        println!("unregistered {} ({})", entry.path.display(), entry.id);
        Ok(())
    }
}
