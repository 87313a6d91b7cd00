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

mod cmd;
mod registry;

use clap::{Parser, Subcommand};
use snafu::Whatever;

use crate::cmd::{
    mount::{MountArgs, RemountArgs},
    registry::{ListArgs, UnregisterArgs},
    serve::ServeArgs,
    unmount::UmountArgs,
};

#[derive(Debug, Parser)]
#[clap(
name = "mftfs",
about = "mftfs: one mount, many backends",
version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Mount(MountArgs),
    Remount(RemountArgs),
    Serve(ServeArgs),
    Umount(UmountArgs),
    List(ListArgs),
    Unregister(UnregisterArgs),
}

fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Mount(mount_args) => mount_args.run(),
        Commands::Remount(remount_args) => remount_args.run(),
        Commands::Serve(serve_args) => serve_args.run(),
        Commands::Umount(umount_args) => umount_args.run(),
        Commands::List(list_args) => list_args.run(),
        Commands::Unregister(unregister_args) => unregister_args.run(),
    }
}
