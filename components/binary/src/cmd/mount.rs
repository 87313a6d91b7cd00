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

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;
use fuser::MountOption;
use mftfs_backend::{BackendConfig, BackendKind, CoherenceConfig, RemoteConfig};
use mftfs_common::{MFTFS, MFTFS_DEBUG_CACHE, MFTFS_DEBUG_MOUNT_POINT, MFTFS_DEBUG_SERVER_ADDR};
use mftfs_fuse::{null, DispatchConfig, FuseConfig, LookupMissPolicy, MftFuse};
use snafu::{whatever, OptionExt, ResultExt, Whatever};
use tracing::info;

use super::{log_versions, LoggingArgs};
use crate::registry::Registry;

const MOUNT_OPTIONS_HEADER: &str = "Mount options";
const BACKEND_OPTIONS_HEADER: &str = "Backend options";
const DISPATCH_OPTIONS_HEADER: &str = "Dispatch options";

/// How the mount itself behaves, shared by `mount` and `remount`.
#[derive(Debug, Clone, Args)]
pub struct MountOptions {
    #[arg(
    long,
    help = "Mount file system in read-only mode",
    help_heading = MOUNT_OPTIONS_HEADER
    )]
    pub read_only: bool,

    #[arg(
    long,
    help = "Automatically unmount on exit",
    help_heading = MOUNT_OPTIONS_HEADER,
    default_value = "true",
    )]
    pub auto_unmount: bool,

    #[arg(long, help = "Allow root user to access file system", help_heading = MOUNT_OPTIONS_HEADER)]
    pub allow_root: bool,

    #[arg(
    long,
    help = "Allow other users, including root, to access file system",
    help_heading = MOUNT_OPTIONS_HEADER,
    conflicts_with = "allow_root",
    )]
    pub allow_other: bool,

    #[arg(
    long,
    help = "Number of threads to use for tokio async runtime",
    help_heading = MOUNT_OPTIONS_HEADER,
    default_value = "8",
    )]
    pub async_work_threads: usize,

    #[arg(
    long,
    help = "Seconds a kernel request may take, 0 waits forever",
    help_heading = MOUNT_OPTIONS_HEADER,
    default_value = "30",
    )]
    pub request_timeout_secs: u64,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl MountOptions {
    fn fuse_config(&self, mount_point: &Path) -> FuseConfig {
        let mut options = vec![
            MountOption::DefaultPermissions,
            MountOption::FSName(MFTFS.to_string()),
            MountOption::NoAtime,
        ];
        if self.read_only {
            options.push(MountOption::RO);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        if self.allow_root {
            options.push(MountOption::AllowRoot);
        }
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        FuseConfig {
            mount_point:        mount_point.to_path_buf(),
            mount_options:      options,
            async_work_threads: self.async_work_threads,
            request_timeout:    (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
        }
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Mount a backend at the mount point and remember the configuration.
Examples:

# Expose a local directory
mftfs mount /tmp/mftfs --backend local --root /srv/data

# Talk to an authoritative server, caching contents locally
mftfs mount /tmp/mftfs --backend remote --server-addr 10.0.0.2:7878
")]
pub struct MountArgs {
    #[arg(
        help = "Directory to mount the fs at",
        value_name = "MOUNT_POINT",
        default_value = MFTFS_DEBUG_MOUNT_POINT
    )]
    pub mount_point: PathBuf,

    #[arg(
    long,
    help = "Backend kind: local, session or remote",
    help_heading = BACKEND_OPTIONS_HEADER,
    default_value = "local",
    )]
    pub backend: BackendKind,

    #[arg(
    long,
    help = "Directory exposed by the local backend",
    help_heading = BACKEND_OPTIONS_HEADER,
    value_name = "DIRECTORY",
    )]
    pub root: Option<PathBuf>,

    #[arg(
    long,
    help = "Storage scheme of the session backend, such as sftp",
    help_heading = BACKEND_OPTIONS_HEADER,
    default_value = "sftp",
    )]
    pub scheme: String,

    #[arg(
    long = "option",
    help = "Session option as KEY=VALUE, repeatable",
    help_heading = BACKEND_OPTIONS_HEADER,
    value_name = "KEY=VALUE",
    value_parser = parse_key_value,
    )]
    pub options: Vec<(String, String)>,

    #[arg(
    long,
    help = "Address of the authoritative server",
    help_heading = BACKEND_OPTIONS_HEADER,
    default_value = MFTFS_DEBUG_SERVER_ADDR,
    )]
    pub server_addr: String,

    #[arg(
    long,
    help = "Directory holding cached file contents",
    help_heading = BACKEND_OPTIONS_HEADER,
    default_value = MFTFS_DEBUG_CACHE,
    )]
    pub cache_dir: PathBuf,

    #[arg(
    long,
    help = "How often a declined write refreshes and tries again",
    help_heading = BACKEND_OPTIONS_HEADER,
    default_value = "3",
    )]
    pub write_retries: usize,

    #[arg(
    long,
    help = "Seconds kernel caches keep entries and attributes",
    help_heading = DISPATCH_OPTIONS_HEADER,
    default_value = "60",
    )]
    pub entry_ttl_secs: u64,

    #[arg(
    long,
    help = "Answer to a lookup of a missing name: negative-entry or not-found",
    help_heading = DISPATCH_OPTIONS_HEADER,
    default_value = "negative-entry",
    )]
    pub lookup_miss: LookupMissPolicy,

    #[arg(
    long,
    help = "Keep records of inodes the kernel forgot",
    help_heading = DISPATCH_OPTIONS_HEADER,
    )]
    pub keep_forgotten: bool,

    #[arg(long, help = "Do not remember this mount for remount")]
    pub no_register: bool,

    #[command(flatten)]
    pub mount: MountOptions,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

impl MountArgs {
    fn backend_config(&self) -> Result<BackendConfig, Whatever> {
        Ok(match self.backend {
            BackendKind::Local => BackendConfig::Local {
                root: self
                    .root
                    .clone()
                    .whatever_context("the local backend needs --root")?,
            },
            BackendKind::Session => BackendConfig::Session {
                scheme:  self.scheme.clone(),
                options: self.options.iter().cloned().collect::<HashMap<_, _>>(),
            },
            BackendKind::Remote => BackendConfig::Remote(RemoteConfig {
                addr:      self.server_addr.clone(),
                cache_dir: self.cache_dir.clone(),
                coherence: CoherenceConfig {
                    write_retries: self.write_retries,
                    ..Default::default()
                },
            }),
        })
    }

    fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            entry_ttl: Duration::from_secs(self.entry_ttl_secs),
            lookup_miss: self.lookup_miss,
            forget_deletes: !self.keep_forgotten,
            ..Default::default()
        }
    }

    pub fn run(self) -> Result<(), Whatever> {
        let _guard = self
            .mount
            .logging
            .load_logging_opts()
            .map(|opts| mftfs_utils::logger::init_global_logging("mftfs-fuse", &opts));

        let mount_point = absolute(&self.mount_point)?;
        let backend = self.backend_config()?;
        let dispatch = self.dispatch_config();
        if !self.no_register {
            let path = Registry::default_path()?;
            let mut registry = Registry::load(&path)?;
            let id = registry.register(&mount_point, backend.clone(), dispatch.clone());
            registry.save(&path)?;
            info!("registered {} as {id}", mount_point.display());
        }
        mount(self.mount.fuse_config(&mount_point), dispatch, backend)
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Mount again a file system registered by an earlier `mftfs mount`.
")]
pub struct RemountArgs {
    #[arg(help = "Mount point used before", value_name = "MOUNT_POINT")]
    pub mount_point: PathBuf,

    #[command(flatten)]
    pub mount: MountOptions,
}

impl RemountArgs {
    pub fn run(self) -> Result<(), Whatever> {
        let _guard = self
            .mount
            .logging
            .load_logging_opts()
            .map(|opts| mftfs_utils::logger::init_global_logging("mftfs-fuse", &opts));

        let mount_point = absolute(&self.mount_point)?;
        let registry = Registry::load(&Registry::default_path()?)?;
        let entry = registry.get(&mount_point).with_whatever_context(|| {
            format!("{} was never mounted by mftfs", mount_point.display())
        })?;
        info!("remounting {} [{}]", entry.id, entry.kind);
        mount(
            self.mount.fuse_config(&mount_point),
            entry.dispatch.clone(),
            entry.backend.clone(),
        )
    }
}

pub(crate) fn absolute(path: &Path) -> Result<PathBuf, Whatever> {
    std::fs::canonicalize(path)
        .with_whatever_context(|e| format!("invalid path {}: {e}", path.display()))
}

fn mount(
    fuse_config: FuseConfig,
    dispatch: DispatchConfig,
    backend: BackendConfig,
) -> Result<(), Whatever> {
    let mount_point = fuse_config.mount_point.clone();
    info!("try to mount mftfs on {:?}", &mount_point);
    log_versions();

    validate_mount_point(&mount_point)?;

    let options = fuse_config.mount_options.clone();
    let fs = MftFuse::create(fuse_config, dispatch, backend.build())?;
    fuser::mount2(fs, &mount_point, &options).with_whatever_context(|e| {
        format!("failed to mount mftfs on {}; {}", mount_point.display(), e)
    })?;
    Ok(())
}

fn validate_mount_point(path: impl AsRef<Path>) -> Result<(), Whatever> {
    let mount_point = path.as_ref();
    if !mount_point.exists() {
        whatever!("mount point {} does not exist", mount_point.display());
    }

    if !mount_point.is_dir() {
        whatever!("mount point {} is not a directory", mount_point.display());
    }

    #[cfg(target_os = "linux")]
    {
        use procfs::process::Process;

        // best effort, an unreadable mountinfo skips the check
        let mounts = match Process::myself().and_then(|me| me.mountinfo()) {
            Ok(mounts) => mounts,
            Err(e) => {
                tracing::debug!(
                    "failed to read mountinfo, not checking for existing mounts: {e:?}"
                );
                return Ok(());
            }
        };

        if mounts
            .into_iter()
            .any(|mount| mount.mount_point == path.as_ref())
        {
            whatever!("mount point {} is already mounted", path.as_ref().display());
        }
    }

    null::mount_check(path)?;

    Ok(())
}
