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

//! Kernel requests expressed as calls on an [FsManager].
//!
//! Everything here is async and independent of the FUSE session so it can be
//! driven directly from tests; [crate::MftFuse] only converts arguments and
//! replies.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use mftfs_backend::{BackendRef, Result};
use mftfs_common::{BLOCK_SIZE, DOT, FH};
use mftfs_meta::{
    err::{AlreadyExistsSnafu, HandleNotFoundSnafu, InodeNotFoundSnafu, NotADirectorySnafu},
    RequestContext,
};
use mftfs_types::{
    ino::{Ino, ZERO_INO},
    record::{DirentKind, InodeRecord},
    setattr::SetInfoRequest,
};
use snafu::ensure;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{DispatchConfig, LookupMissPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino:  Ino,
    pub name: String,
    pub kind: DirentKind,
}

#[derive(Debug)]
pub enum Lookup {
    Found(InodeRecord),
    /// The name is absent and the policy asks for a negative entry.
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree:  u64,
    pub files:  u64,
    pub ffree:  u64,
}

pub struct Dispatcher {
    config:  DispatchConfig,
    backend: BackendRef,
    /// Entry replies the kernel still holds per inode.
    lookups: DashMap<Ino, u64>,
    /// Directory listings captured at opendir, keyed by the dir handle.
    dirs:    DashMap<FH, Vec<DirEntry>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("referenced", &self.lookups.len())
            .field("open_dirs", &self.dirs.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, backend: BackendRef) -> Self {
        Self {
            config,
            backend,
            lookups: DashMap::new(),
            dirs: DashMap::new(),
        }
    }

    pub fn entry_ttl(&self) -> Duration { self.config.entry_ttl }

    pub fn backend(&self) -> &BackendRef { &self.backend }

    /// Kernel references currently held on `ino`.
    pub fn lookup_count(&self, ino: Ino) -> u64 { self.lookups.get(&ino).map_or(0, |c| *c) }

    fn remember(&self, ino: Ino) { *self.lookups.entry(ino).or_insert(0) += 1; }

    async fn directory(&self, ctx: &RequestContext, ino: Ino) -> Result<InodeRecord> {
        let record = self.backend.get_info(ctx, ino).await?;
        ensure!(record.is_dir(), NotADirectorySnafu { ino });
        Ok(record)
    }

    /// The directory `parent`, checked to have no entry called `name`.
    async fn vacant(&self, ctx: &RequestContext, parent: Ino, name: &str) -> Result<InodeRecord> {
        let dir = self.directory(ctx, parent).await?;
        ensure!(
            dir.lookup_child(name).is_none(),
            AlreadyExistsSnafu { parent, name }
        );
        Ok(dir)
    }

    async fn check_handle(&self, ctx: &RequestContext, ino: Ino, fh: FH) -> Result<()> {
        let bound = self.backend.resolve_handle(ctx, fh).await?;
        if bound != ino {
            debug!("handle {fh} belongs to {bound}, not {ino}");
            return Err(HandleNotFoundSnafu { fh }.build().into());
        }
        Ok(())
    }

    pub async fn init(&self, ctx: &RequestContext) -> Result<()> {
        self.backend.start(ctx).await?;
        let length = self.backend.get_length(ctx).await?;
        info!("backend started with {length} inodes");
        Ok(())
    }

    /// Best effort: a failing backend must not keep the mount alive.
    pub async fn destroy(&self) {
        self.dirs.clear();
        self.lookups.clear();
        if let Err(e) = self.backend.destroy().await {
            error!("failed to destroy backend: {e}");
        }
    }

    pub async fn statfs(&self, ctx: &RequestContext) -> Result<FsStats> {
        let used = self.backend.get_size(ctx).await?;
        let count = self.backend.get_length(ctx).await?;
        let block = BLOCK_SIZE as u64;
        let blocks = (self.config.capacity / block).max(1);
        let used_blocks = used.div_ceil(block);
        Ok(FsStats {
            blocks,
            bfree: blocks.saturating_sub(used_blocks),
            files: u64::MAX,
            ffree: u64::MAX - count,
        })
    }

    #[instrument(level = "debug", skip(self, ctx), fields(req = ctx.unique))]
    pub async fn lookup(&self, ctx: &RequestContext, parent: Ino, name: &str) -> Result<Lookup> {
        let dir = self.directory(ctx, parent).await?;
        let found = if name == DOT {
            Some(parent)
        } else {
            dir.lookup_child(name)
        };
        match found {
            Some(ino) => {
                let record = self.backend.get_info(ctx, ino).await?;
                self.remember(ino);
                Ok(Lookup::Found(record))
            }
            None => match self.config.lookup_miss {
                LookupMissPolicy::NegativeEntry => Ok(Lookup::Negative),
                LookupMissPolicy::NotFound => InodeNotFoundSnafu { ino: ZERO_INO }
                    .fail()
                    .map_err(Into::into),
            },
        }
    }

    pub async fn getattr(&self, ctx: &RequestContext, ino: Ino) -> Result<InodeRecord> {
        self.backend.get_info(ctx, ino).await
    }

    pub async fn setattr(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        req: SetInfoRequest,
    ) -> Result<InodeRecord> {
        if req.is_empty() {
            return self.backend.get_info(ctx, ino).await;
        }
        self.backend.set_info(ctx, ino, req).await
    }

    /// Drops `nlookup` kernel references; the record goes once none are
    /// left.
    pub async fn forget(&self, ctx: &RequestContext, ino: Ino, nlookup: u64) -> Result<()> {
        let remaining = match self.lookups.get_mut(&ino) {
            Some(mut count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => return Ok(()),
        };
        if remaining > 0 {
            return Ok(());
        }
        self.lookups.remove_if(&ino, |_, count| *count == 0);
        if ino.is_root() || !self.config.forget_deletes {
            return Ok(());
        }
        debug!("{ino} forgotten, dropping its record");
        match self.backend.delete(ctx, ino).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn batch_forget(&self, ctx: &RequestContext, nodes: &[(Ino, u64)]) -> Result<()> {
        for (ino, nlookup) in nodes {
            if let Err(e) = self.forget(ctx, *ino, *nlookup).await {
                warn!("failed to forget {ino}: {e}");
            }
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, ctx), fields(req = ctx.unique))]
    pub async fn mkdir(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &str,
        mode: u32,
    ) -> Result<InodeRecord> {
        self.vacant(ctx, parent, name).await?;
        let ino = self.backend.mkdir(ctx, parent, name, mode).await?;
        let record = self.backend.get_info(ctx, ino).await?;
        self.remember(ino);
        Ok(record)
    }

    #[instrument(level = "debug", skip(self, ctx), fields(req = ctx.unique))]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &str,
        mode: u32,
    ) -> Result<(InodeRecord, FH)> {
        self.vacant(ctx, parent, name).await?;
        let ino = self.backend.create_file(ctx, parent, name, mode).await?;
        let fh = self.backend.generate_handle(ctx, ino).await?;
        let record = self.backend.get_info(ctx, ino).await?;
        self.remember(ino);
        Ok((record, fh))
    }

    pub async fn rmdir(&self, ctx: &RequestContext, parent: Ino, name: &str) -> Result<()> {
        let dir = self.directory(ctx, parent).await?;
        let Some(ino) = dir.lookup_child(name) else {
            return InodeNotFoundSnafu { ino: ZERO_INO }
                .fail()
                .map_err(Into::into);
        };
        self.backend.rmdir(ctx, ino).await
    }

    pub async fn opendir(&self, ctx: &RequestContext, ino: Ino) -> Result<FH> {
        let entries = self.snapshot(ctx, ino).await?;
        let fh = self.backend.generate_handle(ctx, ino).await?;
        self.dirs.insert(fh, entries);
        Ok(fh)
    }

    /// Children of `ino` followed by ".".
    async fn snapshot(&self, ctx: &RequestContext, ino: Ino) -> Result<Vec<DirEntry>> {
        let dir = self.directory(ctx, ino).await?;
        let mut entries = Vec::with_capacity(dir.children.len() + 1);
        for child in &dir.children {
            match self.backend.get_info(ctx, child.ino).await {
                Ok(record) => entries.push(DirEntry {
                    ino:  child.ino,
                    name: child.name.clone(),
                    kind: record.kind,
                }),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        entries.push(DirEntry {
            ino,
            name: DOT.to_string(),
            kind: DirentKind::Directory,
        });
        Ok(entries)
    }

    /// Entries from `offset` on, each paired with the offset that resumes
    /// right after it. Offset 0 takes a fresh snapshot.
    pub async fn readdir(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        fh: FH,
        offset: i64,
    ) -> Result<Vec<(i64, DirEntry)>> {
        self.check_handle(ctx, ino, fh).await?;
        if offset == 0 || !self.dirs.contains_key(&fh) {
            let entries = self.snapshot(ctx, ino).await?;
            self.dirs.insert(fh, entries);
        }
        let Some(entries) = self.dirs.get(&fh) else {
            return HandleNotFoundSnafu { fh }.fail().map_err(Into::into);
        };
        let start = offset.max(0) as usize;
        Ok(entries
            .iter()
            .enumerate()
            .skip(start)
            .map(|(i, e)| ((i + 1) as i64, e.clone()))
            .collect())
    }

    pub async fn releasedir(&self, ctx: &RequestContext, fh: FH) -> Result<()> {
        self.dirs.remove(&fh);
        self.backend.delete_handle(ctx, fh).await
    }

    pub async fn open(&self, ctx: &RequestContext, ino: Ino) -> Result<FH> {
        self.backend.get_info(ctx, ino).await?;
        self.backend.generate_handle(ctx, ino).await
    }

    pub async fn read(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        fh: FH,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>> {
        self.check_handle(ctx, ino, fh).await?;
        let mut buf = vec![0u8; size as usize];
        let n = self.backend.read_at(ctx, ino, &mut buf, offset).await?;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn write(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        fh: FH,
        offset: u64,
        data: &[u8],
    ) -> Result<u32> {
        self.check_handle(ctx, ino, fh).await?;
        let n = self.backend.write_at(ctx, ino, data, offset).await?;
        Ok(n as u32)
    }

    pub async fn fsync(&self, ctx: &RequestContext, ino: Ino, fh: FH) -> Result<()> {
        self.check_handle(ctx, ino, fh).await?;
        self.backend.sync_file(ctx, ino).await
    }

    /// Writes are not buffered here, so a flush only checks the handle.
    pub async fn flush(&self, ctx: &RequestContext, ino: Ino, fh: FH) -> Result<()> {
        self.check_handle(ctx, ino, fh).await
    }

    pub async fn release(&self, ctx: &RequestContext, fh: FH) -> Result<()> {
        self.backend.delete_handle(ctx, fh).await
    }
}

#[cfg(test)]
mod tests {
    use mftfs_backend::LocalFsManager;
    use mftfs_types::ToErrno;
    use mftfs_types::ino::ROOT_INO;
    use rstest::{fixture, rstest};

    use super::*;

    pub struct Env {
        pub dir:        tempfile::TempDir,
        pub dispatcher: Dispatcher,
    }

    pub async fn env_with(config: DispatchConfig) -> Env {
        mftfs_utils::logger::install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b"), b"").unwrap();
        let backend: BackendRef = Arc::new(LocalFsManager::new(dir.path()));
        let dispatcher = Dispatcher::new(config, backend);
        dispatcher.init(&RequestContext::background()).await.unwrap();
        Env { dir, dispatcher }
    }

    #[fixture]
    pub async fn env() -> Env { env_with(DispatchConfig::default()).await }

    async fn found(d: &Dispatcher, parent: Ino, name: &str) -> InodeRecord {
        match d.lookup(&RequestContext::background(), parent, name).await.unwrap() {
            Lookup::Found(record) => record,
            Lookup::Negative => panic!("{name} not found"),
        }
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_write_sync_round_trip(#[future] env: Env) {
        let env = env.await;
        let d = &env.dispatcher;
        let ctx = RequestContext::background();

        let a = found(d, ROOT_INO, "a.txt").await;
        assert_eq!(a.size, 5);
        assert!(!a.is_dir());

        let fh = d.open(&ctx, a.ino).await.unwrap();
        assert_eq!(d.read(&ctx, a.ino, fh, 0, 5).await.unwrap(), b"hello");
        assert_eq!(d.write(&ctx, a.ino, fh, 2, b"LL").await.unwrap(), 2);
        d.fsync(&ctx, a.ino, fh).await.unwrap();
        assert_eq!(d.read(&ctx, a.ino, fh, 0, 5).await.unwrap(), b"heLLo");
        d.flush(&ctx, a.ino, fh).await.unwrap();
        d.release(&ctx, fh).await.unwrap();

        assert_eq!(std::fs::read(env.dir.path().join("a.txt")).unwrap(), b"heLLo");
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handle_must_match_inode(#[future] env: Env) {
        let env = env.await;
        let d = &env.dispatcher;
        let ctx = RequestContext::background();

        let a = found(d, ROOT_INO, "a.txt").await;
        let sub = found(d, ROOT_INO, "sub").await;
        let b = found(d, sub.ino, "b").await;

        let fh = d.open(&ctx, b.ino).await.unwrap();
        let err = d.read(&ctx, a.ino, fh, 0, 5).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        let err = d.write(&ctx, a.ino, 42, 0, b"x").await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn structural_checks(#[future] env: Env) {
        let env = env.await;
        let d = &env.dispatcher;
        let ctx = RequestContext::background();
        let a = found(d, ROOT_INO, "a.txt").await;

        let err = d.mkdir(&ctx, ROOT_INO, "a.txt", 0o755).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
        let err = d.create(&ctx, a.ino, "x", 0o644).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTDIR);
        let err = d.lookup(&ctx, a.ino, "x").await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTDIR);

        let made = d.mkdir(&ctx, ROOT_INO, "made", 0o755).await.unwrap();
        assert!(made.is_dir());
        let (file, fh) = d.create(&ctx, made.ino, "f", 0o644).await.unwrap();
        assert_eq!(d.backend().resolve_handle(&ctx, fh).await.unwrap(), file.ino);

        let err = d.rmdir(&ctx, ROOT_INO, "made").await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTEMPTY);
        let err = d.rmdir(&ctx, ROOT_INO, "missing").await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);

        let root = d.getattr(&ctx, ROOT_INO).await.unwrap();
        assert!(root.index_consistent());
        let stats = d.statfs(&ctx).await.unwrap();
        assert!(stats.bfree < stats.blocks);
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readdir_resumes_after_the_last_entry(#[future] env: Env) {
        let env = env.await;
        let d = &env.dispatcher;
        let ctx = RequestContext::background();

        let fh = d.opendir(&ctx, ROOT_INO).await.unwrap();
        let all = d.readdir(&ctx, ROOT_INO, fh, 0).await.unwrap();
        let names: Vec<_> = all.iter().map(|(_, e)| e.name.as_str()).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names.last(), Some(&DOT));
        assert_eq!(names.iter().filter(|n| **n == DOT).count(), 1);

        // the kernel kept only the first entry
        let (cookie, first) = &all[0];
        let rest = d.readdir(&ctx, ROOT_INO, fh, *cookie).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|(_, e)| e != first));
        assert_eq!(rest, all[1..].to_vec());

        // a new child shows up only after rewinding to offset 0
        d.mkdir(&ctx, ROOT_INO, "late", 0o755).await.unwrap();
        let last = all.last().unwrap().0;
        assert!(d.readdir(&ctx, ROOT_INO, fh, last).await.unwrap().is_empty());
        let again = d.readdir(&ctx, ROOT_INO, fh, 0).await.unwrap();
        assert_eq!(again.len(), 4);

        d.releasedir(&ctx, fh).await.unwrap();
        assert!(d.readdir(&ctx, ROOT_INO, fh, 0).await.is_err());
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forget_deletes_after_last_reference(#[future] env: Env) {
        let env = env.await;
        let d = &env.dispatcher;
        let ctx = RequestContext::background();

        let a = found(d, ROOT_INO, "a.txt").await;
        found(d, ROOT_INO, "a.txt").await;
        assert_eq!(d.lookup_count(a.ino), 2);

        d.forget(&ctx, a.ino, 1).await.unwrap();
        assert!(d.getattr(&ctx, a.ino).await.is_ok());
        d.batch_forget(&ctx, &[(a.ino, 1)]).await.unwrap();
        assert!(d.getattr(&ctx, a.ino).await.unwrap_err().is_not_found());
        assert_eq!(d.lookup_count(a.ino), 0);

        // root is never dropped and unknown inodes are ignored
        found(d, ROOT_INO, DOT).await;
        d.forget(&ctx, ROOT_INO, 1).await.unwrap();
        assert!(d.getattr(&ctx, ROOT_INO).await.is_ok());
        d.forget(&ctx, Ino(999), 1).await.unwrap();
    }

    #[tokio::test]
    async fn forget_can_keep_records() {
        let env = env_with(DispatchConfig {
            forget_deletes: false,
            ..Default::default()
        })
        .await;
        let d = &env.dispatcher;
        let ctx = RequestContext::background();
        let a = found(d, ROOT_INO, "a.txt").await;
        d.forget(&ctx, a.ino, 1).await.unwrap();
        assert!(d.getattr(&ctx, a.ino).await.is_ok());
    }

    #[tokio::test]
    async fn lookup_miss_follows_policy() {
        let env = env_with(DispatchConfig::default()).await;
        let ctx = RequestContext::background();
        assert!(matches!(
            env.dispatcher.lookup(&ctx, ROOT_INO, "nope").await.unwrap(),
            Lookup::Negative
        ));

        let env = env_with(DispatchConfig {
            lookup_miss: LookupMissPolicy::NotFound,
            ..Default::default()
        })
        .await;
        let err = env.dispatcher.lookup(&ctx, ROOT_INO, "nope").await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }
}
