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
    fs::{File, FileTimes, OpenOptions, Permissions},
    os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use mftfs_common::FH;
use mftfs_meta::{
    err::{HandleNotFoundSnafu, NotADirectorySnafu, NotEmptySnafu},
    HandleTable, InodeTable, NativeEntry, NativeTree, RequestContext,
};
use mftfs_types::{
    ino::Ino,
    record::{DirentKind, InodeRecord},
    setattr::SetInfoRequest,
    stamp::StampClock,
};
use snafu::{ensure, OptionExt, ResultExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    err::{IoSnafu, NotStartedSnafu, Result},
    manager::FsManager,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn entry_from_metadata(meta: &std::fs::Metadata) -> NativeEntry {
    let ctime = UNIX_EPOCH
        + Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec().max(0) as u32);
    let mtime = meta.modified().unwrap_or(ctime);
    NativeEntry {
        kind: DirentKind::from(meta.file_type()),
        size: meta.len(),
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink() as u32,
        atime: meta.accessed().unwrap_or(mtime),
        mtime,
        ctime,
        crtime: meta.created().unwrap_or(mtime),
    }
}

/// Walks a directory on the local disk.
struct LocalTree;

#[async_trait]
impl NativeTree for LocalTree {
    async fn stat(&self, path: &str) -> std::result::Result<NativeEntry, BoxError> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        Ok(entry_from_metadata(&meta))
    }

    async fn children(&self, path: &str) -> std::result::Result<Vec<String>, BoxError> {
        let mut names = vec![];
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => debug!("skip non utf-8 name {:?} under {path}", name),
            }
        }
        names.sort();
        Ok(names)
    }
}

#[derive(Debug)]
struct LocalState {
    table:   InodeTable,
    handles: HandleTable,
}

/// A directory tree on the local disk.
///
/// All state sits behind one coarse lock; native calls are made while holding
/// it.
#[derive(Debug)]
pub struct LocalFsManager {
    root:  PathBuf,
    state: Mutex<Option<LocalState>>,
    clock: StampClock,
}

impl LocalFsManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root:  root.as_ref().to_path_buf(),
            state: Mutex::new(None),
            clock: StampClock::new(),
        }
    }

    /// Re-reads native attributes into the record, keeping the tree links.
    fn refresh(record: &mut InodeRecord) -> Result<()> {
        let meta = std::fs::symlink_metadata(&record.path).context(IoSnafu { path: &record.path })?;
        let e = entry_from_metadata(&meta);
        record
            .set_mode(e.mode)
            .set_owner(e.uid, e.gid)
            .set_size(e.size)
            .set_times(e.atime, e.mtime, e.ctime);
        Ok(())
    }

    fn link_new(&self, state: &mut LocalState, parent: Ino, name: &str, path: &str) -> Result<Ino> {
        let meta = std::fs::symlink_metadata(path).context(IoSnafu { path })?;
        let ino = state
            .table
            .insert_child(parent, name, entry_from_metadata(&meta))?;
        let stamp = self.clock.tick();
        let record = state.table.get_mut(ino)?;
        record.metadata_write_time = stamp;
        record.content_write_time = stamp;
        Ok(ino)
    }
}

#[async_trait]
impl FsManager for LocalFsManager {
    async fn start(&self, _ctx: &RequestContext) -> Result<()> {
        let root = self.root.to_string_lossy().to_string();
        let table = InodeTable::build(&root, &LocalTree).await?;
        info!("local backend on {root:?} discovered {} inodes", table.len());
        *self.state.lock().await = Some(LocalState {
            table,
            handles: HandleTable::new(),
        });
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.state.lock().await.take();
        Ok(())
    }

    async fn destroy(&self) -> Result<()> { self.teardown().await }

    async fn get_size(&self, _ctx: &RequestContext) -> Result<u64> {
        let mut guard = self.state.lock().await;
        Ok(guard.as_mut().context(NotStartedSnafu)?.table.total_size())
    }

    async fn get_length(&self, _ctx: &RequestContext) -> Result<u64> {
        let mut guard = self.state.lock().await;
        Ok(guard.as_mut().context(NotStartedSnafu)?.table.len() as u64)
    }

    async fn get_info(&self, _ctx: &RequestContext, ino: Ino) -> Result<InodeRecord> {
        let mut guard = self.state.lock().await;
        Ok(guard.as_mut().context(NotStartedSnafu)?.table.get(ino)?.clone())
    }

    async fn set_info(
        &self,
        _ctx: &RequestContext,
        ino: Ino,
        req: SetInfoRequest,
    ) -> Result<InodeRecord> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let record = state.table.get_mut(ino)?;
        let path = record.path.clone();

        if let Some(mode) = req.mode {
            std::fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777))
                .context(IoSnafu { path: &path })?;
        }
        if req.touches_owner() {
            std::os::unix::fs::chown(&path, req.uid, req.gid).context(IoSnafu { path: &path })?;
        }
        if let Some(size) = req.size {
            OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|f| f.set_len(size))
                .context(IoSnafu { path: &path })?;
        }
        if req.touches_times() {
            let mut times = FileTimes::new();
            if let Some(atime) = req.atime {
                times = times.set_accessed(atime);
            }
            if let Some(mtime) = req.mtime {
                times = times.set_modified(mtime);
            }
            File::open(&path)
                .and_then(|f| f.set_times(times))
                .context(IoSnafu { path: &path })?;
        }

        Self::refresh(record)?;
        let stamp = self.clock.tick();
        record.metadata_write_time = stamp;
        if req.touches_content() {
            record.content_write_time = stamp;
        }
        Ok(record.clone())
    }

    async fn delete(&self, _ctx: &RequestContext, ino: Ino) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let (removed, dropped) = state.table.remove(ino)?;
        for gone in &dropped {
            state.handles.release_inode(*gone);
        }
        debug!("forgot {:?} ({}) and {} inodes under it", removed.path, ino, dropped.len() - 1);
        Ok(())
    }

    async fn mkdir(&self, _ctx: &RequestContext, parent: Ino, name: &str, mode: u32) -> Result<Ino> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let path = state.table.check_create(parent, name)?;
        std::fs::create_dir(&path)
            .and_then(|_| std::fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777)))
            .context(IoSnafu { path: &path })?;
        self.link_new(state, parent, name, &path)
    }

    async fn create_file(
        &self,
        _ctx: &RequestContext,
        parent: Ino,
        name: &str,
        mode: u32,
    ) -> Result<Ino> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let path = state.table.check_create(parent, name)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        self.link_new(state, parent, name, &path)
    }

    async fn rmdir(&self, _ctx: &RequestContext, ino: Ino) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let record = state.table.get(ino)?;
        ensure!(record.is_dir(), NotADirectorySnafu { ino });
        ensure!(record.children.is_empty(), NotEmptySnafu { ino });
        std::fs::remove_dir(&record.path).context(IoSnafu { path: &record.path })?;
        // empty, so nothing beneath it to release
        state.table.remove(ino)?;
        state.handles.release_inode(ino);
        Ok(())
    }

    async fn read_at(
        &self,
        _ctx: &RequestContext,
        ino: Ino,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let record = state.table.get_mut(ino)?;
        let n = File::open(&record.path)
            .and_then(|f| f.read_at(buf, offset))
            .context(IoSnafu { path: &record.path })?;
        record.atime = SystemTime::now();
        Ok(n)
    }

    async fn write_at(
        &self,
        _ctx: &RequestContext,
        ino: Ino,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let record = state.table.get_mut(ino)?;
        let n = OpenOptions::new()
            .write(true)
            .open(&record.path)
            .and_then(|f| f.write_at(data, offset))
            .context(IoSnafu { path: &record.path })?;
        let now = SystemTime::now();
        record.size = record.size.max(offset + n as u64);
        record.mtime = now;
        record.ctime = now;
        record.content_write_time = self.clock.tick();
        Ok(n)
    }

    async fn sync_file(&self, _ctx: &RequestContext, ino: Ino) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let path = &state.table.get(ino)?.path;
        OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|f| f.sync_all())
            .context(IoSnafu { path })
    }

    async fn generate_handle(&self, _ctx: &RequestContext, ino: Ino) -> Result<FH> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let record = state.table.get_mut(ino)?;
        let fh = state.handles.mint(ino);
        record.handle = fh;
        Ok(fh)
    }

    async fn delete_handle(&self, _ctx: &RequestContext, fh: FH) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let ino = state.handles.release(fh).context(HandleNotFoundSnafu { fh })?;
        if let Ok(record) = state.table.get_mut(ino) {
            if record.handle == fh {
                record.handle = 0;
            }
        }
        Ok(())
    }

    async fn resolve_handle(&self, _ctx: &RequestContext, fh: FH) -> Result<Ino> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        Ok(state.handles.resolve(fh).context(HandleNotFoundSnafu { fh })?)
    }
}
