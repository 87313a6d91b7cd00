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

//! A tree reached through a remote session (SFTP and friends) by way of an
//! [opendal::Operator].
//!
//! The session protocol only stores names and bytes. Mode, ownership and
//! times are kept on the in-memory records, sizes are changed by rewriting
//! the object.

use std::{collections::HashMap, str::FromStr, time::SystemTime};

use async_trait::async_trait;
use mftfs_common::{DEFAULT_MAX_OBJECT_SIZE, FH};
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
use opendal::{EntryMode, ErrorKind, Operator, Scheme};
use snafu::{ensure, OptionExt, ResultExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    err::{FileTooLargeSnafu, NotStartedSnafu, Result, SessionSnafu},
    manager::FsManager,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn dir_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

fn is_root(path: &str) -> bool { path.is_empty() || path == "/" }

fn new_entry(kind: DirentKind, mode: u32, size: u64, mtime: SystemTime) -> NativeEntry {
    let mut e = NativeEntry::new(kind, mode, mftfs_utils::uid(), mftfs_utils::gid());
    e.size = size;
    e.mtime = mtime;
    e.ctime = mtime;
    e
}

struct SessionTree {
    op: Operator,
}

#[async_trait]
impl NativeTree for SessionTree {
    async fn stat(&self, path: &str) -> std::result::Result<NativeEntry, BoxError> {
        if is_root(path) {
            return Ok(new_entry(DirentKind::Directory, 0o755, 0, SystemTime::now()));
        }
        let meta = match self.op.stat(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => self.op.stat(&dir_path(path)).await?,
            Err(e) => return Err(e.into()),
        };
        let mtime = meta
            .last_modified()
            .map(SystemTime::from)
            .unwrap_or_else(SystemTime::now);
        Ok(match meta.mode() {
            EntryMode::DIR => new_entry(DirentKind::Directory, 0o755, 0, mtime),
            EntryMode::FILE => new_entry(DirentKind::File, 0o644, meta.content_length(), mtime),
            EntryMode::Unknown => new_entry(DirentKind::Unknown, 0o644, 0, mtime),
        })
    }

    async fn children(&self, path: &str) -> std::result::Result<Vec<String>, BoxError> {
        let dir = dir_path(path);
        let listed = self.op.list(&dir).await?;
        let mut names = listed
            .iter()
            .filter(|e| e.path() != dir && e.path() != dir.trim_start_matches('/'))
            .map(|e| e.name().trim_end_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[derive(Debug)]
enum Source {
    Config {
        scheme:  String,
        options: HashMap<String, String>,
    },
    Operator(Operator),
}

#[derive(Debug)]
struct SessionState {
    op:      Operator,
    table:   InodeTable,
    handles: HandleTable,
}

#[derive(Debug)]
pub struct SessionFsManager {
    source:          Source,
    state:           Mutex<Option<SessionState>>,
    clock:           StampClock,
    max_object_size: u64,
}

impl SessionFsManager {
    pub fn new(scheme: &str, options: HashMap<String, String>) -> Self {
        Self {
            source:          Source::Config {
                scheme: scheme.to_string(),
                options,
            },
            state:           Mutex::new(None),
            clock:           StampClock::new(),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }

    /// Uses an already configured operator, mostly for tests.
    pub fn from_operator(op: Operator) -> Self {
        Self {
            source:          Source::Operator(op),
            state:           Mutex::new(None),
            clock:           StampClock::new(),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }

    /// Objects are rebuilt in memory on every write, so they are capped.
    pub fn with_max_object_size(mut self, limit: u64) -> Self {
        self.max_object_size = limit;
        self
    }

    fn checked_len(&self, ino: Ino, size: u128) -> Result<usize> {
        ensure!(
            size <= self.max_object_size as u128,
            FileTooLargeSnafu {
                ino,
                size,
                limit: self.max_object_size,
            }
        );
        Ok(size as usize)
    }

    fn open(&self) -> Result<Operator> {
        match &self.source {
            Source::Config { scheme, options } => {
                let s = Scheme::from_str(scheme).context(SessionSnafu { path: scheme })?;
                Operator::via_map(s, options.clone()).context(SessionSnafu { path: scheme })
            }
            Source::Operator(op) => Ok(op.clone()),
        }
    }

    async fn read_all(op: &Operator, path: &str) -> Result<Vec<u8>> {
        match op.read(path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e).context(SessionSnafu { path }),
        }
    }

    fn link_new(
        &self,
        state: &mut SessionState,
        parent: Ino,
        name: &str,
        entry: NativeEntry,
    ) -> Result<Ino> {
        let ino = state.table.insert_child(parent, name, entry)?;
        let stamp = self.clock.tick();
        let record = state.table.get_mut(ino)?;
        record.metadata_write_time = stamp;
        record.content_write_time = stamp;
        Ok(ino)
    }
}

#[async_trait]
impl FsManager for SessionFsManager {
    async fn start(&self, _ctx: &RequestContext) -> Result<()> {
        let op = self.open()?;
        let table = InodeTable::build("/", &SessionTree { op: op.clone() }).await?;
        info!(
            "session backend [{}] discovered {} inodes",
            op.info().scheme(),
            table.len()
        );
        *self.state.lock().await = Some(SessionState {
            op,
            table,
            handles: HandleTable::new(),
        });
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        if let Some(state) = self.state.lock().await.take() {
            debug!("closing session to [{}]", state.op.info().scheme());
        }
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
        let state = guard.as_mut().context(NotStartedSnafu)?;
        Ok(state.table.get(ino)?.clone())
    }

    async fn set_info(
        &self,
        _ctx: &RequestContext,
        ino: Ino,
        req: SetInfoRequest,
    ) -> Result<InodeRecord> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let path = state.table.get(ino)?.path.clone();
        if let Some(size) = req.size {
            let size = self.checked_len(ino, size as u128)?;
            let mut content = Self::read_all(&state.op, &path).await?;
            content.resize(size, 0);
            state
                .op
                .write(&path, content)
                .await
                .context(SessionSnafu { path: &path })?;
        }

        let stamp = self.clock.tick();
        let record = state.table.get_mut(ino)?;
        req.apply_to(record);
        record.metadata_write_time = stamp;
        if req.touches_content() {
            record.mtime = SystemTime::now();
            record.content_write_time = stamp;
        }
        Ok(record.clone())
    }

    async fn delete(&self, _ctx: &RequestContext, ino: Ino) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let (_, dropped) = state.table.remove(ino)?;
        for gone in dropped {
            state.handles.release_inode(gone);
        }
        Ok(())
    }

    async fn mkdir(&self, ctx: &RequestContext, parent: Ino, name: &str, mode: u32) -> Result<Ino> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let path = state.table.check_create(parent, name)?;
        state
            .op
            .create_dir(&dir_path(&path))
            .await
            .context(SessionSnafu { path: &path })?;
        let entry = NativeEntry::new(DirentKind::Directory, mode, ctx.uid, ctx.gid);
        self.link_new(state, parent, name, entry)
    }

    async fn create_file(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &str,
        mode: u32,
    ) -> Result<Ino> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let path = state.table.check_create(parent, name)?;
        state
            .op
            .write(&path, Vec::<u8>::new())
            .await
            .context(SessionSnafu { path: &path })?;
        let entry = NativeEntry::new(DirentKind::File, mode, ctx.uid, ctx.gid);
        self.link_new(state, parent, name, entry)
    }

    async fn rmdir(&self, _ctx: &RequestContext, ino: Ino) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        let record = state.table.get(ino)?;
        ensure!(record.is_dir(), NotADirectorySnafu { ino });
        ensure!(record.children.is_empty(), NotEmptySnafu { ino });
        let path = dir_path(&record.path);
        state
            .op
            .delete(&path)
            .await
            .context(SessionSnafu { path: &path })?;
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
        let path = state.table.get(ino)?.path.clone();
        let content = Self::read_all(&state.op, &path).await?;
        let start = (offset as usize).min(content.len());
        let n = buf.len().min(content.len() - start);
        buf[..n].copy_from_slice(&content[start..start + n]);
        state.table.get_mut(ino)?.atime = SystemTime::now();
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
        let path = state.table.get(ino)?.path.clone();
        let end = self.checked_len(ino, offset as u128 + data.len() as u128)?;
        let start = end - data.len();
        let mut content = Self::read_all(&state.op, &path).await?;
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        let size = content.len() as u64;
        state
            .op
            .write(&path, content)
            .await
            .context(SessionSnafu { path: &path })?;

        let record = state.table.get_mut(ino)?;
        let now = SystemTime::now();
        record.size = size;
        record.mtime = now;
        record.ctime = now;
        record.content_write_time = self.clock.tick();
        Ok(data.len())
    }

    // every write is already a whole-object upload.
    async fn sync_file(&self, _ctx: &RequestContext, ino: Ino) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().context(NotStartedSnafu)?;
        state.table.get(ino)?;
        Ok(())
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

#[cfg(test)]
mod tests {
    use mftfs_types::{ino::ROOT_INO, ToErrno};

    use super::*;

    fn memory() -> Operator {
        let mut builder = opendal::services::Memory::default();
        builder.root("/");
        Operator::new(builder).unwrap().finish()
    }

    async fn seeded() -> (Operator, SessionFsManager) {
        let op = memory();
        op.write("a.txt", b"hello".to_vec()).await.unwrap();
        op.create_dir("d/").await.unwrap();
        op.write("d/b.txt", b"xy".to_vec()).await.unwrap();
        let m = SessionFsManager::from_operator(op.clone());
        m.start(&RequestContext::background()).await.unwrap();
        (op, m)
    }

    #[tokio::test]
    async fn discovers_session_tree() {
        let (_op, m) = seeded().await;
        let ctx = RequestContext::background();
        assert_eq!(m.get_length(&ctx).await.unwrap(), 4);
        let root = m.get_info(&ctx, ROOT_INO).await.unwrap();
        let d = root.lookup_child("d").unwrap();
        let d = m.get_info(&ctx, d).await.unwrap();
        assert!(d.is_dir());
        let b = m.get_info(&ctx, d.lookup_child("b.txt").unwrap()).await.unwrap();
        assert_eq!(b.size, 2);
    }

    #[tokio::test]
    async fn write_is_read_modify_write() {
        let (op, m) = seeded().await;
        let ctx = RequestContext::background();
        let a = m
            .get_info(&ctx, ROOT_INO)
            .await
            .unwrap()
            .lookup_child("a.txt")
            .unwrap();
        assert_eq!(m.write_at(&ctx, a, b"LL", 2).await.unwrap(), 2);
        m.sync_file(&ctx, a).await.unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(m.read_at(&ctx, a, &mut buf, 0).await.unwrap(), 5);
        assert_eq!(&buf, b"heLLo");
        assert_eq!(op.read("a.txt").await.unwrap(), b"heLLo".to_vec());

        // past the end reads nothing.
        assert_eq!(m.read_at(&ctx, a, &mut buf, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_and_truncate() {
        let (op, m) = seeded().await;
        let ctx = RequestContext::background();
        let f = m.create_file(&ctx, ROOT_INO, "n.txt", 0o600).await.unwrap();
        m.write_at(&ctx, f, b"abcdef", 0).await.unwrap();
        let info = m
            .set_info(&ctx, f, SetInfoRequest::default().with_size(3).with_mode(0o644))
            .await
            .unwrap();
        assert_eq!(info.size, 3);
        assert_eq!(info.mode, 0o644);
        assert_eq!(op.read("n.txt").await.unwrap(), b"abc".to_vec());
    }

    #[tokio::test]
    async fn oversized_writes_are_refused() {
        let op = memory();
        op.write("a.txt", b"hello".to_vec()).await.unwrap();
        let m = SessionFsManager::from_operator(op.clone()).with_max_object_size(8);
        let ctx = RequestContext::background();
        m.start(&ctx).await.unwrap();
        let a = m
            .get_info(&ctx, ROOT_INO)
            .await
            .unwrap()
            .lookup_child("a.txt")
            .unwrap();

        let err = m.write_at(&ctx, a, b"x", 1 << 44).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EFBIG);
        let err = m.write_at(&ctx, a, b"x", u64::MAX).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EFBIG);
        let err = m
            .set_info(&ctx, a, SetInfoRequest::default().with_size(9))
            .await
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EFBIG);
        assert_eq!(op.read("a.txt").await.unwrap(), b"hello".to_vec());
        assert_eq!(m.get_info(&ctx, a).await.unwrap().size, 5);

        // right up to the limit is fine.
        assert_eq!(m.write_at(&ctx, a, b"!!!", 5).await.unwrap(), 3);
        assert_eq!(op.read("a.txt").await.unwrap(), b"hello!!!".to_vec());
    }

    #[tokio::test]
    async fn mkdir_and_rmdir() {
        let (_op, m) = seeded().await;
        let ctx = RequestContext::background();
        let d = m.mkdir(&ctx, ROOT_INO, "e", 0o755).await.unwrap();
        assert!(m.get_info(&ctx, d).await.unwrap().is_dir());
        let err = m.mkdir(&ctx, ROOT_INO, "e", 0o755).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
        m.rmdir(&ctx, d).await.unwrap();
        assert_eq!(
            m.get_info(&ctx, ROOT_INO).await.unwrap().lookup_child("e"),
            None
        );
    }
}
