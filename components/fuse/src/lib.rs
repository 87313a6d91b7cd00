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

mod config;
pub mod dispatcher;
mod err;
pub mod null;

use std::{
    ffi::{OsStr, OsString},
    sync::Arc,
    time::SystemTime,
};

pub use config::{DispatchConfig, FuseConfig, LookupMissPolicy};
pub use dispatcher::Dispatcher;
use dispatcher::Lookup;
pub use err::FuseError;
use fuser::{
    fuse_forget_one, FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use mftfs_backend::BackendRef;
use mftfs_common::{BLOCK_SIZE, MAX_NAME_LENGTH};
use mftfs_meta::RequestContext;
use mftfs_types::{
    ino::{Ino, ZERO_INO},
    record::{DirentKind, InodeRecord},
    setattr::SetInfoRequest,
    ToErrno,
};
use snafu::{ResultExt, Whatever};
use tokio::runtime;
use tracing::{debug, error, field, info, instrument, Instrument};

/// Checks a kernel supplied name and borrows it as utf-8.
fn checked_name(name: &OsStr) -> Result<&str, FuseError> {
    let name = name.to_str().ok_or_else(|| FuseError::ErrInvalidFileName {
        name: name.to_owned(),
    })?;
    if name.len() > MAX_NAME_LENGTH {
        return Err(FuseError::ErrFilenameTooLong {
            name: OsString::from(name),
        });
    }
    Ok(name)
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn negative_attr() -> FileAttr {
    InodeRecord::new(ZERO_INO, ZERO_INO, "", "", DirentKind::Unknown).to_fuse_attr()
}

/// Bridges the blocking [Filesystem] callbacks onto the async [Dispatcher].
#[derive(Debug)]
pub struct MftFuse {
    config:     FuseConfig,
    dispatcher: Arc<Dispatcher>,
    runtime:    runtime::Runtime,
}

impl MftFuse {
    pub fn create(
        fuse_config: FuseConfig,
        dispatch_config: DispatchConfig,
        backend: BackendRef,
    ) -> Result<Self, Whatever> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(fuse_config.async_work_threads)
            .thread_name("mftfs-fuse-async-runtime")
            .thread_stack_size(32 << 20)
            .enable_all()
            .build()
            .with_whatever_context(|e| format!("unable to built tokio runtime {e} "))?;
        info!(
            "build tokio runtime with {} working threads",
            fuse_config.async_work_threads
        );
        Ok(Self {
            config: fuse_config,
            dispatcher: Arc::new(Dispatcher::new(dispatch_config, backend)),
            runtime,
        })
    }

    fn context(&self, req: &Request<'_>) -> RequestContext {
        let ctx = RequestContext::from(req);
        match self.config.request_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    fn reply_entry(&self, reply: ReplyEntry, record: &InodeRecord) {
        reply.entry(&self.dispatcher.entry_ttl(), &record.to_fuse_attr(), 0);
    }
}

impl Filesystem for MftFuse {
    fn init(&mut self, req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("init mftfs...");
        let ctx = RequestContext::from(req);
        self.runtime
            .block_on(self.dispatcher.init(&ctx).in_current_span())
            .map_err(|e| {
                error!("failed to start backend: {e}");
                e.to_errno()
            })
    }

    fn destroy(&mut self) {
        info!("destroy mftfs...");
        self.runtime
            .block_on(self.dispatcher.destroy().in_current_span());
    }

    #[instrument(level="info", skip_all, fields(req=req.unique(), ino=parent, name=?name))]
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let ctx = self.context(req);
        let name = match checked_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        match self.runtime.block_on(
            self.dispatcher
                .lookup(&ctx, Ino(parent), name)
                .in_current_span(),
        ) {
            Ok(Lookup::Found(record)) => self.reply_entry(reply, &record),
            Ok(Lookup::Negative) => {
                reply.entry(&self.dispatcher.entry_ttl(), &negative_attr(), 0)
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="debug", skip_all, fields(req=req.unique(), ino=ino, nlookup=nlookup))]
    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        let ctx = self.context(req);
        if let Err(e) = self.runtime.block_on(
            self.dispatcher
                .forget(&ctx, Ino(ino), nlookup)
                .in_current_span(),
        ) {
            error!("forget {:?} {:?}", Ino(ino), e);
        }
    }

    #[instrument(level="debug", skip_all, fields(req=req.unique(), count=nodes.len()))]
    fn batch_forget(&mut self, req: &Request<'_>, nodes: &[fuse_forget_one]) {
        let ctx = self.context(req);
        let nodes = nodes
            .iter()
            .map(|n| (Ino(n.nodeid), n.nlookup))
            .collect::<Vec<_>>();
        if let Err(e) = self.runtime.block_on(
            self.dispatcher
                .batch_forget(&ctx, &nodes)
                .in_current_span(),
        ) {
            error!("batch forget {:?}", e);
        }
    }

    #[instrument(level="info", skip_all, fields(req=req.unique(), ino=ino, name=field::Empty))]
    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let ctx = self.context(req);
        match self
            .runtime
            .block_on(self.dispatcher.getattr(&ctx, Ino(ino)).in_current_span())
        {
            Ok(record) => reply.attr(&self.dispatcher.entry_ttl(), &record.to_fuse_attr()),
            Err(e) => {
                error!("getattr {:?} {:?}", ino, e);
                reply.error(e.to_errno())
            }
        };
    }

    #[instrument(level="warn", skip_all, fields(req=req.unique(), ino=ino, name=field::Empty))]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ctx = self.context(req);
        let mut request = SetInfoRequest::default()
            .with_owner(uid, gid)
            .with_times(atime.map(time_or_now), mtime.map(time_or_now));
        if let Some(mode) = mode {
            request = request.with_mode(mode);
        }
        if let Some(size) = size {
            request = request.with_size(size);
        }
        match self.runtime.block_on(
            self.dispatcher
                .setattr(&ctx, Ino(ino), request)
                .in_current_span(),
        ) {
            Ok(record) => reply.attr(&self.dispatcher.entry_ttl(), &record.to_fuse_attr()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=req.unique(), parent=parent, name=?name))]
    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let ctx = self.context(req);
        let name = match checked_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match self.runtime.block_on(
            self.dispatcher
                .mkdir(&ctx, Ino(parent), name, mode & !umask)
                .in_current_span(),
        ) {
            Ok(record) => self.reply_entry(reply, &record),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=req.unique(), parent=parent, name=?name))]
    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let ctx = self.context(req);
        let name = match checked_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match self.runtime.block_on(
            self.dispatcher
                .create(&ctx, Ino(parent), name, mode & !umask)
                .in_current_span(),
        ) {
            Ok((record, fh)) => reply.created(
                &self.dispatcher.entry_ttl(),
                &record.to_fuse_attr(),
                0,
                fh,
                flags as u32,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=req.unique(), parent=parent, name=?name))]
    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = self.context(req);
        let name = match checked_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match self.runtime.block_on(
            self.dispatcher
                .rmdir(&ctx, Ino(parent), name)
                .in_current_span(),
        ) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="info", skip_all, fields(req=req.unique(), ino=ino))]
    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = self.context(req);
        match self
            .runtime
            .block_on(self.dispatcher.opendir(&ctx, Ino(ino)).in_current_span())
        {
            Ok(fh) => reply.opened(fh, flags as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="info", skip_all, fields(req=req.unique(), ino=ino, fh=fh, offset=offset))]
    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ctx = self.context(req);
        let entries = match self.runtime.block_on(
            self.dispatcher
                .readdir(&ctx, Ino(ino), fh, offset)
                .in_current_span(),
        ) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        debug!("get entry length: {}", entries.len());
        for (next, entry) in entries {
            // buffer full, this entry was not taken
            if reply.add(entry.ino.0, next, entry.kind.to_file_type(), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    #[instrument(level="info", skip_all, fields(req=req.unique(), ino=_ino, fh=fh))]
    fn releasedir(&mut self, req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let ctx = self.context(req);
        match self
            .runtime
            .block_on(self.dispatcher.releasedir(&ctx, fh).in_current_span())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=req.unique(), ino=ino, pid=req.pid()))]
    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = self.context(req);
        match self
            .runtime
            .block_on(self.dispatcher.open(&ctx, Ino(ino)).in_current_span())
        {
            Ok(fh) => reply.opened(fh, flags as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=req.unique(), ino=ino, fh=fh, offset=offset, size=size))]
    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let ctx = self.context(req);
        match self.runtime.block_on(
            self.dispatcher
                .read(&ctx, Ino(ino), fh, offset.max(0) as u64, size)
                .in_current_span(),
        ) {
            Ok(data) => {
                debug!("read {:?} FH: {:?} offset: {:?} read_count: {:?}", Ino(ino), fh, offset, data.len());
                reply.data(&data);
            }
            Err(e) => {
                error!("read {:?} {:?}", Ino(ino), e);
                reply.error(e.to_errno())
            }
        }
    }

    #[instrument(level="debug", skip_all, fields(req=req.unique(), ino=ino, fh=fh, offset=offset, length=data.len(), pid=req.pid()))]
    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let ctx = self.context(req);
        match self.runtime.block_on(
            self.dispatcher
                .write(&ctx, Ino(ino), fh, offset.max(0) as u64, data)
                .in_current_span(),
        ) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="info", skip_all, fields(req=req.unique(), ino=ino, fh=fh, pid=req.pid()))]
    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let ctx = self.context(req);
        match self
            .runtime
            .block_on(self.dispatcher.flush(&ctx, Ino(ino), fh).in_current_span())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="info", skip_all, fields(req=req.unique(), ino=_ino, fh=fh))]
    fn release(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let ctx = self.context(req);
        match self
            .runtime
            .block_on(self.dispatcher.release(&ctx, fh).in_current_span())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=req.unique(), ino=ino, fh=fh, datasync=_datasync))]
    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let ctx = self.context(req);
        match self
            .runtime
            .block_on(self.dispatcher.fsync(&ctx, Ino(ino), fh).in_current_span())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[instrument(level="info", skip_all, fields(req=req.unique(), ino=_ino))]
    fn statfs(&mut self, req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let ctx = self.context(req);
        match self
            .runtime
            .block_on(self.dispatcher.statfs(&ctx).in_current_span())
        {
            Ok(stats) => reply.statfs(
                stats.blocks,
                // bfree and bavail, nothing is reserved for root
                stats.bfree,
                stats.bfree,
                stats.files,
                stats.ffree,
                BLOCK_SIZE as u32,
                MAX_NAME_LENGTH as u32,
                BLOCK_SIZE as u32,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_checked() {
        assert_eq!(checked_name(OsStr::new("a.txt")).unwrap(), "a.txt");
        let long = "x".repeat(MAX_NAME_LENGTH + 1);
        assert_eq!(
            checked_name(OsStr::new(&long)).unwrap_err().to_errno(),
            libc::ENAMETOOLONG
        );
    }

    #[test]
    fn negative_entries_carry_inode_zero() {
        assert_eq!(negative_attr().ino, 0);
    }
}
