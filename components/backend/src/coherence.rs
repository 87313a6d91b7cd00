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

//! The authoritative side of the cache coherence protocol.
//!
//! Each inode carries a content-write timestamp. A client asks for the
//! content lock together with the timestamp of the copy it caches:
//!
//! * a read is granted when the client has no copy, or the server content is
//!   strictly newer than the copy. A fresh copy gets a decline and the read
//!   lock is released at once; the client serves its cache.
//! * a write is granted only when the client copy is at least as new as the
//!   server content. Anything else is declined and the write lock released.
//!
//! A granted section ends with an ack. Acking a write stamps a new content
//! time, strictly greater than every earlier one.
//!
//! Tree edits (create, link, delete) run under one structural lock. Metadata
//! and content of each inode are guarded by separate [CrewLock]s.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use dashmap::DashMap;
use mftfs_common::FH;
use mftfs_meta::{CrewLock, RequestContext};
use mftfs_types::{
    ino::Ino,
    record::InodeRecord,
    setattr::SetInfoRequest,
    stamp::{StampClock, Timestamp},
};
use tracing::{debug, instrument};

use crate::{
    err::Result,
    manager::{BackendRef, FsManager},
};

#[derive(Debug, Clone, Copy)]
struct WriteTimes {
    metadata: Timestamp,
    content:  Timestamp,
}

#[derive(Debug)]
struct InodeLocks {
    metadata: CrewLock,
    content:  CrewLock,
    times:    Mutex<WriteTimes>,
}

impl InodeLocks {
    fn times(&self) -> WriteTimes { *self.times.lock().unwrap_or_else(|e| e.into_inner()) }

    fn update(&self, f: impl FnOnce(&mut WriteTimes)) {
        f(&mut self.times.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

pub struct CoherentManager {
    inner:     BackendRef,
    structure: tokio::sync::Mutex<()>,
    locks:     DashMap<Ino, Arc<InodeLocks>>,
    clock:     StampClock,
}

impl std::fmt::Debug for CoherentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherentManager")
            .field("tracked_inodes", &self.locks.len())
            .finish()
    }
}

impl CoherentManager {
    pub fn new(inner: BackendRef) -> Self {
        Self {
            inner,
            structure: tokio::sync::Mutex::new(()),
            locks: DashMap::new(),
            clock: StampClock::new(),
        }
    }

    /// Locks of `ino`, seeded from the backend's record the first time.
    async fn locks(&self, ctx: &RequestContext, ino: Ino) -> Result<Arc<InodeLocks>> {
        if let Some(l) = self.locks.get(&ino) {
            return Ok(l.clone());
        }
        let record = self.inner.get_info(ctx, ino).await?;
        self.clock.observe(record.content_write_time);
        self.clock.observe(record.metadata_write_time);
        let entry = self.locks.entry(ino).or_insert_with(|| {
            Arc::new(InodeLocks {
                metadata: CrewLock::new(),
                content:  CrewLock::new(),
                times:    Mutex::new(WriteTimes {
                    metadata: record.metadata_write_time,
                    content:  record.content_write_time,
                }),
            })
        });
        Ok(entry.clone())
    }

    fn forget_locks(&self, ino: Ino) { self.locks.remove(&ino); }

    /// `ino` and every inode beneath it, breadth first.
    async fn subtree(&self, ctx: &RequestContext, ino: Ino) -> Result<Vec<Ino>> {
        let mut found = vec![];
        let mut queue = VecDeque::from([ino]);
        while let Some(next) = queue.pop_front() {
            let record = match self.inner.get_info(ctx, next).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() && next != ino => continue,
                Err(e) => return Err(e),
            };
            queue.extend(record.children.iter().map(|c| c.ino));
            found.push(next);
        }
        Ok(found)
    }

    #[instrument(level = "debug", skip(self, ctx), fields(req = ctx.unique))]
    pub async fn request_read(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        has_cached_copy: bool,
        cache_time: Timestamp,
    ) -> Result<bool> {
        let locks = self.locks(ctx, ino).await?;
        locks.content.request_read(ctx).await?;
        let content = locks.times().content;
        if !has_cached_copy || content > cache_time {
            return Ok(true);
        }
        debug!("cache of {ino} is fresh at {cache_time}");
        locks.content.ack_read();
        Ok(false)
    }

    /// Releases a granted read, returns the content time the reader saw.
    pub async fn ack_read(&self, ctx: &RequestContext, ino: Ino) -> Result<Timestamp> {
        let locks = self.locks(ctx, ino).await?;
        // content cannot move while the read is held, so this is the time of
        // the bytes the reader got.
        let seen = locks.times().content;
        locks.content.ack_read();
        Ok(seen)
    }

    #[instrument(level = "debug", skip(self, ctx), fields(req = ctx.unique))]
    pub async fn request_write(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        has_cached_copy: bool,
        cache_time: Timestamp,
    ) -> Result<bool> {
        let locks = self.locks(ctx, ino).await?;
        locks.content.request_write(ctx).await?;
        let content = locks.times().content;
        if has_cached_copy && cache_time >= content {
            return Ok(true);
        }
        debug!("write to {ino} declined, client at {cache_time}, server at {content}");
        locks.content.ack_write();
        Ok(false)
    }

    /// Stamps a new content time and releases a granted write.
    pub async fn ack_write(&self, ctx: &RequestContext, ino: Ino) -> Result<Timestamp> {
        let locks = self.locks(ctx, ino).await?;
        let stamped = {
            let m = locks.metadata.write(&RequestContext::background()).await;
            let stamp = self.clock.tick();
            locks.update(|t| t.content = stamp);
            drop(m);
            stamp
        };
        locks.content.ack_write();
        Ok(stamped)
    }

    fn overlay(&self, mut record: InodeRecord) -> InodeRecord {
        if let Some(l) = self.locks.get(&record.ino) {
            let times = l.times();
            record.metadata_write_time = times.metadata;
            record.content_write_time = times.content;
        }
        record
    }
}

#[async_trait]
impl FsManager for CoherentManager {
    async fn start(&self, ctx: &RequestContext) -> Result<()> { self.inner.start(ctx).await }

    async fn teardown(&self) -> Result<()> {
        self.locks.clear();
        self.inner.teardown().await
    }

    async fn destroy(&self) -> Result<()> {
        self.locks.clear();
        self.inner.destroy().await
    }

    async fn get_size(&self, ctx: &RequestContext) -> Result<u64> { self.inner.get_size(ctx).await }

    async fn get_length(&self, ctx: &RequestContext) -> Result<u64> {
        self.inner.get_length(ctx).await
    }

    async fn get_info(&self, ctx: &RequestContext, ino: Ino) -> Result<InodeRecord> {
        let locks = self.locks(ctx, ino).await?;
        let _m = locks.metadata.read(ctx).await?;
        let record = self.inner.get_info(ctx, ino).await?;
        Ok(self.overlay(record))
    }

    async fn set_info(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        req: SetInfoRequest,
    ) -> Result<InodeRecord> {
        let locks = self.locks(ctx, ino).await?;
        // a size change rewrites content, so it needs the content lock too.
        let _c = if req.touches_content() {
            Some(locks.content.write(ctx).await?)
        } else {
            None
        };
        let _m = locks.metadata.write(ctx).await?;
        let record = self.inner.set_info(ctx, ino, req.clone()).await?;
        let stamp = self.clock.tick();
        locks.update(|t| {
            t.metadata = stamp;
            if req.touches_content() {
                t.content = stamp;
            }
        });
        Ok(self.overlay(record))
    }

    async fn delete(&self, ctx: &RequestContext, ino: Ino) -> Result<()> {
        let _s = self.structure.lock().await;
        let doomed = self.subtree(ctx, ino).await?;
        // outstanding leases must ack against the locks they were granted
        // on, so wait them out before the locks go away.
        let mut held = scopeguard::guard(Vec::new(), |held: Vec<Arc<InodeLocks>>| {
            for locks in held {
                locks.content.ack_write();
            }
        });
        for i in &doomed {
            let Some(locks) = self.locks.get(i).map(|l| l.clone()) else {
                continue;
            };
            locks.content.request_write(ctx).await?;
            held.push(locks);
        }
        self.inner.delete(ctx, ino).await?;
        for i in doomed {
            self.forget_locks(i);
        }
        Ok(())
    }

    async fn mkdir(&self, ctx: &RequestContext, parent: Ino, name: &str, mode: u32) -> Result<Ino> {
        let _s = self.structure.lock().await;
        self.inner.mkdir(ctx, parent, name, mode).await
    }

    async fn create_file(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &str,
        mode: u32,
    ) -> Result<Ino> {
        let _s = self.structure.lock().await;
        self.inner.create_file(ctx, parent, name, mode).await
    }

    async fn rmdir(&self, ctx: &RequestContext, ino: Ino) -> Result<()> {
        let _s = self.structure.lock().await;
        self.inner.rmdir(ctx, ino).await?;
        self.forget_locks(ino);
        Ok(())
    }

    // callers hold the content lock through request_read / request_write.
    async fn read_at(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        self.inner.read_at(ctx, ino, buf, offset).await
    }

    async fn write_at(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        self.inner.write_at(ctx, ino, data, offset).await
    }

    async fn sync_file(&self, ctx: &RequestContext, ino: Ino) -> Result<()> {
        self.inner.sync_file(ctx, ino).await
    }

    async fn generate_handle(&self, ctx: &RequestContext, ino: Ino) -> Result<FH> {
        let _s = self.structure.lock().await;
        self.inner.generate_handle(ctx, ino).await
    }

    async fn delete_handle(&self, ctx: &RequestContext, fh: FH) -> Result<()> {
        let _s = self.structure.lock().await;
        self.inner.delete_handle(ctx, fh).await
    }

    async fn resolve_handle(&self, ctx: &RequestContext, fh: FH) -> Result<Ino> {
        self.inner.resolve_handle(ctx, fh).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mftfs_types::ino::ROOT_INO;

    use super::*;
    use crate::local::LocalFsManager;

    async fn server(dir: &std::path::Path) -> (Arc<CoherentManager>, Ino) {
        std::fs::write(dir.join("a.txt"), b"hello").unwrap();
        let local = Arc::new(LocalFsManager::new(dir));
        let m = Arc::new(CoherentManager::new(local));
        let ctx = RequestContext::background();
        m.start(&ctx).await.unwrap();
        let a = m
            .get_info(&ctx, ROOT_INO)
            .await
            .unwrap()
            .lookup_child("a.txt")
            .unwrap();
        (m, a)
    }

    #[tokio::test]
    async fn read_grant_follows_cache_age() {
        let dir = tempfile::tempdir().unwrap();
        let (m, a) = server(dir.path()).await;
        let ctx = RequestContext::background();
        let t0 = m.get_info(&ctx, a).await.unwrap().content_write_time;

        // no cached copy: granted.
        assert!(m.request_read(&ctx, a, false, Timestamp::EPOCH).await.unwrap());
        assert_eq!(m.ack_read(&ctx, a).await.unwrap(), t0);

        // older copy: granted.
        assert!(m.request_read(&ctx, a, true, Timestamp(t0.0 - 1)).await.unwrap());
        m.ack_read(&ctx, a).await.unwrap();

        // fresh copy: declined, and the read lock is already gone.
        assert!(!m.request_read(&ctx, a, true, t0).await.unwrap());
        let writer = RequestContext::background().with_timeout(Duration::from_secs(1));
        assert!(m.request_write(&writer, a, true, t0).await.unwrap());
        m.ack_write(&ctx, a).await.unwrap();
    }

    #[tokio::test]
    async fn stale_write_declines_then_refresh_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (m, a) = server(dir.path()).await;
        let ctx = RequestContext::background();
        let t0 = m.get_info(&ctx, a).await.unwrap().content_write_time;

        assert!(!m.request_write(&ctx, a, true, Timestamp(t0.0 - 1)).await.unwrap());
        assert!(!m.request_write(&ctx, a, false, t0).await.unwrap());

        let refreshed = m.get_info(&ctx, a).await.unwrap().content_write_time;
        assert!(m.request_write(&ctx, a, true, refreshed).await.unwrap());
        m.write_at(&ctx, a, b"J", 0).await.unwrap();
        let t1 = m.ack_write(&ctx, a).await.unwrap();
        assert!(t1 > t0);
        assert_eq!(m.get_info(&ctx, a).await.unwrap().content_write_time, t1);

        // the old copy is now stale for reads.
        assert!(m.request_read(&ctx, a, true, t0).await.unwrap());
        m.ack_read(&ctx, a).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_of_two_stale_writers_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (m, a) = server(dir.path()).await;
        let ctx = RequestContext::background();
        let t0 = m.get_info(&ctx, a).await.unwrap().content_write_time;

        assert!(m.request_write(&ctx, a, true, t0).await.unwrap());
        let second = {
            let m = m.clone();
            tokio::spawn(async move {
                m.request_write(&RequestContext::background(), a, true, t0)
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        m.ack_write(&ctx, a).await.unwrap();
        // the second writer saw t0 too, which is now out of date.
        assert!(!second.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_waits_for_the_write_lease() {
        let dir = tempfile::tempdir().unwrap();
        let (m, a) = server(dir.path()).await;
        let ctx = RequestContext::background();
        let t0 = m.get_info(&ctx, a).await.unwrap().content_write_time;

        assert!(m.request_write(&ctx, a, true, t0).await.unwrap());
        let deleting = {
            let m = m.clone();
            tokio::spawn(async move { m.delete(&RequestContext::background(), a).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!deleting.is_finished());

        // the lease holder still finds its locks.
        assert!(m.ack_write(&ctx, a).await.unwrap() > t0);
        deleting.await.unwrap().unwrap();
        assert!(m.get_info(&ctx, a).await.unwrap_err().is_not_found());
        assert!(m.delete(&ctx, a).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn deleting_a_directory_drops_locks_beneath_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d").join("f"), b"x").unwrap();
        let (m, _) = server(dir.path()).await;
        let ctx = RequestContext::background();
        let d = m.get_info(&ctx, ROOT_INO).await.unwrap().lookup_child("d").unwrap();
        let f = m.get_info(&ctx, d).await.unwrap().lookup_child("f").unwrap();
        assert!(m.request_read(&ctx, f, false, Timestamp::EPOCH).await.unwrap());
        m.ack_read(&ctx, f).await.unwrap();
        assert!(m.locks.contains_key(&f));

        m.delete(&ctx, d).await.unwrap();
        assert!(!m.locks.contains_key(&d));
        assert!(!m.locks.contains_key(&f));
    }

    #[tokio::test]
    async fn truncate_bumps_content_time() {
        let dir = tempfile::tempdir().unwrap();
        let (m, a) = server(dir.path()).await;
        let ctx = RequestContext::background();
        let t0 = m.get_info(&ctx, a).await.unwrap().content_write_time;
        let info = m
            .set_info(&ctx, a, SetInfoRequest::default().with_size(1))
            .await
            .unwrap();
        assert!(info.content_write_time > t0);

        let info2 = m
            .set_info(&ctx, a, SetInfoRequest::default().with_mode(0o600))
            .await
            .unwrap();
        assert_eq!(info2.content_write_time, info.content_write_time);
        assert!(info2.metadata_write_time > info.metadata_write_time);
    }
}
