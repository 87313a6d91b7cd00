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
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use mftfs_common::FH;
use mftfs_meta::{err::HandleNotFoundSnafu, HandleTable, RequestContext};
use mftfs_types::{
    ino::Ino, record::InodeRecord, setattr::SetInfoRequest, stamp::Timestamp,
};
use scopeguard::ScopeGuard;
use snafu::{OptionExt, ResultExt};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{cache::LocalCache, client::RpcClient, wire::Request};
use crate::{
    config::RemoteConfig,
    err::{IoSnafu, NotStartedSnafu, Result, StaleCacheSnafu},
    manager::FsManager,
};

#[derive(Debug, Default)]
struct Handles {
    table: HandleTable,
    /// The newest handle minted for each inode.
    bound: HashMap<Ino, FH>,
}

/// Talks to a [super::RemoteServer] and keeps file contents cached locally.
///
/// Reads present the cached copy's content time and are served locally when
/// the server says the copy is fresh. Writes go through only when the copy
/// is current; a declined write refreshes the time and asks again, at most
/// `write_retries` more times.
#[derive(Debug)]
pub struct RemoteFsManager {
    config:  RemoteConfig,
    client:  RwLock<Option<Arc<RpcClient>>>,
    handles: Mutex<Handles>,
    cache:   LocalCache,
}

impl RemoteFsManager {
    pub fn new(config: RemoteConfig) -> Self {
        let cache = LocalCache::new(&config.cache_dir);
        Self {
            config,
            client: RwLock::new(None),
            handles: Mutex::new(Handles::default()),
            cache,
        }
    }

    async fn client(&self) -> Result<Arc<RpcClient>> {
        self.client.read().await.clone().context(NotStartedSnafu)
    }

    fn handles(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self, ino: Ino) -> Result<()> {
        let mut handles = self.handles();
        handles.table.release_inode(ino);
        handles.bound.remove(&ino);
        drop(handles);
        self.cache.remove(ino)
    }

    fn overlay(&self, mut record: InodeRecord) -> InodeRecord {
        record.handle = self.handles().bound.get(&record.ino).copied().unwrap_or(0);
        let cached = self.cache.timestamp(record.ino);
        record.cache_valid = cached == Some(record.content_write_time);
        record.cache_time = cached.unwrap_or(Timestamp::EPOCH);
        record
    }
}

/// Hands a granted lock back if the holder goes away before acking it.
fn release_on_drop(
    client: Arc<RpcClient>,
    ino: Ino,
    write: bool,
) -> ScopeGuard<Arc<RpcClient>, impl FnOnce(Arc<RpcClient>)> {
    scopeguard::guard(client, move |client| {
        tokio::spawn(async move {
            let ctx = RequestContext::background();
            let released = if write {
                client.ack_write(&ctx, ino).await.map(|_| ())
            } else {
                client.ack_read(&ctx, ino).await.map(|_| ())
            };
            if let Err(e) = released {
                warn!("failed to release lock on {ino}: {e}");
            }
        });
    })
}

#[async_trait]
impl FsManager for RemoteFsManager {
    async fn start(&self, _ctx: &RequestContext) -> Result<()> {
        std::fs::create_dir_all(&self.config.cache_dir).context(IoSnafu {
            path: self.config.cache_dir.display().to_string(),
        })?;
        let client =
            RpcClient::connect(&self.config.addr, self.config.coherence.request_timeout).await?;
        *self.client.write().await = Some(Arc::new(client));
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        if self.client.write().await.take().is_some() {
            info!("disconnected from {}", self.config.addr);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.teardown().await?;
        *self.handles() = Handles::default();
        self.cache.clear()
    }

    async fn get_size(&self, ctx: &RequestContext) -> Result<u64> {
        self.client().await?.get_size(ctx).await
    }

    async fn get_length(&self, ctx: &RequestContext) -> Result<u64> {
        self.client().await?.get_length(ctx).await
    }

    async fn get_info(&self, ctx: &RequestContext, ino: Ino) -> Result<InodeRecord> {
        let record = self.client().await?.get_info(ctx, ino).await?;
        Ok(self.overlay(record))
    }

    async fn set_info(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        req: SetInfoRequest,
    ) -> Result<InodeRecord> {
        let resized = req.touches_content();
        let record = self.client().await?.set_info(ctx, ino, req).await?;
        if resized {
            self.cache.refresh(ino, record.content_write_time);
        }
        Ok(self.overlay(record))
    }

    // driven by a kernel forget on this mount only. Other mounts still see
    // the inode, so the server keeps its record.
    async fn delete(&self, _ctx: &RequestContext, ino: Ino) -> Result<()> { self.forget(ino) }

    async fn mkdir(&self, ctx: &RequestContext, parent: Ino, name: &str, mode: u32) -> Result<Ino> {
        let req = Request::MkDir {
            parent,
            name: name.to_string(),
            mode,
        };
        self.client().await?.create(ctx, req).await
    }

    async fn create_file(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &str,
        mode: u32,
    ) -> Result<Ino> {
        let client = self.client().await?;
        let req = Request::CreateFile {
            parent,
            name: name.to_string(),
            mode,
        };
        let ino = client.create(ctx, req).await?;
        // an empty file we just made is a current copy, so the first write
        // does not need a refresh round trip.
        let record = client.get_info(ctx, ino).await?;
        self.cache.refresh(ino, record.content_write_time);
        Ok(ino)
    }

    async fn rmdir(&self, ctx: &RequestContext, ino: Ino) -> Result<()> {
        self.client().await?.exec(ctx, Request::RmDir { ino }).await?;
        self.forget(ino)
    }

    #[instrument(level = "debug", skip(self, ctx, buf), fields(req = ctx.unique, len = buf.len()))]
    async fn read_at(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let client = self.client().await?;
        let (has_cached_copy, cache_time) = self.cache.read_hint(ino, offset, buf.len() as u64);
        if !client
            .request_read(ctx, ino, has_cached_copy, cache_time)
            .await?
        {
            debug!("serving {ino} from cache at {cache_time}");
            return self.cache.load(ino, buf, offset);
        }

        let release = release_on_drop(client.clone(), ino, false);
        let fetched = client.read_at(ctx, ino, buf.len() as u32, offset).await;
        let client = ScopeGuard::into_inner(release);
        let stamp = client.ack_read(&RequestContext::background(), ino).await;
        let data = fetched?;
        let stamp = stamp?;

        self.cache.store(ino, stamp, offset, &data, buf.len())?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    #[instrument(level = "debug", skip(self, ctx, data), fields(req = ctx.unique, len = data.len()))]
    async fn write_at(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        let client = self.client().await?;
        let attempts = self.config.coherence.write_retries + 1;
        for attempt in 0..attempts {
            let cached = self.cache.timestamp(ino);
            let cache_time = cached.unwrap_or(Timestamp::EPOCH);
            if client
                .request_write(ctx, ino, cached.is_some(), cache_time)
                .await?
            {
                let release = release_on_drop(client.clone(), ino, true);
                let written = client.write_at(ctx, ino, data, offset).await;
                let client = ScopeGuard::into_inner(release);
                let stamp = client.ack_write(&RequestContext::background(), ino).await;
                let n = written?;
                let stamp = stamp?;
                self.cache
                    .record_write(ino, cache_time, stamp, offset, &data[..n.min(data.len())])?;
                return Ok(n);
            }
            debug!(attempt, "write to {ino} declined, refreshing cache time");
            let record = client.get_info(ctx, ino).await?;
            self.cache.refresh(ino, record.content_write_time);
        }
        StaleCacheSnafu { ino, attempts }.fail()
    }

    async fn sync_file(&self, ctx: &RequestContext, ino: Ino) -> Result<()> {
        self.client().await?.exec(ctx, Request::SyncFile { ino }).await
    }

    async fn generate_handle(&self, _ctx: &RequestContext, ino: Ino) -> Result<FH> {
        let mut handles = self.handles();
        let fh = handles.table.mint(ino);
        handles.bound.insert(ino, fh);
        Ok(fh)
    }

    async fn delete_handle(&self, _ctx: &RequestContext, fh: FH) -> Result<()> {
        let mut handles = self.handles();
        let ino = handles.table.release(fh).context(HandleNotFoundSnafu { fh })?;
        if handles.bound.get(&ino) == Some(&fh) {
            handles.bound.remove(&ino);
        }
        Ok(())
    }

    async fn resolve_handle(&self, _ctx: &RequestContext, fh: FH) -> Result<Ino> {
        Ok(self
            .handles()
            .table
            .resolve(fh)
            .context(HandleNotFoundSnafu { fh })?)
    }
}
