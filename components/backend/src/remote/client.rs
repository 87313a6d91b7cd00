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
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use mftfs_meta::RequestContext;
use mftfs_types::{
    ino::Ino, record::InodeRecord, setattr::SetInfoRequest, stamp::Timestamp,
};
use snafu::{OptionExt, ResultExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, instrument, warn};

use super::wire::{self, Envelope, Request, Response};
use crate::err::{ConnectionClosedSnafu, Result, TransportSnafu, UnexpectedResponseSnafu};

#[derive(Debug, Clone, Copy)]
enum LockKind {
    Read,
    Write,
}

struct Pending {
    reply: oneshot::Sender<Response>,
    /// Set on lock requests so that a grant nobody waits for any more can be
    /// handed back.
    lock:  Option<(Ino, LockKind)>,
}

struct Shared {
    tx:      mpsc::Sender<Bytes>,
    pending: DashMap<u64, Pending>,
    next_id: AtomicU64,
    closed:  CancellationToken,
}

impl Shared {
    fn next_id(&self) -> u64 { self.next_id.fetch_add(1, Ordering::Relaxed) }

    fn dispatch(&self, envelope: Envelope<Response>) {
        let Some((_, pending)) = self.pending.remove(&envelope.id) else {
            debug!("dropping answer #{} nobody waits for", envelope.id);
            return;
        };
        let Err(body) = pending.reply.send(envelope.body) else {
            return;
        };
        if let (Some((ino, kind)), Response::Granted(true)) = (pending.lock, body) {
            warn!("releasing abandoned {kind:?} lock on {ino}");
            let body = match kind {
                LockKind::Read => Request::AckRead { ino },
                LockKind::Write => Request::AckWrite { ino },
            };
            let envelope = Envelope {
                id: self.next_id(),
                timeout_ms: None,
                body,
            };
            match envelope.encode() {
                Ok(frame) => {
                    if self.tx.try_send(frame).is_err() {
                        warn!("could not release lock on {ino}, connection busy or gone");
                    }
                }
                Err(e) => warn!("failed to encode lock release: {e}"),
            }
        }
    }
}

/// One multiplexed connection to the server. Requests carry ids and may
/// complete out of order.
pub struct RpcClient {
    peer:    String,
    shared:  Arc<Shared>,
    timeout: Duration,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.peer)
            .field("in_flight", &self.shared.pending.len())
            .finish()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) { self.shared.closed.cancel(); }
}

impl RpcClient {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context(TransportSnafu)?;
        stream.set_nodelay(true).context(TransportSnafu)?;
        let (rd, wr) = stream.into_split();
        let mut frames = FramedRead::new(rd, wire::codec());
        let mut sink = FramedWrite::new(wr, wire::codec());

        let (tx, mut rx) = mpsc::channel::<Bytes>(128);
        let shared = Arc::new(Shared {
            tx,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!("failed to send request: {e}");
                    break;
                }
            }
        });

        let reader = shared.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    f = frames.next() => f,
                    _ = reader.closed.cancelled() => break,
                };
                match frame {
                    Some(Ok(frame)) => match Envelope::<Response>::decode(&frame) {
                        Ok(envelope) => reader.dispatch(envelope),
                        Err(e) => {
                            warn!("undecodable answer from server: {e}");
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        warn!("connection to server broken: {e}");
                        break;
                    }
                    None => {
                        info!("server closed the connection");
                        break;
                    }
                }
            }
            reader.closed.cancel();
            // waking every caller with a closed channel
            reader.pending.clear();
        });

        info!("connected to {addr}");
        Ok(Self {
            peer: addr.to_string(),
            shared,
            timeout,
        })
    }

    pub fn is_closed(&self) -> bool { self.shared.closed.is_cancelled() }

    #[instrument(level = "trace", skip_all, fields(req = ctx.unique, op = req.name()))]
    pub async fn call(&self, ctx: &RequestContext, req: Request) -> Result<Response> {
        snafu::ensure!(!self.is_closed(), ConnectionClosedSnafu);
        let timeout = ctx
            .remaining()
            .map_or(self.timeout, |left| left.min(self.timeout));
        let lock = match &req {
            Request::RequestRead { ino, .. } => Some((*ino, LockKind::Read)),
            Request::RequestWrite { ino, .. } => Some((*ino, LockKind::Write)),
            _ => None,
        };
        let id = self.shared.next_id();
        let frame = Envelope {
            id,
            timeout_ms: Some(timeout.as_millis() as u64),
            body: req,
        }
        .encode()?;

        let (reply, answer) = oneshot::channel();
        self.shared.pending.insert(id, Pending { reply, lock });
        if self.shared.tx.send(frame).await.is_err() {
            self.shared.pending.remove(&id);
            return ConnectionClosedSnafu.fail();
        }

        let waiter = ctx.clone().with_deadline(Some(Instant::now() + timeout));
        let body = tokio::select! {
            r = answer => r.ok().context(ConnectionClosedSnafu)?,
            r = waiter.interrupted() => {
                r?;
                return ConnectionClosedSnafu.fail();
            }
        };
        body.into_result()
    }

    pub async fn get_size(&self, ctx: &RequestContext) -> Result<u64> {
        match self.call(ctx, Request::GetSize).await? {
            Response::Size(size) => Ok(size),
            _ => UnexpectedResponseSnafu { expected: "size" }.fail(),
        }
    }

    pub async fn get_length(&self, ctx: &RequestContext) -> Result<u64> {
        match self.call(ctx, Request::GetLength).await? {
            Response::Length(len) => Ok(len),
            _ => UnexpectedResponseSnafu { expected: "length" }.fail(),
        }
    }

    pub async fn get_info(&self, ctx: &RequestContext, ino: Ino) -> Result<InodeRecord> {
        self.expect_info(self.call(ctx, Request::GetInfo { ino }).await?)
    }

    pub async fn set_info(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        req: SetInfoRequest,
    ) -> Result<InodeRecord> {
        self.expect_info(self.call(ctx, Request::SetInfo { ino, req }).await?)
    }

    fn expect_info(&self, body: Response) -> Result<InodeRecord> {
        match body {
            Response::Info(record) => Ok(record),
            _ => UnexpectedResponseSnafu { expected: "info" }.fail(),
        }
    }

    /// Sends a request answered with a bare acknowledgement.
    pub async fn exec(&self, ctx: &RequestContext, req: Request) -> Result<()> {
        match self.call(ctx, req).await? {
            Response::Done => Ok(()),
            _ => UnexpectedResponseSnafu { expected: "done" }.fail(),
        }
    }

    pub async fn create(&self, ctx: &RequestContext, req: Request) -> Result<Ino> {
        match self.call(ctx, req).await? {
            Response::Created(ino) => Ok(ino),
            _ => UnexpectedResponseSnafu { expected: "created" }.fail(),
        }
    }

    pub async fn read_at(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        size: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        match self.call(ctx, Request::ReadAt { ino, size, offset }).await? {
            Response::Data(data) => Ok(data),
            _ => UnexpectedResponseSnafu { expected: "data" }.fail(),
        }
    }

    pub async fn write_at(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        let req = Request::WriteAt {
            ino,
            data: data.to_vec(),
            offset,
        };
        match self.call(ctx, req).await? {
            Response::Written(n) => Ok(n as usize),
            _ => UnexpectedResponseSnafu { expected: "written" }.fail(),
        }
    }

    pub async fn request_read(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        has_cached_copy: bool,
        cache_time: Timestamp,
    ) -> Result<bool> {
        let req = Request::RequestRead {
            ino,
            has_cached_copy,
            cache_time,
        };
        self.expect_granted(self.call(ctx, req).await?)
    }

    pub async fn request_write(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        has_cached_copy: bool,
        cache_time: Timestamp,
    ) -> Result<bool> {
        let req = Request::RequestWrite {
            ino,
            has_cached_copy,
            cache_time,
        };
        self.expect_granted(self.call(ctx, req).await?)
    }

    fn expect_granted(&self, body: Response) -> Result<bool> {
        match body {
            Response::Granted(granted) => Ok(granted),
            _ => UnexpectedResponseSnafu { expected: "granted" }.fail(),
        }
    }

    pub async fn ack_read(&self, ctx: &RequestContext, ino: Ino) -> Result<Timestamp> {
        self.expect_stamp(self.call(ctx, Request::AckRead { ino }).await?)
    }

    pub async fn ack_write(&self, ctx: &RequestContext, ino: Ino) -> Result<Timestamp> {
        self.expect_stamp(self.call(ctx, Request::AckWrite { ino }).await?)
    }

    fn expect_stamp(&self, body: Response) -> Result<Timestamp> {
        match body {
            Response::Stamp(ts) => Ok(ts),
            _ => UnexpectedResponseSnafu { expected: "stamp" }.fail(),
        }
    }
}
