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
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mftfs_common::{DEFAULT_REQUEST_TIMEOUT, MFTFS_DEBUG_SERVER_ADDR};
use mftfs_meta::RequestContext;
use mftfs_types::ino::Ino;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{debug, error, info, warn};

use super::wire::{self, Envelope, Request, Response};
use crate::{
    coherence::CoherentManager,
    err::{LeaseNotHeldSnafu, Result, TransportSnafu},
    manager::FsManager,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen:       String,
    /// Root of the local tree the server is authoritative for.
    pub root:         PathBuf,
    /// Upper bound on how long a request may wait for an inode lock.
    pub lock_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen:       MFTFS_DEBUG_SERVER_ADDR.to_string(),
            root:         PathBuf::from("/tmp/mftfs.data"),
            lock_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Content locks one connection currently holds.
#[derive(Debug, Default)]
struct Leases {
    reads:  HashMap<Ino, usize>,
    writes: HashSet<Ino>,
}

struct Connection {
    peer:   SocketAddr,
    token:  CancellationToken,
    leases: Mutex<Leases>,
}

impl Connection {
    fn leases(&self) -> MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn grant_read(&self, ino: Ino) { *self.leases().reads.entry(ino).or_default() += 1; }

    fn grant_write(&self, ino: Ino) { self.leases().writes.insert(ino); }

    fn take_read(&self, ino: Ino) -> Result<()> {
        let mut leases = self.leases();
        let Some(count) = leases.reads.get_mut(&ino) else {
            return LeaseNotHeldSnafu { ino }.fail();
        };
        *count -= 1;
        if *count == 0 {
            leases.reads.remove(&ino);
        }
        Ok(())
    }

    fn take_write(&self, ino: Ino) -> Result<()> {
        ensure!(self.leases().writes.remove(&ino), LeaseNotHeldSnafu { ino });
        Ok(())
    }

    fn check(&self, ino: Ino, write: bool) -> Result<()> {
        let leases = self.leases();
        let held = leases.writes.contains(&ino) || (!write && leases.reads.contains_key(&ino));
        ensure!(held, LeaseNotHeldSnafu { ino });
        Ok(())
    }

    fn context(&self, id: u64, timeout_ms: Option<u64>, lock_timeout: Duration) -> RequestContext {
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .map_or(lock_timeout, |t| t.min(lock_timeout));
        let mut ctx = RequestContext::background().with_deadline(Some(Instant::now() + timeout));
        ctx.unique = id;
        ctx.cancellation_token = self.token.child_token();
        ctx
    }
}

/// Serves a [CoherentManager] to remote backends over TCP.
pub struct RemoteServer {
    manager:      Arc<CoherentManager>,
    lock_timeout: Duration,
}

impl RemoteServer {
    pub fn new(manager: Arc<CoherentManager>, lock_timeout: Duration) -> Self {
        Self {
            manager,
            lock_timeout,
        }
    }

    /// Accepts connections until `shutdown` fires, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("mftfs server listening on {addr}");
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("connection accepted: {peer}");
                        let server = self.clone();
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer, token).await {
                                warn!("connection {peer} ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => error!("failed to accept connection: {e}"),
                }
            }
        }
        info!("mftfs server stopped");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<()> {
        let (rd, wr) = stream.into_split();
        let mut frames = FramedRead::new(rd, wire::codec());
        let mut sink = FramedWrite::new(wr, wire::codec());
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!("stop writing to {peer}: {e}");
                    break;
                }
            }
        });

        let conn = Arc::new(Connection {
            peer,
            token,
            leases: Mutex::new(Leases::default()),
        });
        let tasks = TaskTracker::new();
        let result = loop {
            let frame = tokio::select! {
                f = frames.next() => f,
                _ = conn.token.cancelled() => None,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(e).context(TransportSnafu),
                None => break Ok(()),
            };
            let envelope = match Envelope::<Request>::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => break Err(e),
            };

            let server = self.clone();
            let conn = conn.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let id = envelope.id;
                let ctx = conn.context(id, envelope.timeout_ms, server.lock_timeout);
                let op = envelope.body.name();
                let body = match server.handle(&conn, &ctx, envelope.body).await {
                    Ok(body) => body,
                    Err(e) => {
                        debug!("{op} from {} failed: {e}", conn.peer);
                        Response::from_error(&e)
                    }
                };
                match (Envelope { id, timeout_ms: None, body }).encode() {
                    Ok(frame) => {
                        let _ = tx.send(frame).await;
                    }
                    Err(e) => error!("failed to encode {op} response: {e}"),
                }
            });
        };

        // stop lock waits, let in-flight requests settle, then give back
        // whatever the peer still holds.
        conn.token.cancel();
        tasks.close();
        tasks.wait().await;
        self.release_leases(&conn).await;
        drop(tx);
        let _ = writer.await;
        info!("connection closed: {peer}");
        result
    }

    async fn release_leases(&self, conn: &Connection) {
        let leases = std::mem::take(&mut *conn.leases());
        let ctx = RequestContext::background();
        for (ino, count) in leases.reads {
            for _ in 0..count {
                if let Err(e) = self.manager.ack_read(&ctx, ino).await {
                    warn!("failed to release read lease on {ino}: {e}");
                }
            }
        }
        for ino in leases.writes {
            warn!("{} left while writing {ino}", conn.peer);
            if let Err(e) = self.manager.ack_write(&ctx, ino).await {
                warn!("failed to release write lease on {ino}: {e}");
            }
        }
    }

    async fn handle(&self, conn: &Connection, ctx: &RequestContext, req: Request) -> Result<Response> {
        let m = &self.manager;
        Ok(match req {
            Request::GetSize => Response::Size(m.get_size(ctx).await?),
            Request::GetLength => Response::Length(m.get_length(ctx).await?),
            Request::GetInfo { ino } => Response::Info(m.get_info(ctx, ino).await?),
            Request::SetInfo { ino, req } => Response::Info(m.set_info(ctx, ino, req).await?),
            Request::Delete { ino } => {
                m.delete(ctx, ino).await?;
                Response::Done
            }
            Request::MkDir { parent, name, mode } => {
                Response::Created(m.mkdir(ctx, parent, &name, mode).await?)
            }
            Request::CreateFile { parent, name, mode } => {
                Response::Created(m.create_file(ctx, parent, &name, mode).await?)
            }
            Request::RmDir { ino } => {
                m.rmdir(ctx, ino).await?;
                Response::Done
            }
            Request::ReadAt { ino, size, offset } => {
                conn.check(ino, false)?;
                let mut buf = vec![0u8; size as usize];
                let n = m.read_at(ctx, ino, &mut buf, offset).await?;
                buf.truncate(n);
                Response::Data(buf)
            }
            Request::WriteAt { ino, data, offset } => {
                conn.check(ino, true)?;
                Response::Written(m.write_at(ctx, ino, &data, offset).await? as u64)
            }
            Request::SyncFile { ino } => {
                m.sync_file(ctx, ino).await?;
                Response::Done
            }
            Request::RequestRead {
                ino,
                has_cached_copy,
                cache_time,
            } => {
                let granted = m.request_read(ctx, ino, has_cached_copy, cache_time).await?;
                if granted {
                    conn.grant_read(ino);
                }
                Response::Granted(granted)
            }
            Request::RequestWrite {
                ino,
                has_cached_copy,
                cache_time,
            } => {
                let granted = m.request_write(ctx, ino, has_cached_copy, cache_time).await?;
                if granted {
                    conn.grant_write(ino);
                }
                Response::Granted(granted)
            }
            Request::AckRead { ino } => {
                conn.take_read(ino)?;
                Response::Stamp(m.ack_read(ctx, ino).await?)
            }
            Request::AckWrite { ino } => {
                conn.take_write(ino)?;
                Response::Stamp(m.ack_write(ctx, ino).await?)
            }
        })
    }
}
