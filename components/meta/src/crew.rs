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

//! Concurrent-read exclusive-write lock with writer preference.
//!
//! A writer first closes the door to new readers and then waits for the
//! readers already inside to leave. Readers that arrive after a writer asked
//! for the lock wait until that writer releases it, so a steady stream of
//! readers can not starve writers.
//!
//! The lock is not reentrant. A caller that requests the write section twice
//! without acking in between waits on itself forever; so does a caller that
//! requests a write while holding a read.

use std::sync::{Mutex, MutexGuard};

use scopeguard::ScopeGuard;
use tokio::sync::Notify;
use tracing::debug;

use crate::{context::RequestContext, err::Result};

#[derive(Debug)]
struct State {
    allow_read: bool,
    readers:    usize,
}

#[derive(Debug)]
pub struct CrewLock {
    state:   Mutex<State>,
    changed: Notify,
}

impl Default for CrewLock {
    fn default() -> Self { Self::new() }
}

impl CrewLock {
    pub fn new() -> Self {
        Self {
            state:   Mutex::new(State {
                allow_read: true,
                readers:    0,
            }),
            changed: Notify::new(),
        }
    }

    // the critical sections never panic, a poisoned mutex still holds a
    // consistent state.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until `ready` returns true while holding the state mutex.
    async fn wait_until<F>(&self, ctx: &RequestContext, mut ready: F) -> Result<()>
    where
        F: FnMut(&mut State) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // register before checking so a release between the check and the
            // await is not lost.
            notified.as_mut().enable();
            let done = {
                let mut s = self.state();
                ready(&mut s)
            };
            if done {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                r = ctx.interrupted() => return r,
            }
        }
    }

    pub async fn request_read(&self, ctx: &RequestContext) -> Result<()> {
        self.wait_until(ctx, |s| {
            if s.allow_read {
                s.readers += 1;
                true
            } else {
                false
            }
        })
        .await
    }

    pub fn ack_read(&self) {
        let mut s = self.state();
        debug_assert!(s.readers > 0, "ack_read without request_read");
        s.readers = s.readers.saturating_sub(1);
        if s.readers == 0 {
            drop(s);
            self.changed.notify_waiters();
        }
    }

    pub async fn request_write(&self, ctx: &RequestContext) -> Result<()> {
        // wait for any earlier writer to finish, then shut out new readers.
        self.wait_until(ctx, |s| {
            if s.allow_read {
                s.allow_read = false;
                true
            } else {
                false
            }
        })
        .await?;

        // reopen to readers if we give up (or are dropped) before draining.
        let reopen = scopeguard::guard((), |_| {
            debug!("write request abandoned, reopening to readers");
            self.reopen();
        });
        self.wait_until(ctx, |s| s.readers == 0).await?;
        ScopeGuard::into_inner(reopen);
        Ok(())
    }

    pub fn ack_write(&self) { self.reopen(); }

    fn reopen(&self) {
        self.state().allow_read = true;
        self.changed.notify_waiters();
    }

    pub async fn read(&self, ctx: &RequestContext) -> Result<CrewReadGuard<'_>> {
        self.request_read(ctx).await?;
        Ok(CrewReadGuard { lock: self })
    }

    pub async fn write(&self, ctx: &RequestContext) -> Result<CrewWriteGuard<'_>> {
        self.request_write(ctx).await?;
        Ok(CrewWriteGuard { lock: self })
    }

    pub fn readers(&self) -> usize { self.state().readers }

    pub fn reads_allowed(&self) -> bool { self.state().allow_read }
}

pub struct CrewReadGuard<'a> {
    lock: &'a CrewLock,
}

impl Drop for CrewReadGuard<'_> {
    fn drop(&mut self) { self.lock.ack_read(); }
}

pub struct CrewWriteGuard<'a> {
    lock: &'a CrewLock,
}

impl Drop for CrewWriteGuard<'_> {
    fn drop(&mut self) { self.lock.ack_write(); }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn many_readers_at_once() {
        let lock = CrewLock::new();
        let ctx = RequestContext::background();
        for _ in 0..8 {
            lock.request_read(&ctx).await.unwrap();
        }
        assert_eq!(lock.readers(), 8);
        for _ in 0..8 {
            lock.ack_read();
        }
        assert_eq!(lock.readers(), 0);
        assert!(lock.reads_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writer_blocks_later_readers() {
        let lock = Arc::new(CrewLock::new());
        let ctx = RequestContext::background();
        lock.request_read(&ctx).await.unwrap();

        let writer_in = Arc::new(AtomicBool::new(false));
        let writer = {
            let lock = lock.clone();
            let writer_in = writer_in.clone();
            tokio::spawn(async move {
                lock.request_write(&RequestContext::background()).await.unwrap();
                writer_in.store(true, Ordering::SeqCst);
            })
        };
        // the writer has closed the door but still waits for our read.
        while lock.reads_allowed() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!writer_in.load(Ordering::SeqCst));

        let late_reader_in = Arc::new(AtomicBool::new(false));
        let late_reader = {
            let lock = lock.clone();
            let late_reader_in = late_reader_in.clone();
            tokio::spawn(async move {
                lock.request_read(&RequestContext::background()).await.unwrap();
                late_reader_in.store(true, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!late_reader_in.load(Ordering::SeqCst));

        lock.ack_read();
        writer.await.unwrap();
        assert!(writer_in.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!late_reader_in.load(Ordering::SeqCst));

        lock.ack_write();
        late_reader.await.unwrap();
        assert!(late_reader_in.load(Ordering::SeqCst));
        lock.ack_read();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writers_are_exclusive() {
        let lock = Arc::new(CrewLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = vec![];
        for i in 0..16 {
            let lock = lock.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = RequestContext::background();
                if i % 4 == 0 {
                    let _w = lock.write(&ctx).await.unwrap();
                    assert_eq!(inside.fetch_add(100, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(100, Ordering::SeqCst);
                } else {
                    let _r = lock.read(&ctx).await.unwrap();
                    assert!(inside.fetch_add(1, Ordering::SeqCst) < 100);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(lock.readers(), 0);
        assert!(lock.reads_allowed());
    }

    #[tokio::test]
    async fn cancelled_writer_reopens_to_readers() {
        let lock = CrewLock::new();
        let ctx = RequestContext::background();
        lock.request_read(&ctx).await.unwrap();

        let writer_ctx = RequestContext::background().with_timeout(Duration::from_millis(20));
        let err = lock.request_write(&writer_ctx).await.unwrap_err();
        assert!(matches!(err, crate::Error::DeadlineExceeded { .. }));
        assert!(lock.reads_allowed());

        lock.request_read(&ctx).await.unwrap();
        assert_eq!(lock.readers(), 2);
    }

    #[tokio::test]
    async fn cancelled_reader_leaves_no_trace() {
        let lock = CrewLock::new();
        let ctx = RequestContext::background();
        lock.request_write(&ctx).await.unwrap();

        let reader_ctx = RequestContext::background();
        reader_ctx.cancellation_token.cancel();
        let err = lock.request_read(&reader_ctx).await.unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled { .. }));
        assert_eq!(lock.readers(), 0);
        lock.ack_write();
    }
}
