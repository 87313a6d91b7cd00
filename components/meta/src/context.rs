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

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::err::{CancelledSnafu, DeadlineExceededSnafu, Result};

/// Per-request state threaded from the kernel callback down to lock waits
/// and RPC round trips.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub unique:             u64,
    pub uid:                u32,
    pub gid:                u32,
    pub pid:                u32,
    pub start_at:           Instant,
    pub deadline:           Option<Instant>,
    pub cancellation_token: CancellationToken,
}

impl<'a> From<&'a fuser::Request<'a>> for RequestContext {
    fn from(req: &'a fuser::Request) -> Self {
        Self {
            unique:             req.unique(),
            uid:                req.uid(),
            gid:                req.gid(),
            pid:                req.pid(),
            start_at:           Instant::now(),
            deadline:           None,
            cancellation_token: CancellationToken::new(),
        }
    }
}

impl RequestContext {
    pub fn background() -> Self {
        Self {
            unique:             0,
            uid:                0,
            gid:                0,
            pid:                0,
            start_at:           Instant::now(),
            deadline:           None,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.start_at + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn is_cancelled(&self) -> bool { self.cancellation_token.is_cancelled() }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves once the request is cancelled or its deadline passes, with
    /// the matching error.
    pub async fn interrupted(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => CancelledSnafu { unique: self.unique }.fail(),
                    _ = tokio::time::sleep_until(deadline.into()) => DeadlineExceededSnafu { unique: self.unique }.fail(),
                }
            }
            None => {
                self.cancellation_token.cancelled().await;
                CancelledSnafu {
                    unique: self.unique,
                }
                .fail()
            }
        }
    }
}
