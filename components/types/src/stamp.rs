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
    fmt::{Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Nanoseconds since the unix epoch.
///
/// Content and metadata write times are compared with this type, so it must
/// be totally ordered and cheap to ship across the wire.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn now() -> Self { Self::from(SystemTime::now()) }

    pub fn as_nanos(&self) -> u64 { self.0 }

    pub fn to_system_time(&self) -> SystemTime { UNIX_EPOCH + Duration::from_nanos(self.0) }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        let nanos = value
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
            .unwrap_or(0);
        Self(nanos)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}ns", self.0) }
}

/// Hands out strictly increasing timestamps that follow the wall clock.
///
/// Two stamps taken in the same nanosecond, or across a backwards clock step,
/// still compare in issue order.
#[derive(Debug, Default)]
pub struct StampClock {
    last: AtomicU64,
}

impl StampClock {
    pub fn new() -> Self { Self::default() }

    pub fn tick(&self) -> Timestamp {
        let now = Timestamp::now().0;
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Timestamp(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Make sure every later tick is greater than `seen`.
    pub fn observe(&self, seen: Timestamp) { self.last.fetch_max(seen.0, Ordering::AcqRel); }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;

    #[test]
    fn ticks_are_strictly_increasing() {
        let clock = StampClock::new();
        let mut prev = clock.tick();
        for _ in 0..10_000 {
            let t = clock.tick();
            assert!(t > prev);
            prev = t;
        }
    }

    #[test]
    fn observe_pushes_clock_forward() {
        let clock = StampClock::new();
        let far = Timestamp(Timestamp::now().0 + Duration::from_secs(3600).as_nanos() as u64);
        clock.observe(far);
        assert!(clock.tick() > far);
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(StampClock::new());
        let handles = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..1000).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();
        let mut seen = HashSet::new();
        for h in handles {
            for t in h.join().unwrap() {
                assert!(seen.insert(t));
            }
        }
    }
}
