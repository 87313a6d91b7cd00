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

//! Local copy of remote file contents.
//!
//! Every inode gets one sparse file under the cache directory plus an
//! in-memory note of which byte ranges of it are valid and which server
//! content time they belong to. Ranges are only trusted while the time
//! matches; moving to a different time drops them.

use std::{
    collections::HashMap,
    fs::OpenOptions,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use mftfs_types::{ino::Ino, stamp::Timestamp};
use rangemap::RangeSet;
use snafu::ResultExt;
use tracing::debug;

use crate::err::{IoSnafu, Result};

#[derive(Debug, Default, Clone)]
struct CacheEntry {
    timestamp: Option<Timestamp>,
    covered:   RangeSet<u64>,
    /// Content length, known once a read came back short.
    eof:       Option<u64>,
}

impl CacheEntry {
    fn reset(&mut self) {
        self.covered = RangeSet::new();
        self.eof = None;
    }

    fn covers(&self, offset: u64, len: u64) -> bool {
        let end = offset.saturating_add(len);
        let end = self.eof.map_or(end, |eof| end.min(eof));
        if end <= offset {
            // nothing to read; only trustworthy when the length is known.
            return self.eof.is_some();
        }
        self.covered.gaps(&(offset..end)).next().is_none()
    }
}

#[derive(Debug)]
pub struct LocalCache {
    dir:     PathBuf,
    entries: Mutex<HashMap<Ino, CacheEntry>>,
}

impl LocalCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir:     dir.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path { &self.dir }

    fn entries(&self) -> MutexGuard<'_, HashMap<Ino, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn file_path(&self, ino: Ino) -> PathBuf { self.dir.join(ino.0.to_string()) }

    /// Content time of the cached copy, if any.
    pub fn timestamp(&self, ino: Ino) -> Option<Timestamp> {
        self.entries().get(&ino).and_then(|e| e.timestamp)
    }

    /// Whether `offset..offset+len` can be served locally, and the time to
    /// present to the server.
    pub fn read_hint(&self, ino: Ino, offset: u64, len: u64) -> (bool, Timestamp) {
        let entries = self.entries();
        match entries.get(&ino) {
            Some(entry) => match entry.timestamp {
                Some(ts) => (entry.covers(offset, len), ts),
                None => (false, Timestamp::EPOCH),
            },
            None => (false, Timestamp::EPOCH),
        }
    }

    /// Saves bytes fetched at content time `ts` for
    /// `offset..offset+requested`; a short answer marks the end of the
    /// content. Returns false, keeping nothing, when the copy already moved
    /// past `ts`.
    pub fn store(
        &self,
        ino: Ino,
        ts: Timestamp,
        offset: u64,
        data: &[u8],
        requested: usize,
    ) -> Result<bool> {
        let mut entries = self.entries();
        let entry = entries.entry(ino).or_default();
        match entry.timestamp {
            Some(current) if current > ts => {
                debug!("dropping bytes of {ino} fetched at {ts}, copy is at {current}");
                return Ok(false);
            }
            Some(current) if current == ts => {}
            _ => entry.reset(),
        }
        entry.timestamp = Some(ts);
        // the file is written under the entries lock so a concurrent
        // accepted write can not land in between.
        self.write_file(ino, offset, data)?;
        let end = offset + data.len() as u64;
        if !data.is_empty() {
            entry.covered.insert(offset..end);
        }
        if data.len() < requested {
            entry.eof = Some(end);
        }
        Ok(true)
    }

    /// Serves a read from the local copy.
    pub fn load(&self, ino: Ino, buf: &mut [u8], offset: u64) -> Result<usize> {
        let (len, eof) = {
            let entries = self.entries();
            let eof = entries.get(&ino).and_then(|e| e.eof);
            let len = eof.map_or(buf.len() as u64, |eof| {
                eof.saturating_sub(offset).min(buf.len() as u64)
            });
            (len as usize, eof)
        };
        if len == 0 {
            return Ok(0);
        }
        let path = self.file_path(ino);
        let file = std::fs::File::open(&path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        let mut read = 0;
        while read < len {
            let n = file
                .read_at(&mut buf[read..len], offset + read as u64)
                .context(IoSnafu {
                    path: path.display().to_string(),
                })?;
            if n == 0 {
                break;
            }
            read += n;
        }
        // holes in the sparse file read back as zeroes
        if eof.is_some() && read < len {
            buf[read..len].fill(0);
            read = len;
        }
        Ok(read)
    }

    /// Mirrors a write the server accepted. Ranges stay valid only when the
    /// copy was current (`prev`) right before the write.
    pub fn record_write(
        &self,
        ino: Ino,
        prev: Timestamp,
        next: Timestamp,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut entries = self.entries();
        self.write_file(ino, offset, data)?;
        let entry = entries.entry(ino).or_default();
        if entry.timestamp != Some(prev) {
            entry.reset();
        }
        let end = offset + data.len() as u64;
        if !data.is_empty() {
            entry.covered.insert(offset..end);
        }
        entry.eof = entry.eof.map(|eof| eof.max(end));
        entry.timestamp = Some(next);
        Ok(())
    }

    /// Takes the server's content time without trusting any old bytes.
    pub fn refresh(&self, ino: Ino, ts: Timestamp) {
        let mut entries = self.entries();
        let entry = entries.entry(ino).or_default();
        if entry.timestamp != Some(ts) {
            debug!("cache of {ino} refreshed to {ts}");
            entry.reset();
        }
        entry.timestamp = Some(ts);
    }

    pub fn invalidate(&self, ino: Ino) {
        if let Some(entry) = self.entries().get_mut(&ino) {
            entry.timestamp = None;
            entry.reset();
        }
    }

    /// Drops everything known about `ino`, including its file.
    pub fn remove(&self, ino: Ino) -> Result<()> {
        self.entries().remove(&ino);
        let path = self.file_path(ino);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e).context(IoSnafu {
                path: path.display().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Removes every cache file.
    pub fn clear(&self) -> Result<()> {
        let inos: Vec<Ino> = self.entries().keys().copied().collect();
        for ino in inos {
            self.remove(ino)?;
        }
        Ok(())
    }

    fn write_file(&self, ino: Ino, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.file_path(ino);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .context(IoSnafu {
                path: path.display().to_string(),
            })?;
        file.write_all_at(data, offset).context(IoSnafu {
            path: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, LocalCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        (dir, cache)
    }

    #[test]
    fn unknown_inode_has_no_copy() {
        let (_dir, cache) = cache();
        assert_eq!(cache.read_hint(Ino(5), 0, 10), (false, Timestamp::EPOCH));
        assert_eq!(cache.timestamp(Ino(5)), None);
    }

    #[test]
    fn served_only_within_stored_ranges() {
        let (_dir, cache) = cache();
        let ino = Ino(2);
        assert!(cache.store(ino, Timestamp(10), 0, b"hello", 5).unwrap());

        assert_eq!(cache.read_hint(ino, 0, 5), (true, Timestamp(10)));
        assert_eq!(cache.read_hint(ino, 2, 3), (true, Timestamp(10)));
        assert_eq!(cache.read_hint(ino, 0, 6), (false, Timestamp(10)));

        let mut buf = [0u8; 3];
        assert_eq!(cache.load(ino, &mut buf, 1).unwrap(), 3);
        assert_eq!(&buf, b"ell");
    }

    #[test]
    fn short_read_marks_end_of_content() {
        let (_dir, cache) = cache();
        let ino = Ino(2);
        cache.store(ino, Timestamp(10), 0, b"abc", 4096).unwrap();

        assert!(cache.read_hint(ino, 0, 4096).0);
        assert!(cache.read_hint(ino, 100, 10).0);
        let mut buf = [0u8; 16];
        assert_eq!(cache.load(ino, &mut buf, 0).unwrap(), 3);
        assert_eq!(cache.load(ino, &mut buf, 3).unwrap(), 0);
    }

    #[test]
    fn new_time_drops_old_ranges() {
        let (_dir, cache) = cache();
        let ino = Ino(2);
        cache.store(ino, Timestamp(10), 0, b"abc", 3).unwrap();
        cache.refresh(ino, Timestamp(10));
        assert!(cache.read_hint(ino, 0, 3).0);

        cache.refresh(ino, Timestamp(11));
        assert_eq!(cache.read_hint(ino, 0, 3), (false, Timestamp(11)));
    }

    #[test]
    fn accepted_write_keeps_current_copy() {
        let (_dir, cache) = cache();
        let ino = Ino(3);
        cache.store(ino, Timestamp(10), 0, b"aaaa", 4).unwrap();

        cache
            .record_write(ino, Timestamp(10), Timestamp(20), 2, b"bb")
            .unwrap();
        assert_eq!(cache.read_hint(ino, 0, 4), (true, Timestamp(20)));
        let mut buf = [0u8; 4];
        cache.load(ino, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"aabb");

        // a copy that moved on in between only keeps what was just written
        cache.refresh(ino, Timestamp(30));
        cache
            .record_write(ino, Timestamp(25), Timestamp(40), 0, b"z")
            .unwrap();
        assert_eq!(cache.read_hint(ino, 0, 1), (true, Timestamp(40)));
        assert!(!cache.read_hint(ino, 0, 4).0);
    }

    #[test]
    fn late_fetch_does_not_clobber_a_newer_write() {
        let (_dir, cache) = cache();
        let ino = Ino(4);
        cache.refresh(ino, Timestamp(10));
        // a read granted at 10 is still in flight when our own write lands.
        cache
            .record_write(ino, Timestamp(10), Timestamp(20), 0, b"NEW")
            .unwrap();
        assert!(!cache.store(ino, Timestamp(10), 0, b"OLDOLD", 6).unwrap());

        assert_eq!(cache.timestamp(ino), Some(Timestamp(20)));
        assert_eq!(cache.read_hint(ino, 0, 3), (true, Timestamp(20)));
        assert!(!cache.read_hint(ino, 0, 6).0);
        let mut buf = [0u8; 3];
        cache.load(ino, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"NEW");

        // bytes fetched at a newer time replace the copy.
        assert!(cache.store(ino, Timestamp(30), 0, b"fresh", 5).unwrap());
        assert_eq!(cache.read_hint(ino, 0, 5), (true, Timestamp(30)));
    }

    #[test]
    fn remove_deletes_the_file() {
        let (dir, cache) = cache();
        let ino = Ino(7);
        cache.store(ino, Timestamp(1), 0, b"x", 1).unwrap();
        assert!(dir.path().join("7").exists());

        cache.remove(ino).unwrap();
        assert!(!dir.path().join("7").exists());
        assert_eq!(cache.timestamp(ino), None);
        cache.remove(ino).unwrap();
    }
}
