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
    collections::{HashMap, VecDeque},
    time::SystemTime,
};

use async_trait::async_trait;
use mftfs_types::{
    ino::{Ino, ROOT_INO, ZERO_INO},
    record::{DirentKind, InodeRecord},
};
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::err::{
    AlreadyExistsSnafu, InodeNotFoundSnafu, NativeSnafu, NotADirectorySnafu, Result,
    RootImmutableSnafu,
};

/// Attributes of one entry in a backend's native namespace.
#[derive(Debug, Clone)]
pub struct NativeEntry {
    pub kind:   DirentKind,
    pub size:   u64,
    pub mode:   u32,
    pub uid:    u32,
    pub gid:    u32,
    pub nlink:  u32,
    pub atime:  SystemTime,
    pub mtime:  SystemTime,
    pub ctime:  SystemTime,
    pub crtime: SystemTime,
}

impl NativeEntry {
    pub fn new(kind: DirentKind, mode: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            size: 0,
            mode: mode & 0o7777,
            uid,
            gid,
            nlink: if kind == DirentKind::Directory { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }

    fn into_record(self, ino: Ino, parent: Ino, name: &str, path: &str) -> InodeRecord {
        let mut record = InodeRecord::new(ino, parent, name, path, self.kind);
        record
            .set_mode(self.mode)
            .set_owner(self.uid, self.gid)
            .set_size(self.size)
            .set_times(self.atime, self.mtime, self.ctime);
        record.crtime = self.crtime;
        record.nlink = self.nlink;
        record
    }
}

/// The walkable side of a backend: enough to discover its tree.
#[async_trait]
pub trait NativeTree: Send + Sync {
    async fn stat(
        &self,
        path: &str,
    ) -> std::result::Result<NativeEntry, Box<dyn std::error::Error + Send + Sync>>;

    /// Names (not paths) of the entries directly under `path`.
    async fn children(
        &self,
        path: &str,
    ) -> std::result::Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>>;
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Owns every inode record of one mounted tree.
///
/// Inode ids start at [`ROOT_INO`] and are never reused; [`ZERO_INO`] is the
/// parent of the root.
#[derive(Debug)]
pub struct InodeTable {
    records:  HashMap<Ino, InodeRecord>,
    next_ino: Ino,
}

impl InodeTable {
    pub fn with_root(path: &str, entry: NativeEntry) -> Self {
        let mut records = HashMap::new();
        records.insert(ROOT_INO, entry.into_record(ROOT_INO, ZERO_INO, "", path));
        Self {
            records,
            next_ino: ROOT_INO.next(),
        }
    }

    /// Breadth-first walk of `tree` from `root`. Entries that can not be
    /// stat'ed or listed are skipped; only a failing root is an error.
    pub async fn build<T>(root: &str, tree: &T) -> Result<Self>
    where
        T: NativeTree + ?Sized,
    {
        let root_entry = tree.stat(root).await.context(NativeSnafu { path: root })?;
        let mut table = Self::with_root(root, root_entry);

        let mut queue = VecDeque::from([ROOT_INO]);
        while let Some(dir) = queue.pop_front() {
            let path = table.get(dir)?.path.clone();
            let names = match tree.children(&path).await {
                Ok(names) => names,
                Err(e) => {
                    warn!("skip listing {path:?}: {e}");
                    continue;
                }
            };
            for name in names {
                let child_path = join_path(&path, &name);
                let entry = match tree.stat(&child_path).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("skip {child_path:?}: {e}");
                        continue;
                    }
                };
                let is_dir = entry.kind == DirentKind::Directory;
                let ino = table.insert_child(dir, &name, entry)?;
                if is_dir {
                    queue.push_back(ino);
                }
            }
        }
        debug!("built inode table from {root:?} with {} inodes", table.len());
        Ok(table)
    }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    pub fn get(&self, ino: Ino) -> Result<&InodeRecord> {
        self.records.get(&ino).context(InodeNotFoundSnafu { ino })
    }

    pub fn get_mut(&mut self, ino: Ino) -> Result<&mut InodeRecord> {
        self.records.get_mut(&ino).context(InodeNotFoundSnafu { ino })
    }

    pub fn lookup(&self, parent: Ino, name: &str) -> Result<Option<Ino>> {
        let dir = self.get(parent)?;
        ensure!(dir.is_dir(), NotADirectorySnafu { ino: parent });
        Ok(dir.lookup_child(name))
    }

    /// Checks that `name` may be created under `parent` and returns the
    /// native path it would get.
    pub fn check_create(&self, parent: Ino, name: &str) -> Result<String> {
        let dir = self.get(parent)?;
        ensure!(dir.is_dir(), NotADirectorySnafu { ino: parent });
        ensure!(
            dir.lookup_child(name).is_none(),
            AlreadyExistsSnafu { parent, name }
        );
        Ok(join_path(&dir.path, name))
    }

    /// Allocates an inode for `entry` and links it under `parent`.
    pub fn insert_child(&mut self, parent: Ino, name: &str, entry: NativeEntry) -> Result<Ino> {
        let path = self.check_create(parent, name)?;
        let ino = self.next_ino;
        self.next_ino = ino.next();
        self.records
            .insert(ino, entry.into_record(ino, parent, name, &path));
        self.get_mut(parent)?.add_child(name, ino);
        Ok(ino)
    }

    /// Unlinks `ino` from its parent and drops it together with everything
    /// beneath it. Returns the removed record and the ids of all dropped
    /// inodes, `ino` first.
    pub fn remove(&mut self, ino: Ino) -> Result<(InodeRecord, Vec<Ino>)> {
        ensure!(!ino.is_root(), RootImmutableSnafu);
        let record = self.records.remove(&ino).context(InodeNotFoundSnafu { ino })?;
        if let Some(parent) = self.records.get_mut(&record.parent) {
            parent.remove_child(&record.name);
        }
        let mut dropped = vec![ino];
        let mut queue: VecDeque<Ino> = record.children.iter().map(|c| c.ino).collect();
        while let Some(next) = queue.pop_front() {
            if let Some(child) = self.records.remove(&next) {
                dropped.push(next);
                queue.extend(child.children.iter().map(|c| c.ino));
            }
        }
        Ok((record, dropped))
    }

    /// Sum of all regular file sizes.
    pub fn total_size(&self) -> u64 {
        self.records
            .values()
            .filter(|r| !r.is_dir())
            .map(|r| r.size)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InodeRecord> { self.records.values() }
}
