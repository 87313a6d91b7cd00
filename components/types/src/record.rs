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

use std::{collections::HashMap, time::SystemTime};

use fuser::{FileAttr, FileType};
use mftfs_common::{BLOCK_SIZE, FH};
use serde::{Deserialize, Serialize};

use crate::{
    ino::{Ino, ZERO_INO},
    stamp::Timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirentKind {
    File,
    Directory,
    Unknown,
}

impl DirentKind {
    pub fn to_file_type(self) -> FileType {
        match self {
            DirentKind::Directory => FileType::Directory,
            // the kernel has no "unknown" type, report it as a plain file.
            DirentKind::File | DirentKind::Unknown => FileType::RegularFile,
        }
    }
}

impl From<std::fs::FileType> for DirentKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            DirentKind::Directory
        } else if ft.is_file() {
            DirentKind::File
        } else {
            DirentKind::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub name: String,
    pub ino:  Ino,
}

/// One filesystem entry and the bookkeeping every backend keeps for it.
///
/// `children` and `child_index` must always agree: for every `(name, i)` in
/// the index, `children[i].name == name`. Only [`InodeRecord::add_child`] and
/// [`InodeRecord::remove_child`] touch them.
///
/// The per-record metadata and content locks are not part of the record; the
/// coherence server keeps them beside the table, keyed by inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub name:                String,
    /// Path in the backend's native namespace.
    pub path:                String,
    pub ino:                 Ino,
    /// [`ZERO_INO`] for the root.
    pub parent:              Ino,
    pub children:            Vec<ChildEntry>,
    pub child_index:         HashMap<String, usize>,
    pub nlink:               u32,
    pub size:                u64,
    /// permission bits only, the file type lives in `kind`.
    pub mode:                u32,
    pub uid:                 u32,
    pub gid:                 u32,
    pub atime:               SystemTime,
    pub mtime:               SystemTime,
    pub ctime:               SystemTime,
    pub crtime:              SystemTime,
    pub kind:                DirentKind,
    /// The most recently minted handle, 0 when none.
    pub handle:              FH,
    pub cache_valid:         bool,
    pub cache_time:          Timestamp,
    pub metadata_write_time: Timestamp,
    pub content_write_time:  Timestamp,
}

impl InodeRecord {
    pub fn new(ino: Ino, parent: Ino, name: &str, path: &str, kind: DirentKind) -> Self {
        let now = SystemTime::now();
        let stamp = Timestamp::from(now);
        Self {
            name: name.to_string(),
            path: path.to_string(),
            ino,
            parent,
            children: Vec::new(),
            child_index: HashMap::new(),
            nlink: if kind == DirentKind::Directory { 2 } else { 1 },
            size: 0,
            mode: if kind == DirentKind::Directory { 0o755 } else { 0o644 },
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            handle: 0,
            cache_valid: false,
            cache_time: Timestamp::EPOCH,
            metadata_write_time: stamp,
            content_write_time: stamp,
        }
    }

    pub fn is_dir(&self) -> bool { self.kind == DirentKind::Directory }

    pub fn is_root(&self) -> bool { self.parent == ZERO_INO }

    pub fn set_mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode & 0o7777;
        self
    }

    pub fn set_owner(&mut self, uid: u32, gid: u32) -> &mut Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn set_size(&mut self, size: u64) -> &mut Self {
        self.size = size;
        self
    }

    pub fn set_times(&mut self, atime: SystemTime, mtime: SystemTime, ctime: SystemTime) -> &mut Self {
        self.atime = atime;
        self.mtime = mtime;
        self.ctime = ctime;
        self
    }

    pub fn lookup_child(&self, name: &str) -> Option<Ino> {
        self.child_index.get(name).map(|i| self.children[*i].ino)
    }

    /// Appends `name` and records its index. Returns the new index.
    ///
    /// Adding a name that is already present breaks the index invariant;
    /// callers check with [`InodeRecord::lookup_child`] first.
    pub fn add_child(&mut self, name: &str, ino: Ino) -> usize {
        debug_assert!(!self.child_index.contains_key(name), "duplicate child {name}");
        let index = self.children.len();
        self.children.push(ChildEntry {
            name: name.to_string(),
            ino,
        });
        self.child_index.insert(name.to_string(), index);
        index
    }

    /// Removes `name` and shifts every later entry's index down by one.
    pub fn remove_child(&mut self, name: &str) -> Option<ChildEntry> {
        let index = self.child_index.remove(name)?;
        let removed = self.children.remove(index);
        for i in self.child_index.values_mut() {
            if *i > index {
                *i -= 1;
            }
        }
        Some(removed)
    }

    /// True when every index entry points at a child with the same name.
    pub fn index_consistent(&self) -> bool {
        self.child_index.len() == self.children.len()
            && self
                .child_index
                .iter()
                .all(|(name, i)| self.children.get(*i).is_some_and(|c| &c.name == name))
    }

    pub fn to_fuse_attr(&self) -> FileAttr {
        FileAttr {
            ino:     self.ino.0,
            size:    self.size,
            blocks:  (self.size + 512 - 1) / 512,
            atime:   self.atime,
            mtime:   self.mtime,
            ctime:   self.ctime,
            crtime:  self.crtime,
            kind:    self.kind.to_file_type(),
            perm:    (self.mode & 0o7777) as u16,
            nlink:   self.nlink,
            uid:     self.uid,
            gid:     self.gid,
            rdev:    0,
            blksize: BLOCK_SIZE as u32,
            flags:   0,
        }
    }
}
