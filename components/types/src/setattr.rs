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

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::record::InodeRecord;

/// Attribute changes for a single inode. Absent fields are left untouched.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetInfoRequest {
    pub uid:   Option<u32>,
    pub gid:   Option<u32>,
    pub size:  Option<u64>,
    pub mode:  Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl SetInfoRequest {
    pub fn is_empty(&self) -> bool { *self == Self::default() }

    pub fn touches_content(&self) -> bool { self.size.is_some() }

    pub fn touches_owner(&self) -> bool { self.uid.is_some() || self.gid.is_some() }

    pub fn touches_times(&self) -> bool { self.atime.is_some() || self.mtime.is_some() }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_times(mut self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self
    }

    /// Applies the present fields to an in-memory record and bumps ctime.
    pub fn apply_to(&self, record: &mut InodeRecord) {
        if let Some(uid) = self.uid {
            record.uid = uid;
        }
        if let Some(gid) = self.gid {
            record.gid = gid;
        }
        if let Some(size) = self.size {
            record.size = size;
        }
        if let Some(mode) = self.mode {
            record.set_mode(mode);
        }
        if let Some(atime) = self.atime {
            record.atime = atime;
        }
        if let Some(mtime) = self.mtime {
            record.mtime = mtime;
        }
        if !self.is_empty() {
            record.ctime = SystemTime::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ino::{Ino, ROOT_INO},
        record::DirentKind,
    };

    #[test]
    fn only_present_fields_apply() {
        let mut r = InodeRecord::new(Ino(2), ROOT_INO, "f", "/f", DirentKind::File);
        r.set_owner(10, 20).set_size(7);
        SetInfoRequest::default()
            .with_owner(None, Some(30))
            .with_mode(0o600)
            .apply_to(&mut r);
        assert_eq!(r.uid, 10);
        assert_eq!(r.gid, 30);
        assert_eq!(r.size, 7);
        assert_eq!(r.mode, 0o600);
    }

    #[test]
    fn content_touch_is_size_only() {
        assert!(SetInfoRequest::default().with_size(0).touches_content());
        assert!(!SetInfoRequest::default().with_mode(0o777).touches_content());
        assert!(SetInfoRequest::default().is_empty());
    }
}
