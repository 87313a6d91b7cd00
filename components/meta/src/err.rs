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

use mftfs_types::{ino::Ino, ToErrno};
use snafu::{Location, Snafu};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("inode {ino} not found, {location}"))]
    InodeNotFound {
        #[snafu(implicit)]
        location: Location,
        ino:      Ino,
    },
    #[snafu(display("handle {fh} not found, {location}"))]
    HandleNotFound {
        #[snafu(implicit)]
        location: Location,
        fh:       u64,
    },
    #[snafu(display("inode {ino} is not a directory, {location}"))]
    NotADirectory {
        #[snafu(implicit)]
        location: Location,
        ino:      Ino,
    },
    #[snafu(display("{name:?} already exists under {parent}, {location}"))]
    AlreadyExists {
        #[snafu(implicit)]
        location: Location,
        parent:   Ino,
        name:     String,
    },
    #[snafu(display("directory {ino} is not empty, {location}"))]
    NotEmpty {
        #[snafu(implicit)]
        location: Location,
        ino:      Ino,
    },
    #[snafu(display("the root inode can not be removed, {location}"))]
    RootImmutable {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to walk {path:?}: {source}"))]
    Native {
        #[snafu(implicit)]
        location: Location,
        path:     String,
        source:   Box<dyn std::error::Error + Send + Sync>,
    },
    #[snafu(display("request {unique} cancelled, {location}"))]
    Cancelled {
        #[snafu(implicit)]
        location: Location,
        unique:   u64,
    },
    #[snafu(display("request {unique} exceeded its deadline, {location}"))]
    DeadlineExceeded {
        #[snafu(implicit)]
        location: Location,
        unique:   u64,
    },
    LibcError {
        #[snafu(implicit)]
        location: Location,
        errno:    libc::c_int,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::InodeNotFound { .. } | Error::HandleNotFound { .. }
        )
    }
}

impl ToErrno for Error {
    fn to_errno(&self) -> libc::c_int {
        match self {
            Error::InodeNotFound { .. } => libc::ENOENT,
            Error::HandleNotFound { .. } => libc::ENOENT,
            Error::NotADirectory { .. } => libc::ENOTDIR,
            Error::AlreadyExists { .. } => libc::EEXIST,
            Error::NotEmpty { .. } => libc::ENOTEMPTY,
            Error::RootImmutable { .. } => libc::EBUSY,
            Error::Native { .. } => libc::EIO,
            Error::Cancelled { .. } => libc::EINTR,
            Error::DeadlineExceeded { .. } => libc::ETIMEDOUT,
            Error::LibcError { errno, .. } => *errno,
        }
    }
}
