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
    #[snafu(context(false), display("{source}"))]
    Meta {
        #[snafu(implicit)]
        location: Location,
        source:   mftfs_meta::Error,
    },
    #[snafu(display("io error on {path:?}: {source}, {location}"))]
    Io {
        #[snafu(implicit)]
        location: Location,
        path:     String,
        source:   std::io::Error,
    },
    #[snafu(display("session error on {path:?}: {source}, {location}"))]
    Session {
        #[snafu(implicit)]
        location: Location,
        path:     String,
        source:   opendal::Error,
    },
    #[snafu(display("{op} is not implemented, {location}"))]
    Unimplemented {
        #[snafu(implicit)]
        location: Location,
        op:       &'static str,
    },
    #[snafu(display("backend has not been started, {location}"))]
    NotStarted {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{ino} would grow to {size} bytes, over the limit of {limit}, {location}"))]
    FileTooLarge {
        #[snafu(implicit)]
        location: Location,
        ino:      Ino,
        size:     u128,
        limit:    u64,
    },
    #[snafu(display("write to {ino} declined {attempts} times, local cache not updated"))]
    StaleCache {
        #[snafu(implicit)]
        location: Location,
        ino:      Ino,
        attempts: usize,
    },
    #[snafu(display("inode {ino} has no lock lease on this connection, {location}"))]
    LeaseNotHeld {
        #[snafu(implicit)]
        location: Location,
        ino:      Ino,
    },
    #[snafu(display("transport error: {source}, {location}"))]
    Transport {
        #[snafu(implicit)]
        location: Location,
        source:   std::io::Error,
    },
    #[snafu(display("codec error: {source}, {location}"))]
    Codec {
        #[snafu(implicit)]
        location: Location,
        source:   bincode::Error,
    },
    #[snafu(display("connection closed, {location}"))]
    ConnectionClosed {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("unexpected response, want {expected}, {location}"))]
    UnexpectedResponse {
        #[snafu(implicit)]
        location: Location,
        expected: &'static str,
    },
    #[snafu(display("remote error ({errno}): {message}"))]
    Remote {
        #[snafu(implicit)]
        location: Location,
        errno:    libc::c_int,
        message:  String,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Meta { source, .. } => source.is_not_found(),
            Error::Session { source, .. } => source.kind() == opendal::ErrorKind::NotFound,
            Error::Remote { errno, .. } => *errno == libc::ENOENT,
            _ => false,
        }
    }

    pub fn is_stale_cache(&self) -> bool { matches!(self, Error::StaleCache { .. }) }
}

impl ToErrno for Error {
    fn to_errno(&self) -> libc::c_int {
        match self {
            Error::Meta { source, .. } => source.to_errno(),
            Error::Io { source, .. } => source.to_errno(),
            Error::Session { source, .. } => match source.kind() {
                opendal::ErrorKind::NotFound => libc::ENOENT,
                opendal::ErrorKind::AlreadyExists => libc::EEXIST,
                opendal::ErrorKind::PermissionDenied => libc::EACCES,
                opendal::ErrorKind::IsADirectory => libc::EISDIR,
                opendal::ErrorKind::NotADirectory => libc::ENOTDIR,
                opendal::ErrorKind::Unsupported => libc::ENOSYS,
                _ => libc::EIO,
            },
            Error::Unimplemented { .. } => libc::ENOSYS,
            Error::NotStarted { .. } => libc::EIO,
            Error::FileTooLarge { .. } => libc::EFBIG,
            Error::StaleCache { .. } => libc::EAGAIN,
            Error::LeaseNotHeld { .. } => libc::ENOLCK,
            Error::Transport { .. } => libc::EIO,
            Error::Codec { .. } => libc::EIO,
            Error::ConnectionClosed { .. } => libc::EIO,
            Error::UnexpectedResponse { .. } => libc::EIO,
            Error::Remote { errno, .. } => *errno,
        }
    }
}
