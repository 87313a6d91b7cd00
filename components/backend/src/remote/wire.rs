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

//! Frames exchanged between the remote backend and the authoritative
//! server: bincode envelopes inside length-delimited frames.

use bytes::Bytes;
use mftfs_types::{
    ino::Ino, record::InodeRecord, setattr::SetInfoRequest, stamp::Timestamp, ToErrno,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::ResultExt;
use tokio_util::codec::LengthDelimitedCodec;

use crate::err::{CodecSnafu, Error, RemoteSnafu, Result};

const MAX_FRAME_LENGTH: usize = 64 << 20;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id:         u64,
    /// Milliseconds the sender is willing to wait for the answer.
    pub timeout_ms: Option<u64>,
    pub body:       T,
}

impl<T: Serialize> Envelope<T> {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self).context(CodecSnafu)?))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    pub fn decode(frame: &[u8]) -> Result<Self> { bincode::deserialize(frame).context(CodecSnafu) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    GetSize,
    GetLength,
    GetInfo {
        ino: Ino,
    },
    SetInfo {
        ino: Ino,
        req: SetInfoRequest,
    },
    Delete {
        ino: Ino,
    },
    MkDir {
        parent: Ino,
        name:   String,
        mode:   u32,
    },
    CreateFile {
        parent: Ino,
        name:   String,
        mode:   u32,
    },
    RmDir {
        ino: Ino,
    },
    ReadAt {
        ino:    Ino,
        size:   u32,
        offset: u64,
    },
    WriteAt {
        ino:    Ino,
        data:   Vec<u8>,
        offset: u64,
    },
    SyncFile {
        ino: Ino,
    },
    RequestRead {
        ino:             Ino,
        has_cached_copy: bool,
        cache_time:      Timestamp,
    },
    RequestWrite {
        ino:             Ino,
        has_cached_copy: bool,
        cache_time:      Timestamp,
    },
    AckRead {
        ino: Ino,
    },
    AckWrite {
        ino: Ino,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetSize => "get_size",
            Request::GetLength => "get_length",
            Request::GetInfo { .. } => "get_info",
            Request::SetInfo { .. } => "set_info",
            Request::Delete { .. } => "delete",
            Request::MkDir { .. } => "mkdir",
            Request::CreateFile { .. } => "create_file",
            Request::RmDir { .. } => "rmdir",
            Request::ReadAt { .. } => "read_at",
            Request::WriteAt { .. } => "write_at",
            Request::SyncFile { .. } => "sync_file",
            Request::RequestRead { .. } => "request_read",
            Request::RequestWrite { .. } => "request_write",
            Request::AckRead { .. } => "ack_read",
            Request::AckWrite { .. } => "ack_write",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Size(u64),
    Length(u64),
    Info(InodeRecord),
    Done,
    Created(Ino),
    Data(Vec<u8>),
    Written(u64),
    Granted(bool),
    Stamp(Timestamp),
    Error { errno: i32, message: String },
}

impl Response {
    pub fn from_error(e: &Error) -> Self {
        Response::Error {
            errno:   e.to_errno(),
            message: e.to_string(),
        }
    }

    /// Turns an error answer back into an [Error].
    pub fn into_result(self) -> Result<Self> {
        match self {
            Response::Error { errno, message } => RemoteSnafu { errno, message }.fail(),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_their_errno() {
        let r = Response::Error {
            errno:   libc::ENOTEMPTY,
            message: "busy".to_string(),
        };
        let frame = Envelope {
            id:         9,
            timeout_ms: None,
            body:       r,
        }
        .encode()
        .unwrap();
        let back = Envelope::<Response>::decode(&frame).unwrap();
        assert_eq!(back.id, 9);
        let err = back.body.into_result().unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn optional_fields_stay_absent() {
        let req = Request::SetInfo {
            ino: Ino(3),
            req: SetInfoRequest::default().with_owner(None, Some(0)),
        };
        let frame = Envelope {
            id:         1,
            timeout_ms: Some(10),
            body:       req.clone(),
        }
        .encode()
        .unwrap();
        let back = Envelope::<Request>::decode(&frame).unwrap();
        assert_eq!(back.body, req);
        match back.body {
            Request::SetInfo { req, .. } => {
                assert_eq!(req.uid, None);
                assert_eq!(req.gid, Some(0));
            }
            _ => unreachable!(),
        }
    }
}
