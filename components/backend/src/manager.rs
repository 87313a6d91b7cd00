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

use std::sync::Arc;

use async_trait::async_trait;
use mftfs_common::FH;
use mftfs_meta::RequestContext;
use mftfs_types::{ino::Ino, record::InodeRecord, setattr::SetInfoRequest};

use crate::err::Result;

pub type BackendRef = Arc<dyn FsManager>;

/// The one operation set the dispatcher needs from a storage backend.
///
/// Every method may be called concurrently from many kernel requests.
#[async_trait]
pub trait FsManager: Send + Sync + 'static {
    /// [start] connects to the backing store and discovers its tree.
    async fn start(&self, ctx: &RequestContext) -> Result<()>;
    /// [teardown] drops the connection; the backend may be started again.
    async fn teardown(&self) -> Result<()>;
    /// [destroy] tears down and releases everything the backend owns
    /// locally. Called once on unmount.
    async fn destroy(&self) -> Result<()>;

    /// [get_size] returns the total bytes held by regular files.
    async fn get_size(&self, ctx: &RequestContext) -> Result<u64>;
    /// [get_length] returns the number of known inodes.
    async fn get_length(&self, ctx: &RequestContext) -> Result<u64>;

    async fn get_info(&self, ctx: &RequestContext, ino: Ino) -> Result<InodeRecord>;
    /// [set_info] applies the present fields and returns the refreshed record.
    async fn set_info(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        req: SetInfoRequest,
    ) -> Result<InodeRecord>;
    /// [delete] forgets the record of `ino` (and anything under it). Native
    /// content is left alone. Deleting twice reports not found.
    async fn delete(&self, ctx: &RequestContext, ino: Ino) -> Result<()>;

    async fn mkdir(&self, ctx: &RequestContext, parent: Ino, name: &str, mode: u32) -> Result<Ino>;
    async fn create_file(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &str,
        mode: u32,
    ) -> Result<Ino>;
    /// [rmdir] removes an empty directory natively and drops its record.
    async fn rmdir(&self, ctx: &RequestContext, ino: Ino) -> Result<()>;

    /// [read_at] returns the bytes transferred, short counts are not retried.
    async fn read_at(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize>;
    async fn write_at(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        data: &[u8],
        offset: u64,
    ) -> Result<usize>;
    async fn sync_file(&self, ctx: &RequestContext, ino: Ino) -> Result<()>;

    async fn generate_handle(&self, ctx: &RequestContext, ino: Ino) -> Result<FH>;
    async fn delete_handle(&self, ctx: &RequestContext, fh: FH) -> Result<()>;
    /// [resolve_handle] returns the inode `fh` was minted for.
    async fn resolve_handle(&self, ctx: &RequestContext, fh: FH) -> Result<Ino>;
}

// Every backend variant must keep satisfying the contract.
const _: fn() = || {
    fn is_backend<T: FsManager>() {}
    is_backend::<crate::local::LocalFsManager>();
    is_backend::<crate::session::SessionFsManager>();
    is_backend::<crate::coherence::CoherentManager>();
    is_backend::<crate::remote::RemoteFsManager>();
};
