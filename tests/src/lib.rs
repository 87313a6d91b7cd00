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

//! Scenarios that cross crate boundaries: the dispatcher on top of each
//! backend, and several remote mounts sharing one server.

#[cfg(test)]
mod test_utils {
    use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

    use mftfs_backend::{
        BackendRef, CoherenceConfig, CoherentManager, FsManager, LocalFsManager, RemoteConfig,
        RemoteFsManager, RemoteServer, SessionFsManager,
    };
    use mftfs_fuse::{dispatcher::Lookup, DispatchConfig, Dispatcher};
    use mftfs_meta::RequestContext;
    use mftfs_types::{ino::Ino, record::InodeRecord};
    use rstest::fixture;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    pub struct Server {
        pub data:     tempfile::TempDir,
        pub addr:     String,
        pub shutdown: CancellationToken,
    }

    impl Drop for Server {
        fn drop(&mut self) { self.shutdown.cancel(); }
    }

    /// An authoritative server over a fresh tree holding `/a.txt`.
    #[fixture]
    pub async fn server() -> Server {
        mftfs_utils::logger::install_fmt_log();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("a.txt"), b"hello").unwrap();

        let manager = Arc::new(CoherentManager::new(Arc::new(LocalFsManager::new(
            data.path(),
        ))));
        manager.start(&RequestContext::background()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let server = Arc::new(RemoteServer::new(manager, Duration::from_secs(5)));
        tokio::spawn(server.serve(listener, shutdown.clone()));
        Server {
            data,
            addr,
            shutdown,
        }
    }

    pub fn remote(addr: &str, cache_dir: &Path, write_retries: usize) -> BackendRef {
        let mut config = RemoteConfig::default();
        config.with_addr(addr).with_cache_dir(cache_dir);
        config.coherence = CoherenceConfig {
            write_retries,
            ..Default::default()
        };
        Arc::new(RemoteFsManager::new(config))
    }

    pub fn local(root: &Path) -> BackendRef { Arc::new(LocalFsManager::new(root)) }

    pub fn memory_session() -> BackendRef {
        let options = HashMap::from([("root".to_string(), "/".to_string())]);
        Arc::new(SessionFsManager::new("memory", options))
    }

    pub async fn dispatcher(backend: BackendRef) -> Dispatcher {
        let d = Dispatcher::new(DispatchConfig::default(), backend);
        d.init(&RequestContext::background()).await.unwrap();
        d
    }

    pub async fn found(d: &Dispatcher, parent: Ino, name: &str) -> InodeRecord {
        match d
            .lookup(&RequestContext::background(), parent, name)
            .await
            .unwrap()
        {
            Lookup::Found(record) => record,
            Lookup::Negative => panic!("{name} is missing"),
        }
    }
}

#[cfg(test)]
mod end_to_end {
    use mftfs_fuse::Dispatcher;
    use mftfs_meta::RequestContext;
    use mftfs_types::{ino::ROOT_INO, ToErrno};
    use rstest::rstest;

    use crate::test_utils::*;

    async fn lookup_read_write_read(d: &Dispatcher) {
        let ctx = RequestContext::background();
        let a = found(d, ROOT_INO, "a.txt").await;
        assert_eq!(a.size, 5);
        assert!(!a.is_dir());

        let fh = d.open(&ctx, a.ino).await.unwrap();
        assert_eq!(d.read(&ctx, a.ino, fh, 0, 5).await.unwrap(), b"hello");
        assert_eq!(d.write(&ctx, a.ino, fh, 2, b"XY").await.unwrap(), 2);
        d.fsync(&ctx, a.ino, fh).await.unwrap();
        assert_eq!(d.read(&ctx, a.ino, fh, 0, 5).await.unwrap(), b"heXYo");
        d.release(&ctx, fh).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn over_the_local_backend() {
        mftfs_utils::logger::install_fmt_log();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("a.txt"), b"hello").unwrap();
        let d = dispatcher(local(data.path())).await;

        lookup_read_write_read(&d).await;
        assert_eq!(std::fs::read(data.path().join("a.txt")).unwrap(), b"heXYo");
        d.destroy().await;
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn over_the_remote_backend(#[future] server: Server) {
        let server = server.await;
        let caches = tempfile::tempdir().unwrap();
        let d = dispatcher(remote(&server.addr, caches.path(), 3)).await;

        lookup_read_write_read(&d).await;
        assert_eq!(
            std::fs::read(server.data.path().join("a.txt")).unwrap(),
            b"heXYo"
        );
        d.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn over_a_memory_session() {
        let d = dispatcher(memory_session()).await;
        let ctx = RequestContext::background();

        let dir = d.mkdir(&ctx, ROOT_INO, "docs", 0o755).await.unwrap();
        let (file, fh) = d.create(&ctx, dir.ino, "a.txt", 0o644).await.unwrap();
        assert_eq!(d.write(&ctx, file.ino, fh, 0, b"hello").await.unwrap(), 5);
        assert_eq!(d.read(&ctx, file.ino, fh, 1, 3).await.unwrap(), b"ell");
        assert_eq!(found(&d, dir.ino, "a.txt").await.size, 5);

        let err = d.rmdir(&ctx, ROOT_INO, "docs").await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    }
}

#[cfg(test)]
mod coherence {
    use std::path::Path;

    use mftfs_fuse::Dispatcher;
    use mftfs_meta::RequestContext;
    use mftfs_types::{ino::ROOT_INO, ToErrno};
    use rstest::rstest;

    use crate::test_utils::*;

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mounts_see_each_others_writes(#[future] server: Server) {
        let server = server.await;
        let caches = tempfile::tempdir().unwrap();
        let ctx = RequestContext::background();
        let one = dispatcher(remote(&server.addr, &caches.path().join("one"), 3)).await;
        let two = dispatcher(remote(&server.addr, &caches.path().join("two"), 3)).await;

        let a1 = found(&one, ROOT_INO, "a.txt").await;
        let a2 = found(&two, ROOT_INO, "a.txt").await;
        assert_eq!(a1.ino, a2.ino);
        let fh1 = one.open(&ctx, a1.ino).await.unwrap();
        let fh2 = two.open(&ctx, a2.ino).await.unwrap();

        assert_eq!(one.read(&ctx, a1.ino, fh1, 0, 5).await.unwrap(), b"hello");
        assert_eq!(two.read(&ctx, a2.ino, fh2, 0, 5).await.unwrap(), b"hello");
        let before = one.getattr(&ctx, a1.ino).await.unwrap().content_write_time;

        two.write(&ctx, a2.ino, fh2, 0, b"J").await.unwrap();
        assert_eq!(one.read(&ctx, a1.ino, fh1, 0, 5).await.unwrap(), b"Jello");

        // one holds the newest copy again, two is now stale; its write is
        // declined, refreshed and retried.
        one.write(&ctx, a1.ino, fh1, 4, b"y").await.unwrap();
        two.write(&ctx, a2.ino, fh2, 1, b"E").await.unwrap();
        let after = two.getattr(&ctx, a2.ino).await.unwrap();
        assert!(after.content_write_time > before);
        assert!(after.cache_valid);

        assert_eq!(one.read(&ctx, a1.ino, fh1, 0, 5).await.unwrap(), b"JElly");
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stale_writer_gives_up_without_retries(#[future] server: Server) {
        let server = server.await;
        let caches = tempfile::tempdir().unwrap();
        let ctx = RequestContext::background();
        let one = dispatcher(remote(&server.addr, &caches.path().join("one"), 0)).await;
        let two = dispatcher(remote(&server.addr, &caches.path().join("two"), 0)).await;

        let a = found(&one, ROOT_INO, "a.txt").await;
        let fh1 = one.open(&ctx, a.ino).await.unwrap();
        let fh2 = two.open(&ctx, a.ino).await.unwrap();
        one.read(&ctx, a.ino, fh1, 0, 5).await.unwrap();
        two.read(&ctx, a.ino, fh2, 0, 5).await.unwrap();

        one.write(&ctx, a.ino, fh1, 0, b"M").await.unwrap();
        let err = two.write(&ctx, a.ino, fh2, 0, b"N").await.unwrap_err();
        assert!(err.is_stale_cache());
        assert_eq!(err.to_errno(), libc::EAGAIN);
        assert_eq!(std::fs::read(server.data.path().join("a.txt")).unwrap(), b"Mello");
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_all_land(#[future] server: Server) {
        let server = server.await;
        let caches = tempfile::tempdir().unwrap();
        let ctx = RequestContext::background();
        let mounts = remote_mounts(&server.addr, caches.path(), 3).await;

        let a = found(&mounts[0], ROOT_INO, "a.txt").await;
        let mut tasks = Vec::new();
        for (i, d) in mounts.into_iter().enumerate() {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let fh = d.open(&ctx, a.ino).await.unwrap();
                d.write(&ctx, a.ino, fh, i as u64, &[b'0' + i as u8]).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(std::fs::read(server.data.path().join("a.txt")).unwrap(), b"012lo");
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn forgetting_on_one_mount_leaves_the_others(#[future] server: Server) {
        let server = server.await;
        let caches = tempfile::tempdir().unwrap();
        let ctx = RequestContext::background();
        let one = dispatcher(remote(&server.addr, &caches.path().join("one"), 3)).await;
        let two = dispatcher(remote(&server.addr, &caches.path().join("two"), 3)).await;

        let a = found(&one, ROOT_INO, "a.txt").await;
        one.forget(&ctx, a.ino, 1).await.unwrap();

        let again = found(&two, ROOT_INO, "a.txt").await;
        assert_eq!(again.ino, a.ino);
        let fh = two.open(&ctx, a.ino).await.unwrap();
        assert_eq!(two.read(&ctx, a.ino, fh, 0, 5).await.unwrap(), b"hello");
        // the forgetting mount finds it again as well.
        assert_eq!(found(&one, ROOT_INO, "a.txt").await.ino, a.ino);
        assert!(server.data.path().join("a.txt").exists());
    }

    async fn remote_mounts(addr: &str, caches: &Path, n: usize) -> Vec<Dispatcher> {
        let mut mounts = Vec::with_capacity(n);
        for i in 0..n {
            mounts.push(dispatcher(remote(addr, &caches.join(i.to_string()), 8)).await);
        }
        mounts
    }
}
