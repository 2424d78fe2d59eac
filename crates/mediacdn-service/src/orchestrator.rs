//! The read-through cache of the edge node.
//!
//! [`CacheOrchestrator::resolve`] serves an object from the [`ObjectStore`] when it is resident.
//! Otherwise the object is fetched from the origin, written into the store and served from the
//! fetched bytes. Both paths produce a [`ServableObject`]; they differ in where the metadata comes
//! from:
//!
//! - On a hit, the content type is sniffed from the stored file and the last-modified timestamp
//!   is the file's mtime.
//! - On a miss, the content type is whatever the origin declared and the last-modified timestamp
//!   is the moment of the fetch.
//!
//! With fetch de-duplication enabled, concurrent misses for the same key share a single
//! fetch-and-populate operation. That operation runs as its own task, so it completes and
//! populates the store even when every request waiting on it goes away.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream;
use thiserror::Error;

use crate::config::EdgeConfig;
use crate::origin::{FetchedObject, HttpOriginClient, OriginClient, OriginError};
use crate::sniff::sniff_file;
use crate::store::{ObjectStore, StoreError};
use crate::types::ObjectKey;

/// Where a [`ServableObject`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    /// The object was resident in the store.
    Cache,
    /// The object was just fetched from the origin.
    Origin,
}

/// The payload of a [`ServableObject`].
#[derive(Debug)]
pub enum ObjectBody {
    /// Bytes fetched from the origin.
    Bytes(Bytes),
    /// An open file in the store, positioned at its start.
    File { file: tokio::fs::File, len: u64 },
}

/// An object ready to be sent to a client.
#[derive(Debug)]
pub struct ServableObject {
    pub body: ObjectBody,
    pub content_type: String,
    pub last_modified: SystemTime,
    pub served_from: ServedFrom,
    pub filename: String,
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error("failed to access object store")]
    Store(#[source] StoreError),
    #[error("fetch task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Error)]
pub enum InvalidateError {
    #[error("file not found in cache")]
    NotFound,
    #[error("failed to delete cached object")]
    Store(#[source] StoreError),
}

/// Tunables of the [`CacheOrchestrator`].
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Share one origin fetch between concurrent misses for the same key.
    pub deduplicate_fetches: bool,
    /// Fail the request when the fetched object cannot be written to the store.
    pub strict_cache_writes: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            deduplicate_fetches: true,
            strict_cache_writes: false,
        }
    }
}

type SharedPopulate = Shared<BoxFuture<'static, Result<FetchedObject, ResolveError>>>;
type InFlightMap = Arc<Mutex<HashMap<ObjectKey, SharedPopulate>>>;

/// Removes a key from the in-flight map once its populate task is done.
struct InFlightGuard {
    map: InFlightMap,
    key: ObjectKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[derive(Clone)]
pub struct CacheOrchestrator {
    store: ObjectStore,
    origin: Arc<dyn OriginClient>,
    in_flight: Option<InFlightMap>,
    strict_cache_writes: bool,
}

impl fmt::Debug for CacheOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOrchestrator")
            .field("store", &self.store)
            .field("origin", &self.origin)
            .field("deduplicate_fetches", &self.in_flight.is_some())
            .field("strict_cache_writes", &self.strict_cache_writes)
            .finish()
    }
}

impl CacheOrchestrator {
    pub fn new(store: ObjectStore, origin: Arc<dyn OriginClient>, options: ResolveOptions) -> Self {
        Self {
            store,
            origin,
            in_flight: options.deduplicate_fetches.then(Default::default),
            strict_cache_writes: options.strict_cache_writes,
        }
    }

    pub fn from_config(config: &EdgeConfig) -> anyhow::Result<Self> {
        let store = ObjectStore::from_config(config)?;
        let origin = HttpOriginClient::from_config(config)?;
        let options = ResolveOptions {
            deduplicate_fetches: config.deduplicate_fetches,
            strict_cache_writes: config.strict_cache_writes,
        };
        Ok(Self::new(store, Arc::new(origin), options))
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The origin, for pass-through requests such as listings.
    pub fn origin(&self) -> &dyn OriginClient {
        self.origin.as_ref()
    }

    /// Serves `key` from the store, populating it from the origin on a miss.
    #[tracing::instrument(skip_all, fields(%key))]
    pub async fn resolve(&self, key: &ObjectKey) -> Result<ServableObject, ResolveError> {
        if self.store.exists(key).await {
            match self.serve_cached(key).await {
                Ok(object) => {
                    metric!(counter("edge.resolve") += 1, "path" => "hit");
                    return Ok(object);
                }
                // deleted between the existence check and opening it
                Err(StoreError::NotFound) => {}
                Err(err) => return Err(ResolveError::Store(err)),
            }
        }

        metric!(counter("edge.resolve") += 1, "path" => "miss");
        let fetched = self.fetch_and_populate(key).await?;

        Ok(ServableObject {
            body: ObjectBody::Bytes(fetched.bytes),
            content_type: fetched.content_type,
            last_modified: SystemTime::now(),
            served_from: ServedFrom::Origin,
            filename: key.filename().to_owned(),
        })
    }

    /// Removes `key` from the store. The origin is never contacted.
    pub async fn invalidate(&self, key: &ObjectKey) -> Result<(), InvalidateError> {
        let result = match self.store.delete(key).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(InvalidateError::NotFound),
            Err(err) => Err(InvalidateError::Store(err)),
        };

        let label = match &result {
            Ok(()) => "invalidated",
            Err(InvalidateError::NotFound) => "not_found",
            Err(InvalidateError::Store(_)) => "error",
        };
        metric!(counter("edge.invalidate") += 1, "result" => label);
        result
    }

    async fn serve_cached(&self, key: &ObjectKey) -> Result<ServableObject, StoreError> {
        let mut object = self.store.read_stream(key).await?;

        let content_type = sniff_file(&mut object.file, key.filename()).await?;

        Ok(ServableObject {
            body: ObjectBody::File {
                file: object.file,
                len: object.len,
            },
            content_type,
            last_modified: object.modified,
            served_from: ServedFrom::Cache,
            filename: key.filename().to_owned(),
        })
    }

    async fn fetch_and_populate(&self, key: &ObjectKey) -> Result<FetchedObject, ResolveError> {
        let populate = populate(
            self.store.clone(),
            self.origin.clone(),
            key.clone(),
            self.strict_cache_writes,
        );

        let Some(in_flight) = &self.in_flight else {
            return populate.await;
        };

        let shared = {
            let mut map = in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match map.get(key) {
                Some(shared) => {
                    metric!(counter("edge.fetch.deduplicated") += 1);
                    shared.clone()
                }
                None => {
                    let guard = InFlightGuard {
                        map: in_flight.clone(),
                        key: key.clone(),
                    };
                    let handle = tokio::spawn(async move {
                        let _guard = guard;
                        populate.await
                    });
                    let shared = async move {
                        handle
                            .await
                            .unwrap_or_else(|err| Err(ResolveError::Task(err.to_string())))
                    }
                    .boxed()
                    .shared();
                    map.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        shared.await
    }
}

/// Fetches `key` from the origin and writes it into the store.
async fn populate(
    store: ObjectStore,
    origin: Arc<dyn OriginClient>,
    key: ObjectKey,
    strict: bool,
) -> Result<FetchedObject, ResolveError> {
    let fetched = origin.fetch_object(&key).await?;

    let contents = stream::iter([io::Result::Ok(fetched.bytes.clone())]);
    if let Err(err) = store.write(&key, contents).await {
        metric!(counter("edge.cache.write_failed") += 1);
        if strict {
            return Err(ResolveError::Store(err));
        }
        tracing::error!(
            error = &err as &dyn std::error::Error,
            %key,
            "Failed to write fetched object to the store"
        );
    }

    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use mediacdn_test::{self as test, OriginStub};
    use reqwest::StatusCode;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::sniff::OCTET_STREAM;
    use crate::utils::http::OriginTimeouts;

    #[derive(Debug, Default)]
    struct FakeOrigin {
        objects: Mutex<HashMap<ObjectKey, FetchedObject>>,
        fetches: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeOrigin {
        fn insert(&self, key: &ObjectKey, bytes: &'static [u8], content_type: &str) {
            self.objects.lock().unwrap().insert(
                key.clone(),
                FetchedObject {
                    bytes: Bytes::from_static(bytes),
                    content_type: content_type.to_owned(),
                },
            );
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OriginClient for FakeOrigin {
        async fn fetch_object(&self, key: &ObjectKey) -> Result<FetchedObject, OriginError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| OriginError::Status {
                    status: StatusCode::NOT_FOUND,
                    message: "Not Found".into(),
                })
        }

        async fn fetch_series_list(&self) -> Result<Vec<String>, OriginError> {
            Ok(vec![])
        }

        async fn fetch_types_list(&self, _series: &str) -> Result<Vec<String>, OriginError> {
            Ok(vec![])
        }

        async fn fetch_file_list(
            &self,
            _series: &str,
            _ty: &str,
        ) -> Result<Vec<String>, OriginError> {
            Ok(vec![])
        }
    }

    fn key(series: &str, ty: &str, filename: &str) -> ObjectKey {
        ObjectKey::new(series, ty, filename).unwrap()
    }

    fn orchestrator(
        cache_dir: &std::path::Path,
        origin: Arc<FakeOrigin>,
        options: ResolveOptions,
    ) -> CacheOrchestrator {
        let store = ObjectStore::open(cache_dir, None).unwrap();
        CacheOrchestrator::new(store, origin, options)
    }

    async fn body_bytes(object: ServableObject) -> Vec<u8> {
        match object.body {
            ObjectBody::Bytes(bytes) => bytes.to_vec(),
            ObjectBody::File { mut file, len } => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await.unwrap();
                assert_eq!(buf.len() as u64, len);
                buf
            }
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::default());
        let doc = key("seriesA", "typeA", "doc.pdf");
        origin.insert(&doc, b"%PDF-1.7\n\0", "application/pdf");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        let first = orchestrator.resolve(&doc).await.unwrap();
        assert_eq!(first.served_from, ServedFrom::Origin);
        assert_eq!(first.content_type, "application/pdf");
        assert_eq!(first.filename, "doc.pdf");
        assert_eq!(body_bytes(first).await, b"%PDF-1.7\n\0");
        assert_eq!(origin.fetches(), 1);

        let second = orchestrator.resolve(&doc).await.unwrap();
        assert_eq!(second.served_from, ServedFrom::Cache);
        assert_eq!(second.content_type, "application/pdf");
        assert_eq!(body_bytes(second).await, b"%PDF-1.7\n\0");
        assert_eq!(origin.fetches(), 1);
    }

    #[tokio::test]
    async fn test_hit_metadata_comes_from_file() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::default());
        let blob = key("s", "t", "blob");
        // the origin's declaration is not persisted
        origin.insert(&blob, b"\x00\x01\x02", "image/png");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        let fresh = orchestrator.resolve(&blob).await.unwrap();
        assert_eq!(fresh.content_type, "image/png");

        let cached = orchestrator.resolve(&blob).await.unwrap();
        assert_eq!(cached.content_type, OCTET_STREAM);
        let mtime = fs::metadata(cache_dir.path().join("s/t/blob"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(cached.last_modified, mtime);
    }

    #[tokio::test]
    async fn test_round_trip_special_payloads() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::default());
        let empty = key("s", "t", "empty");
        let nul = key("s", "t", "nul");
        origin.insert(&empty, b"", "text/plain");
        origin.insert(&nul, b"\0\0a\0", "application/octet-stream");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        for (key, expected) in [(&empty, &b""[..]), (&nul, &b"\0\0a\0"[..])] {
            let fresh = orchestrator.resolve(key).await.unwrap();
            assert_eq!(body_bytes(fresh).await, expected);
            let cached = orchestrator.resolve(key).await.unwrap();
            assert_eq!(cached.served_from, ServedFrom::Cache);
            assert_eq!(body_bytes(cached).await, expected);
        }
        assert_eq!(origin.fetches(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::default());
        let doc = key("seriesA", "typeA", "doc.pdf");
        origin.insert(&doc, b"%PDF-1.7\n\0", "application/pdf");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        orchestrator.resolve(&doc).await.unwrap();
        orchestrator.invalidate(&doc).await.unwrap();
        assert_eq!(origin.fetches(), 1);

        let again = orchestrator.resolve(&doc).await.unwrap();
        assert_eq!(again.served_from, ServedFrom::Origin);
        assert_eq!(origin.fetches(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_twice() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::default());
        let doc = key("s", "t", "f");
        origin.insert(&doc, b"data", "text/plain");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        orchestrator.resolve(&doc).await.unwrap();
        assert!(orchestrator.invalidate(&doc).await.is_ok());
        assert!(matches!(
            orchestrator.invalidate(&doc).await,
            Err(InvalidateError::NotFound)
        ));
        // never resident at all
        assert!(matches!(
            orchestrator.invalidate(&key("s", "t", "other")).await,
            Err(InvalidateError::NotFound)
        ));
        assert_eq!(origin.fetches(), 1);
    }

    #[tokio::test]
    async fn test_origin_error_is_propagated() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::default());
        let missing = key("seriesB", "typeB", "missing.mp4");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        let err = orchestrator.resolve(&missing).await.unwrap_err();
        match err {
            ResolveError::Origin(err) => assert_eq!(err.status(), StatusCode::NOT_FOUND),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!orchestrator.store().exists(&missing).await);
    }

    #[tokio::test]
    async fn test_concurrent_misses_are_deduplicated() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let video = key("s", "t", "video.mp4");
        origin.insert(&video, b"\x00\x00\x00\x18ftypmp42 payload", "video/mp4");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        let resolves = (0..8).map(|_| async {
            let object = orchestrator.resolve(&video).await.unwrap();
            body_bytes(object).await
        });
        let bodies = futures::future::join_all(resolves).await;

        assert!(bodies.iter().all(|body| body == b"\x00\x00\x00\x18ftypmp42 payload"));
        assert_eq!(origin.fetches(), 1);
        assert!(orchestrator.in_flight.as_ref().unwrap().lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_without_deduplication() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let doc = key("s", "t", "doc");
        origin.insert(&doc, b"same bytes every time", "text/plain");
        let options = ResolveOptions {
            deduplicate_fetches: false,
            ..Default::default()
        };
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), options);

        let resolves = (0..4).map(|_| async {
            let object = orchestrator.resolve(&doc).await.unwrap();
            body_bytes(object).await
        });
        let bodies = futures::future::join_all(resolves).await;

        assert!(bodies.iter().all(|body| body == b"same bytes every time"));
        assert_eq!(
            fs::read(cache_dir.path().join("s/t/doc")).unwrap(),
            b"same bytes every time"
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_best_effort() {
        let cache_dir = tempfile::tempdir().unwrap();
        // a file where the type directory would have to be created
        fs::create_dir_all(cache_dir.path().join("s")).unwrap();
        fs::write(cache_dir.path().join("s/t"), b"in the way").unwrap();

        let origin = Arc::new(FakeOrigin::default());
        let doc = key("s", "t", "doc.pdf");
        origin.insert(&doc, b"%PDF-1.7", "application/pdf");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        let object = orchestrator.resolve(&doc).await.unwrap();
        assert_eq!(object.served_from, ServedFrom::Origin);
        assert_eq!(body_bytes(object).await, b"%PDF-1.7");
        assert!(!orchestrator.store().exists(&doc).await);
    }

    #[tokio::test]
    async fn test_write_failure_in_strict_mode() {
        let cache_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(cache_dir.path().join("s")).unwrap();
        fs::write(cache_dir.path().join("s/t"), b"in the way").unwrap();

        let origin = Arc::new(FakeOrigin::default());
        let doc = key("s", "t", "doc.pdf");
        origin.insert(&doc, b"%PDF-1.7", "application/pdf");
        let options = ResolveOptions {
            strict_cache_writes: true,
            ..Default::default()
        };
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), options);

        let err = orchestrator.resolve(&doc).await.unwrap_err();
        assert!(matches!(err, ResolveError::Store(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_abandoned_miss_still_populates() {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        });
        let doc = key("s", "t", "doc.pdf");
        origin.insert(&doc, b"%PDF-1.7", "application/pdf");
        let orchestrator = orchestrator(cache_dir.path(), origin.clone(), Default::default());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), orchestrator.resolve(&doc)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(orchestrator.in_flight.as_ref().unwrap().lock().unwrap().is_empty());
        assert!(orchestrator.store().exists(&doc).await);

        let object = orchestrator.resolve(&doc).await.unwrap();
        assert_eq!(object.served_from, ServedFrom::Cache);
        assert_eq!(body_bytes(object).await, b"%PDF-1.7");
        assert_eq!(origin.fetches(), 1);
    }

    #[tokio::test]
    async fn test_resolve_after_abandoned_http_fetch() {
        test::setup();
        let cache_dir = tempfile::tempdir().unwrap();
        let stub = OriginStub::new();
        stub.insert("s", "t", "doc.pdf", &b"%PDF-1.7"[..], Some("application/pdf"));
        stub.delay(Some(Duration::from_millis(300)));

        let timeouts = OriginTimeouts {
            connect: Duration::from_secs(1),
            max_download: Duration::from_millis(500),
        };
        let origin = HttpOriginClient::new(stub.url(), timeouts).unwrap();
        let store = ObjectStore::open(cache_dir.path(), None).unwrap();
        let orchestrator = CacheOrchestrator::new(store, Arc::new(origin), Default::default());
        let doc = key("s", "t", "doc.pdf");

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), orchestrator.resolve(&doc)).await;
        assert!(abandoned.is_err());

        stub.delay(None);
        tokio::time::sleep(Duration::from_millis(800)).await;

        let object = orchestrator.resolve(&doc).await.unwrap();
        assert_eq!(body_bytes(object).await, b"%PDF-1.7");
        assert!(orchestrator.in_flight.as_ref().unwrap().lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_fetch_caches_nothing() {
        test::setup();
        let cache_dir = tempfile::tempdir().unwrap();
        let stub = OriginStub::new();
        stub.insert("s", "t", "slow.mp4", &b"data"[..], Some("video/mp4"));
        stub.delay(Some(Duration::from_millis(500)));

        let timeouts = OriginTimeouts {
            connect: Duration::from_secs(1),
            max_download: Duration::from_millis(100),
        };
        let origin = HttpOriginClient::new(stub.url(), timeouts).unwrap();
        let store = ObjectStore::open(cache_dir.path(), None).unwrap();
        let orchestrator = CacheOrchestrator::new(store, Arc::new(origin), Default::default());
        let slow = key("s", "t", "slow.mp4");

        let err = orchestrator.resolve(&slow).await.unwrap_err();
        assert!(matches!(err, ResolveError::Origin(OriginError::Timeout(_))));
        assert!(!orchestrator.store().exists(&slow).await);
    }
}
