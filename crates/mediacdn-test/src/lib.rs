//! Helpers for testing the edge node, the origin and the client.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let cache_dir = test::tempdir()`. When dropped too early,
//!    the store recreates the directory lazily and it is leaked.
//!
//!  - Servers ([`Server`], [`OriginStub`]) stop serving when dropped. Hold them until all requests
//!    have been made.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{self, Path, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the mediacdn crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "mediacdn=trace,mediacdn_service=trace,mediacdn_cli=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Spawns a server for the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A file served by the [`OriginStub`].
#[derive(Debug, Clone)]
pub struct StubObject {
    pub content: Bytes,
    /// The `Content-Type` to respond with. `None` omits the header entirely.
    pub content_type: Option<String>,
}

type ObjectMap = BTreeMap<(String, String, String), StubObject>;

#[derive(Debug, Clone, Default)]
struct StubState {
    objects: Arc<Mutex<ObjectMap>>,
    status: Arc<Mutex<Option<StatusCode>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

/// An in-memory stand-in for the origin API.
///
/// Serves `/origin/series`, `/origin/types/{series}`, `/origin/list-files/{series}/{type}` and
/// `/origin/{series}/{type}/{filename}` from the objects inserted via [`insert`](Self::insert),
/// and counts every request it receives.
pub struct OriginStub {
    server: Server,
    state: StubState,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl OriginStub {
    pub fn new() -> Self {
        let state = StubState::default();
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            let state = state.clone();
            move |extract::OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                let state = state.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        *hits.entry(uri.path().to_owned()).or_default() += 1;
                    }

                    let delay = *state.delay.lock().unwrap();
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    let status = *state.status.lock().unwrap();
                    if let Some(status) = status {
                        return (status, "injected failure").into_response();
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/origin/series", get(list_series))
            .route("/origin/types/{series}", get(list_types))
            .route("/origin/list-files/{series}/{ty}", get(list_files))
            .route("/origin/{series}/{ty}/{filename}", get(get_object))
            .with_state(state.clone())
            .layer(middleware::from_fn(hitcounter));

        Self {
            server: Server::with_router(router),
            state,
            hits,
        }
    }

    /// Adds (or replaces) a file.
    pub fn insert(
        &self,
        series: &str,
        ty: &str,
        filename: &str,
        content: impl Into<Bytes>,
        content_type: Option<&str>,
    ) {
        let object = StubObject {
            content: content.into(),
            content_type: content_type.map(str::to_owned),
        };
        self.state.objects.lock().unwrap().insert(
            (series.to_owned(), ty.to_owned(), filename.to_owned()),
            object,
        );
    }

    /// Answers every following request with `status`, or serves normally again with `None`.
    pub fn respond_with(&self, status: Option<StatusCode>) {
        *self.state.status.lock().unwrap() = status;
    }

    /// Delays every following response.
    pub fn delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// The total number of requests since the last call, resetting the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Requests per path since the last call, resetting the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// The base URL of the origin API, to be used as the edge node's `origin_url`.
    pub fn url(&self) -> Url {
        self.server.url("origin")
    }
}

impl Default for OriginStub {
    fn default() -> Self {
        Self::new()
    }
}

async fn list_series(State(state): State<StubState>) -> Json<Vec<String>> {
    let objects = state.objects.lock().unwrap();
    let series: BTreeSet<_> = objects.keys().map(|(s, _, _)| s.clone()).collect();
    Json(series.into_iter().collect())
}

async fn list_types(
    State(state): State<StubState>,
    Path(series): Path<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    let objects = state.objects.lock().unwrap();
    let types: BTreeSet<_> = objects
        .keys()
        .filter(|(s, _, _)| *s == series)
        .map(|(_, t, _)| t.clone())
        .collect();
    if types.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(types.into_iter().collect()))
}

async fn list_files(
    State(state): State<StubState>,
    Path((series, ty)): Path<(String, String)>,
) -> Result<Json<Vec<String>>, StatusCode> {
    let objects = state.objects.lock().unwrap();
    let files: Vec<_> = objects
        .keys()
        .filter(|(s, t, _)| *s == series && *t == ty)
        .map(|(_, _, f)| f.clone())
        .collect();
    if files.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(files))
}

async fn get_object(
    State(state): State<StubState>,
    Path(key): Path<(String, String, String)>,
) -> Response {
    let object = state.objects.lock().unwrap().get(&key).cloned();
    let Some(object) = object else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut response = Response::new(Body::from(object.content));
    if let Some(content_type) = object.content_type {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&content_type).unwrap(),
        );
    }
    response
}
