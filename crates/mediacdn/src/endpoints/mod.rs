use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use mediacdn_service::metric;
use mediacdn_service::orchestrator::CacheOrchestrator;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

mod edge;
mod error;
mod origin;
mod responder;

pub use error::ResponseError;

/// Shared state of the edge node's handlers.
#[derive(Debug, Clone)]
pub struct EdgeState {
    pub orchestrator: CacheOrchestrator,
    /// Freshness window advertised to clients.
    pub max_age: Duration,
}

/// Shared state of the origin's handlers.
#[derive(Debug, Clone)]
pub struct OriginState {
    pub content_dir: Arc<PathBuf>,
    /// Freshness window advertised to clients.
    pub max_age: Duration,
}

impl OriginState {
    pub fn new(content_dir: PathBuf, max_age: Duration) -> Self {
        Self {
            content_dir: Arc::new(content_dir),
            max_age,
        }
    }
}

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

/// Records the duration and status code of every request.
async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;

    metric!(timer("requests.duration") = start.elapsed());
    metric!(
        counter("responses.status_code") += 1,
        "status" => response.status().as_str(),
    );
    response
}

pub fn create_edge_app(state: EdgeState) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(middleware::from_fn(track_metrics));

    Router::new()
        .route("/cdn/list-series", get(edge::list_series))
        .route("/cdn/list-types/{series}", get(edge::list_types))
        .route("/cdn/list-files/{series}/{ty}", get(edge::list_files))
        .route(
            "/cdn/invalidate/{series}/{ty}/{filename}",
            post(edge::invalidate),
        )
        .route("/cdn/{series}/{ty}/{filename}", get(edge::get_object))
        .with_state(state)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

pub fn create_origin_app(state: OriginState) -> Router {
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(middleware::from_fn(track_metrics));

    Router::new()
        .route("/origin/series", get(origin::list_series))
        .route("/origin/types/{series}", get(origin::list_types))
        .route("/origin/list-files/{series}/{ty}", get(origin::list_files))
        .route("/origin/{series}/{ty}/{filename}", get(origin::get_file))
        .with_state(state)
        .layer(layer)
        .route("/healthcheck", get(healthcheck))
}
