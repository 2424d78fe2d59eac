use axum::Json;
use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mediacdn_service::orchestrator::InvalidateError;
use mediacdn_service::origin::OriginError;
use mediacdn_service::types::ObjectKey;

use super::responder;
use super::{EdgeState, ResponseError};

type KeyPath = Result<Path<(String, String, String)>, PathRejection>;
type Listing = (StatusCode, Json<Vec<String>>);

fn object_key(path: KeyPath) -> Result<ObjectKey, ResponseError> {
    let Path((series, ty, filename)) = path?;
    Ok(ObjectKey::new(series, ty, filename)?)
}

/// Maps a listing result to a JSON array response.
///
/// On failure the array is empty. The status is the origin's own one if `forward_status` is set,
/// and `500` otherwise.
fn listing(result: Result<Vec<String>, OriginError>, what: &str, forward_status: bool) -> Listing {
    match result {
        Ok(names) => (StatusCode::OK, Json(names)),
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to fetch {what} list from origin"
            );
            let status = if forward_status {
                err.status()
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(vec![]))
        }
    }
}

pub async fn list_series(State(state): State<EdgeState>) -> Listing {
    let result = state.orchestrator.origin().fetch_series_list().await;
    listing(result, "series", false)
}

pub async fn list_types(
    State(state): State<EdgeState>,
    path: Result<Path<String>, PathRejection>,
) -> Listing {
    let Ok(Path(series)) = path else {
        return (StatusCode::BAD_REQUEST, Json(vec![]));
    };
    let result = state.orchestrator.origin().fetch_types_list(&series).await;
    listing(result, "types", false)
}

pub async fn list_files(
    State(state): State<EdgeState>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> Listing {
    let Ok(Path((series, ty))) = path else {
        return (StatusCode::BAD_REQUEST, Json(vec![]));
    };
    let result = state.orchestrator.origin().fetch_file_list(&series, &ty).await;
    listing(result, "file", true)
}

pub async fn get_object(
    State(state): State<EdgeState>,
    path: KeyPath,
) -> Result<Response, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /cdn"));
    });

    let key = object_key(path)?;
    tracing::info!(%key, "Fetching file");

    let object = state.orchestrator.resolve(&key).await?;
    tracing::debug!(%key, served_from = ?object.served_from, "Serving file");
    responder::respond(object, state.max_age)
}

pub async fn invalidate(State(state): State<EdgeState>, path: KeyPath) -> Response {
    let key = match object_key(path) {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    match state.orchestrator.invalidate(&key).await {
        Ok(()) => {
            tracing::info!(%key, "Cache invalidated");
            (StatusCode::OK, "invalidated").into_response()
        }
        Err(InvalidateError::NotFound) => {
            (StatusCode::NOT_FOUND, "File not found in cache").into_response()
        }
        Err(err @ InvalidateError::Store(_)) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                %key,
                "Failed to invalidate cache"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to invalidate cache").into_response()
        }
    }
}
