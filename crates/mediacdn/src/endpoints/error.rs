use axum::Json;
use axum::extract::rejection::PathRejection;
use axum::http::{Error as HttpError, StatusCode};
use axum::response::{IntoResponse, Response};
use mediacdn_service::orchestrator::ResolveError;
use mediacdn_service::types::KeyError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

/// An error that is rendered as a JSON body with the given status.
///
/// The body carries the error's message as `detail` and the messages of its sources as `causes`.
/// Server errors are additionally reported to Sentry.
#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl ResponseError {
    pub fn new(status: StatusCode, err: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            err: err.into(),
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<PathRejection> for ResponseError {
    fn from(err: PathRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            anyhow::Error::new(err).context("invalid path"),
        )
    }
}

impl From<KeyError> for ResponseError {
    fn from(err: KeyError) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            anyhow::Error::new(err).context("invalid object key"),
        )
    }
}

impl From<ResolveError> for ResponseError {
    fn from(err: ResolveError) -> Self {
        // origin statuses such as 404 are passed on to the client
        let status = match &err {
            ResolveError::Origin(origin) => origin.status(),
            ResolveError::Store(_) | ResolveError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err)
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((status, message): (StatusCode, &'static str)) -> Self {
        Self::new(status, anyhow::Error::msg(message))
    }
}

impl From<std::io::Error> for ResponseError {
    fn from(err: std::io::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

impl From<HttpError> for ResponseError {
    fn from(err: HttpError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        (self.status, Json(ApiErrorResponse::from(self.err))).into_response()
    }
}

/// The JSON body of an error response.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let detail = err.to_string();
        let causes: Vec<_> = err.chain().skip(1).map(ToString::to_string).collect();

        Self {
            detail: Some(detail),
            causes: (!causes.is_empty()).then_some(causes),
        }
    }
}

#[cfg(test)]
mod tests {
    use mediacdn_service::origin::OriginError;

    use super::*;

    #[test]
    fn test_origin_status_is_forwarded() {
        let err = ResolveError::Origin(OriginError::Status {
            status: StatusCode::NOT_FOUND,
            message: "File not found".into(),
        });
        assert_eq!(ResponseError::from(err).status(), StatusCode::NOT_FOUND);

        let err = ResolveError::Origin(OriginError::Unavailable("connection refused".into()));
        assert_eq!(
            ResponseError::from(err).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_chain() {
        let err = ResponseError::from(KeyError::Separator("filename"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let body = ApiErrorResponse::from(err.err);
        assert_eq!(body.detail.as_deref(), Some("invalid object key"));
        assert_eq!(
            body.causes.unwrap(),
            ["the filename component contains a path separator"]
        );
    }
}
