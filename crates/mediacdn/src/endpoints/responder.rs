//! Turns resolved objects into HTTP responses.

use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use chrono::{DateTime, Utc};
use mediacdn_service::orchestrator::{ObjectBody, ServableObject, ServedFrom};
use tokio_util::io::ReaderStream;

use super::ResponseError;

/// How the client should present a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Display in place, used for fresh fetches.
    Inline,
    /// Force a download, used for objects re-served from the store.
    Attachment,
}

impl From<ServedFrom> for Disposition {
    fn from(served_from: ServedFrom) -> Self {
        match served_from {
            ServedFrom::Origin => Self::Inline,
            ServedFrom::Cache => Self::Attachment,
        }
    }
}

/// Formats `Content-Disposition` with a quoted `filename` parameter.
///
/// Control characters cannot appear in a header and are replaced by `_`. Non-ASCII names are
/// passed through as raw UTF-8.
pub fn content_disposition(disposition: Disposition, filename: &str) -> HeaderValue {
    let kind = match disposition {
        Disposition::Inline => "inline",
        Disposition::Attachment => "attachment",
    };

    let mut value = format!("{kind}; filename=\"");
    for c in filename.chars() {
        match c {
            '"' | '\\' => {
                value.push('\\');
                value.push(c);
            }
            c if c.is_control() => value.push('_'),
            c => value.push(c),
        }
    }
    value.push('"');

    HeaderValue::from_bytes(value.as_bytes()).unwrap_or_else(|_| HeaderValue::from_static(kind))
}

/// `Cache-Control` advising revalidation after `max_age`.
pub fn cache_control(max_age: Duration) -> String {
    format!("max-age={}, must-revalidate", max_age.as_secs())
}

/// Formats `time` as an HTTP date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Builds a `200` response with all content headers for a file-like body.
pub fn file_response(
    body: Body,
    len: u64,
    content_type: &str,
    disposition: Disposition,
    filename: &str,
    last_modified: SystemTime,
    max_age: Duration,
) -> Result<Response, ResponseError> {
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, len)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(disposition, filename),
        )
        .header(header::CACHE_CONTROL, cache_control(max_age))
        .header(header::LAST_MODIFIED, http_date(last_modified))
        .body(body)?;
    Ok(response)
}

/// Responds with a resolved object.
///
/// The disposition depends on where the object came from: fresh fetches are `inline`, objects
/// served from the store are `attachment`.
pub fn respond(object: ServableObject, max_age: Duration) -> Result<Response, ResponseError> {
    let (body, len) = match object.body {
        ObjectBody::Bytes(bytes) => {
            let len = bytes.len() as u64;
            (Body::from(bytes), len)
        }
        ObjectBody::File { file, len } => (Body::from_stream(ReaderStream::new(file)), len),
    };

    file_response(
        body,
        len,
        &object.content_type,
        object.served_from.into(),
        &object.filename,
        object.last_modified,
        max_age,
    )
}
