//! Access to the upstream origin.
//!
//! The [`OriginClient`] trait is the seam between the orchestrator and the network. The
//! production implementation, [`HttpOriginClient`], talks to the origin's HTTP API:
//!
//! - `GET {base}/series`
//! - `GET {base}/types/{series}`
//! - `GET {base}/list-files/{series}/{type}`
//! - `GET {base}/{series}/{type}/{filename}`
//!
//! Requests are never retried and are bounded by the configured [`OriginTimeouts`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, header};
use thiserror::Error;
use url::Url;

use crate::config::EdgeConfig;
use crate::sniff::OCTET_STREAM;
use crate::types::ObjectKey;
use crate::utils::http::{OriginTimeouts, create_client};

/// How much of an error response body is kept as the error message.
const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// An object as delivered by the origin.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Bytes,
    /// The declared `Content-Type`, [`OCTET_STREAM`] when the origin sent none.
    pub content_type: String,
}

/// Failure to get a successful response from the origin.
#[derive(Debug, Clone, Error)]
pub enum OriginError {
    /// The origin responded with a non-2xx status.
    #[error("origin responded with {status}: {message}")]
    Status { status: StatusCode, message: String },
    /// The request did not complete in time.
    #[error("origin request timed out after {0:?}")]
    Timeout(Duration),
    /// The origin could not be reached, or the connection broke down.
    #[error("origin unavailable: {0}")]
    Unavailable(String),
    /// The origin responded successfully, but with a body that does not parse.
    #[error("malformed origin response: {0}")]
    Malformed(String),
}

impl OriginError {
    /// The status to forward to clients.
    ///
    /// This is the origin's own status if it sent one, and `500` otherwise.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Status { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == StatusCode::NOT_FOUND
    }
}

/// Fetches objects and listings from the origin.
#[async_trait]
pub trait OriginClient: Send + Sync + fmt::Debug {
    async fn fetch_object(&self, key: &ObjectKey) -> Result<FetchedObject, OriginError>;

    async fn fetch_series_list(&self) -> Result<Vec<String>, OriginError>;

    async fn fetch_types_list(&self, series: &str) -> Result<Vec<String>, OriginError>;

    async fn fetch_file_list(&self, series: &str, ty: &str) -> Result<Vec<String>, OriginError>;
}

/// The [`OriginClient`] talking HTTP to a real origin.
#[derive(Debug, Clone)]
pub struct HttpOriginClient {
    client: reqwest::Client,
    base: Url,
    timeouts: OriginTimeouts,
}

impl HttpOriginClient {
    pub fn new(base: Url, timeouts: OriginTimeouts) -> Result<Self, OriginError> {
        if base.cannot_be_a_base() {
            return Err(OriginError::Unavailable(format!(
                "`{base}` cannot be used as origin base url"
            )));
        }
        let client =
            create_client(&timeouts).map_err(|e| OriginError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base,
            timeouts,
        })
    }

    pub fn from_config(config: &EdgeConfig) -> Result<Self, OriginError> {
        Self::new(
            config.origin_url.clone(),
            OriginTimeouts::from_config(config),
        )
    }

    /// Appends percent-encoded `segments` to the base url.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // `new` rejects urls that cannot be a base
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn map_transport_error(&self, err: reqwest::Error) -> OriginError {
        if err.is_timeout() {
            OriginError::Timeout(self.timeouts.max_download)
        } else if err.is_decode() {
            OriginError::Malformed(err.to_string())
        } else {
            OriginError::Unavailable(err.to_string())
        }
    }

    /// Sends a `GET` to `url` and ensures a successful status.
    async fn get(&self, url: Url) -> Result<reqwest::Response, OriginError> {
        tracing::trace!("Fetching {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        metric!(counter("edge.origin.fetch") += 1, "status" => status.as_str());
        if status.is_success() {
            return Ok(response);
        }

        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            let mut end = MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        if message.is_empty() {
            message = status.canonical_reason().unwrap_or("unknown").to_owned();
        }
        Err(OriginError::Status { status, message })
    }

    async fn get_list(&self, segments: &[&str]) -> Result<Vec<String>, OriginError> {
        let response = self.get(self.url(segments)).await?;
        response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))
    }
}

#[async_trait]
impl OriginClient for HttpOriginClient {
    #[tracing::instrument(skip_all, fields(%key))]
    async fn fetch_object(&self, key: &ObjectKey) -> Result<FetchedObject, OriginError> {
        let response = self.get(self.url(&key.segments())).await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(OCTET_STREAM)
            .to_owned();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        metric!(histogram("edge.origin.fetch.size") = bytes.len() as u64);

        Ok(FetchedObject {
            bytes,
            content_type,
        })
    }

    async fn fetch_series_list(&self) -> Result<Vec<String>, OriginError> {
        self.get_list(&["series"]).await
    }

    async fn fetch_types_list(&self, series: &str) -> Result<Vec<String>, OriginError> {
        self.get_list(&["types", series]).await
    }

    async fn fetch_file_list(&self, series: &str, ty: &str) -> Result<Vec<String>, OriginError> {
        self.get_list(&["list-files", series, ty]).await
    }
}

#[cfg(test)]
mod tests {
    use mediacdn_test::{self as test, OriginStub};

    use super::*;

    fn client(stub: &OriginStub) -> HttpOriginClient {
        HttpOriginClient::new(stub.url(), OriginTimeouts::default()).unwrap()
    }

    #[test]
    fn test_url_encoding() {
        let base = Url::parse("http://origin.internal/origin/").unwrap();
        let client = HttpOriginClient::new(base, OriginTimeouts::default()).unwrap();
        let key = ObjectKey::new("series A", "t#1", "50%?.pdf").unwrap();

        assert_eq!(
            client.url(&key.segments()).as_str(),
            "http://origin.internal/origin/series%20A/t%231/50%25%3F.pdf"
        );
    }

    #[test]
    fn test_rejects_opaque_base() {
        let base = Url::parse("mailto:origin@example.com").unwrap();
        assert!(HttpOriginClient::new(base, OriginTimeouts::default()).is_err());
    }

    #[tokio::test]
    async fn test_fetch_object() {
        test::setup();
        let stub = OriginStub::new();
        stub.insert("seriesA", "typeA", "doc.pdf", &b"%PDF-1.7\n\0"[..], Some("application/pdf"));

        let key = ObjectKey::new("seriesA", "typeA", "doc.pdf").unwrap();
        let object = client(&stub).fetch_object(&key).await.unwrap();

        assert_eq!(&object.bytes[..], b"%PDF-1.7\n\0");
        assert_eq!(object.content_type, "application/pdf");
        assert_eq!(stub.accesses(), 1);
    }

    #[tokio::test]
    async fn test_missing_content_type() {
        test::setup();
        let stub = OriginStub::new();
        stub.insert("s", "t", "blob", &b""[..], None);

        let key = ObjectKey::new("s", "t", "blob").unwrap();
        let object = client(&stub).fetch_object(&key).await.unwrap();

        assert!(object.bytes.is_empty());
        assert_eq!(object.content_type, OCTET_STREAM);
    }

    #[tokio::test]
    async fn test_not_found() {
        test::setup();
        let stub = OriginStub::new();

        let key = ObjectKey::new("seriesB", "typeB", "missing.mp4").unwrap();
        let err = client(&stub).fetch_object(&key).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(matches!(err, OriginError::Status { .. }));
    }

    #[tokio::test]
    async fn test_upstream_status_is_kept() {
        test::setup();
        let stub = OriginStub::new();
        stub.insert("s", "t", "f", &b"data"[..], None);
        stub.respond_with(Some(StatusCode::SERVICE_UNAVAILABLE));

        let key = ObjectKey::new("s", "t", "f").unwrap();
        let err = client(&stub).fetch_object(&key).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_timeout() {
        test::setup();
        let stub = OriginStub::new();
        stub.insert("s", "t", "slow", &b"data"[..], None);
        stub.delay(Some(Duration::from_secs(5)));

        let timeouts = OriginTimeouts {
            connect: Duration::from_secs(1),
            max_download: Duration::from_millis(100),
        };
        let client = HttpOriginClient::new(stub.url(), timeouts).unwrap();
        let key = ObjectKey::new("s", "t", "slow").unwrap();
        let err = client.fetch_object(&key).await.unwrap_err();

        assert!(matches!(err, OriginError::Timeout(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unreachable() {
        test::setup();
        // bind and immediately drop a listener to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("http://127.0.0.1:{port}/origin")).unwrap();

        let client = HttpOriginClient::new(url, OriginTimeouts::default()).unwrap();
        let err = client.fetch_series_list().await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_listings() {
        test::setup();
        let stub = OriginStub::new();
        stub.insert("seriesA", "typeA", "one.pdf", &b"1"[..], None);
        stub.insert("seriesA", "typeB", "two.mp4", &b"2"[..], None);
        stub.insert("seriesB", "typeA", "three.png", &b"3"[..], None);
        let client = client(&stub);

        assert_eq!(
            client.fetch_series_list().await.unwrap(),
            ["seriesA", "seriesB"]
        );
        assert_eq!(
            client.fetch_types_list("seriesA").await.unwrap(),
            ["typeA", "typeB"]
        );
        assert_eq!(
            client.fetch_file_list("seriesA", "typeB").await.unwrap(),
            ["two.mp4"]
        );

        let err = client.fetch_file_list("seriesC", "typeA").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
