//! Client for the external object-storage service the relay delegates to.
//!
//! The relay never persists bytes itself: every upload is forwarded to a
//! managed blob store reachable over HTTP, and the store answers with the
//! public URL under which the object can be fetched. This crate wraps that
//! collaborator in a small typed API — a [`BlobStore`] trait so the daemon
//! can swap the transport out in tests, and [`HttpBlobStore`] as the real
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Connect timeout for the underlying HTTP client. The overall deadline for
/// a put is enforced by the caller racing the future against a timer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("blob-store/", env!("CARGO_PKG_VERSION"));

const HEADER_ACCESS: &str = "x-blob-access";
const HEADER_ADD_RANDOM_SUFFIX: &str = "x-add-random-suffix";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object pathname '{0}'")]
    InvalidPathname(String),
    #[error("blob store endpoint cannot carry object paths")]
    InvalidEndpoint,
    #[error("failed to reach blob store: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("blob store rejected upload with status {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("blob store returned an unreadable response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Visibility of the stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Private,
}

impl Access {
    fn as_str(self) -> &'static str {
        match self {
            Access::Public => "public",
            Access::Private => "private",
        }
    }
}

/// Per-upload options forwarded to the storage service.
///
/// `add_random_suffix` asks the service to append a uniqueness token to the
/// stored name so repeated uploads of the same filename neither collide nor
/// get served stale from a CDN cache.
#[derive(Debug, Clone)]
pub struct PutOptions {
    pub access: Access,
    pub content_type: Option<String>,
    pub add_random_suffix: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            access: Access::Private,
            content_type: None,
            add_random_suffix: false,
        }
    }
}

/// Successful upload response. The service may return more metadata than
/// this; only the URL is contractual.
#[derive(Debug, Clone, Deserialize)]
pub struct PutResult {
    pub url: String,
    #[serde(default)]
    pub pathname: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Seam between the daemon and the storage transport. The credential is an
/// explicit argument so no implementation can fall back to ambient
/// environment state.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(
        &self,
        pathname: &str,
        bytes: Vec<u8>,
        options: &PutOptions,
        token: &str,
    ) -> Result<PutResult, StoreError>;
}

/// HTTP implementation talking to the managed store.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    endpoint: Url,
    client: Client,
}

impl HttpBlobStore {
    pub fn new(endpoint: Url) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { endpoint, client })
    }

    fn object_url(&self, pathname: &str) -> Result<Url, StoreError> {
        let trimmed = pathname.trim_matches('/');
        if trimmed.is_empty()
            || trimmed
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(StoreError::InvalidPathname(pathname.to_string()));
        }

        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidEndpoint)?
            .extend(trimmed.split('/'));
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(
        &self,
        pathname: &str,
        bytes: Vec<u8>,
        options: &PutOptions,
        token: &str,
    ) -> Result<PutResult, StoreError> {
        let url = self.object_url(pathname)?;
        debug!(pathname, size = bytes.len(), "uploading object to blob store");

        let mut request = self
            .client
            .put(url)
            .bearer_auth(token)
            .header(HEADER_ACCESS, options.access.as_str())
            .body(bytes);

        if let Some(content_type) = options.content_type.as_deref() {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        if options.add_random_suffix {
            request = request.header(HEADER_ADD_RANDOM_SUFFIX, "1");
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<PutResult>().await.map_err(StoreError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: &str) -> HttpBlobStore {
        HttpBlobStore::new(endpoint.parse().expect("endpoint")).expect("client")
    }

    #[test]
    fn object_url_joins_endpoint_and_pathname() {
        let store = store("https://blobs.example/v1");
        let url = store.object_url("reports/result.csv").expect("url");
        assert_eq!(url.as_str(), "https://blobs.example/v1/reports/result.csv");
    }

    #[test]
    fn object_url_strips_surrounding_slashes() {
        let store = store("https://blobs.example");
        let url = store.object_url("/a.png/").expect("url");
        assert_eq!(url.as_str(), "https://blobs.example/a.png");
    }

    #[test]
    fn object_url_rejects_empty_and_traversal_segments() {
        let store = store("https://blobs.example");
        for pathname in ["", "/", "..", "a/../b", "a//b", "./a"] {
            assert!(
                matches!(
                    store.object_url(pathname),
                    Err(StoreError::InvalidPathname(_))
                ),
                "pathname {pathname:?} should be rejected"
            );
        }
    }

    #[test]
    fn put_options_default_is_private_without_suffix() {
        let options = PutOptions::default();
        assert_eq!(options.access, Access::Private);
        assert!(options.content_type.is_none());
        assert!(!options.add_random_suffix);
    }

    #[test]
    fn put_result_tolerates_extra_fields() {
        let result: PutResult = serde_json::from_value(serde_json::json!({
            "url": "https://store.example/a-xyz.png",
            "pathname": "a-xyz.png",
            "downloadUrl": "https://store.example/a-xyz.png?download=1"
        }))
        .expect("deserialize");
        assert_eq!(result.url, "https://store.example/a-xyz.png");
        assert_eq!(result.pathname.as_deref(), Some("a-xyz.png"));
        assert!(result.content_type.is_none());
    }

    #[test]
    fn upstream_error_carries_status_and_body() {
        let err = StoreError::Upstream {
            status: 403,
            message: "token expired".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "blob store rejected upload with status 403: token expired"
        );
    }

    #[tokio::test]
    async fn put_validates_pathname_before_any_io() {
        let store = store("https://blob.invalid");
        let result = store
            .put("../escape", b"data".to_vec(), &PutOptions::default(), "token")
            .await;
        assert!(matches!(result, Err(StoreError::InvalidPathname(_))));
    }
}
