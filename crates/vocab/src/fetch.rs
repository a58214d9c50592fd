//! Fetching remote Activity Streams documents.
//!
//! The trait keeps reference resolution and recipient expansion independent
//! of the concrete HTTP client, so tests can serve documents from a map.

use std::collections::HashMap;

use async_trait::async_trait;
use quill_common::AppError;
use serde_json::Value;
use thiserror::Error;

/// Failure fetching a remote document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {uri}")]
    Status { uri: String, status: u16 },
    #[error("request timed out: {uri}")]
    Timeout { uri: String },
    #[error("request failed: {0}")]
    Request(String),
}

impl FetchError {
    /// HTTP status of the failure, when there is one.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the remote reported the resource permanently gone.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.status() == Some(410)
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { .. } => Self::Transient(err.to_string()),
            FetchError::Status { status: 429, .. } => Self::Transient(err.to_string()),
            _ => Self::Communication(err.to_string()),
        }
    }
}

/// GET a JSON document advertising the Activity Streams media types.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch_json(&self, uri: &str) -> Result<Value, FetchError>;
}

/// Fetcher serving documents from a fixed map. Unknown URIs yield 404.
///
/// Used by tests in place of the HTTP client.
#[derive(Debug, Default, Clone)]
pub struct StaticFetcher {
    documents: HashMap<String, Value>,
    gone: Vec<String>,
}

impl StaticFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a document under its URI.
    #[must_use]
    pub fn with(mut self, uri: impl Into<String>, document: Value) -> Self {
        self.documents.insert(uri.into(), document);
        self
    }

    /// Marks a URI as permanently gone (410).
    #[must_use]
    pub fn with_gone(mut self, uri: impl Into<String>) -> Self {
        self.gone.push(uri.into());
        self
    }
}

#[async_trait]
impl Fetch for StaticFetcher {
    async fn fetch_json(&self, uri: &str) -> Result<Value, FetchError> {
        // Like any HTTP client, the fragment never reaches the server.
        let uri = uri.split('#').next().unwrap_or(uri);
        if self.gone.iter().any(|g| g == uri) {
            return Err(FetchError::Status {
                uri: uri.to_string(),
                status: 410,
            });
        }
        self.documents
            .get(uri)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                uri: uri.to_string(),
                status: 404,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticFetcher::new()
            .with("https://r.example/users/bob", json!({"type": "Person"}))
            .with_gone("https://r.example/users/eve");

        let doc = fetcher.fetch_json("https://r.example/users/bob").await.unwrap();
        assert_eq!(doc["type"], "Person");

        let gone = fetcher
            .fetch_json("https://r.example/users/eve")
            .await
            .unwrap_err();
        assert!(gone.is_gone());

        let missing = fetcher.fetch_json("https://r.example/nope").await.unwrap_err();
        assert_eq!(missing.status(), Some(404));
    }

    #[test]
    fn test_fetch_error_mapping() {
        let err: AppError = FetchError::Status {
            uri: "https://r.example".into(),
            status: 429,
        }
        .into();
        assert!(err.is_transient());

        let err: AppError = FetchError::Timeout {
            uri: "https://r.example".into(),
        }
        .into();
        assert!(err.is_transient());

        let err: AppError = FetchError::Status {
            uri: "https://r.example".into(),
            status: 500,
        }
        .into();
        assert!(!err.is_transient());
    }
}
