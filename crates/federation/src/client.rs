//! HTTP client for the federation wire: fetching Activity Streams documents
//! and delivering signed activities to remote inboxes.

use std::time::Duration;

use async_trait::async_trait;
use quill_vocab::{Fetch, FetchError};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::signature::{sign_post_request, SignatureError};

/// `Accept` value advertised on Activity Streams GETs.
pub const ACTIVITY_STREAMS_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Default timeout of outbound requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure delivering an activity.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Retryable: 429 or a network timeout.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The recipient is permanently gone (410).
    #[error("recipient is gone: {0}")]
    Gone(String),
    /// Any other non-2xx response.
    #[error("delivery failed with {status}: {body}")]
    Failed { status: u16, body: String },
    #[error(transparent)]
    Signing(#[from] SignatureError),
    #[error("invalid inbox URL: {0}")]
    InvalidUrl(String),
}

/// Delivers one signed activity to one inbox.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        inbox_url: &str,
        body: &[u8],
        key_id: &str,
        private_key_pem: &str,
    ) -> Result<(), DeliveryError>;
}

/// The reqwest-backed federation client.
#[derive(Clone)]
pub struct ApClient {
    client: reqwest::Client,
    user_agent: String,
}

impl ApClient {
    /// Creates a client identifying this instance in its user agent.
    pub fn new(domain: &str) -> Result<Self, quill_common::AppError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                quill_common::AppError::Internal(format!("failed to create HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            user_agent: format!("quill/0.1.0 (+https://{domain})"),
        })
    }
}

#[async_trait]
impl Fetch for ApClient {
    async fn fetch_json(&self, uri: &str) -> Result<Value, FetchError> {
        debug!(uri = %uri, "fetching document");
        let response = self
            .client
            .get(uri)
            .header("User-Agent", &self.user_agent)
            .header("Accept", ACTIVITY_STREAMS_ACCEPT)
            .send()
            .await
            .map_err(|e| classify_request_error(uri, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| FetchError::Request(format!("invalid response from {uri}: {e}")))
    }
}

fn classify_request_error(uri: &str, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            uri: uri.to_string(),
        }
    } else {
        FetchError::Request(err.to_string())
    }
}

#[async_trait]
impl Deliver for ApClient {
    async fn deliver(
        &self,
        inbox_url: &str,
        body: &[u8],
        key_id: &str,
        private_key_pem: &str,
    ) -> Result<(), DeliveryError> {
        let url =
            Url::parse(inbox_url).map_err(|e| DeliveryError::InvalidUrl(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| DeliveryError::InvalidUrl(format!("no host: {inbox_url}")))?;
        let query = url.query().map_or(String::new(), |q| format!("?{q}"));
        let path = format!("{}{query}", url.path());

        let headers = sign_post_request(key_id, private_key_pem, host, &path, body)?;

        debug!(inbox = %inbox_url, "delivering activity");
        let mut request = self
            .client
            .post(inbox_url)
            .header("User-Agent", &self.user_agent)
            .header("Accept", ACTIVITY_STREAMS_ACCEPT);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.body(body.to_vec()).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Transient(format!("request timed out: {inbox_url}"))
            } else {
                DeliveryError::Failed {
                    status: 0,
                    body: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        match status.as_u16() {
            code if status.is_success() => {
                info!(inbox = %inbox_url, status = code, "activity delivered");
                Ok(())
            }
            429 => Err(DeliveryError::Transient(format!(
                "too many requests: {inbox_url}"
            ))),
            410 => {
                warn!(inbox = %inbox_url, "recipient is gone");
                Err(DeliveryError::Gone(inbox_url.to_string()))
            }
            code => {
                let body = response.text().await.unwrap_or_default();
                Err(DeliveryError::Failed { status: code, body })
            }
        }
    }
}
