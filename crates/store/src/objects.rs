//! The object-blob adapter: well-known key layouts over one blob bucket and
//! typed load/save helpers.
//!
//! Key namespaces, all relative to the bucket:
//!
//! | namespace | key template |
//! |---|---|
//! | received inbox payloads | `inbox/users/{u}/{base64url(SHA256(body))}.json` |
//! | staging outbox | `staging/users/{u}/{uniquePart}.json` |
//! | outbox (translated) | `outbox/users/{u}/{uniquePart}.json` |
//! | post objects | `objects/users/{u}/posts/{uniquePart}.json` |
//! | quarantine | `inbox/{base64url(SHA256(envelope))}.json` |

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use quill_common::{AppError, AppResult};
use quill_vocab::{Activity, ApObject, Note};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::blob::{body_checksum, BlobError, BlobStore};

/// Prefix of the `Digest` header value this server accepts.
pub const DIGEST_PREFIX: &str = "SHA-256=";

/// A blob address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub bucket: String,
    pub key: String,
}

/// Converts a standard base64 string into its URL-safe form.
///
/// `+` becomes `-`, `/` becomes `_`, trailing padding is dropped.
#[must_use]
pub fn to_urlsafe_base64(b64: &str) -> String {
    b64.trim_end_matches('=').replace('+', "-").replace('/', "_")
}

/// Key of a received inbox payload, addressed by its body digest.
#[must_use]
pub fn make_inbox_key(username: &str, digest_b64: &str) -> String {
    format!("inbox/users/{username}/{}.json", to_urlsafe_base64(digest_b64))
}

/// Key of a staged outbound object.
#[must_use]
pub fn make_staging_outbox_key(username: &str, unique_part: &str) -> String {
    format!("staging/users/{username}/{unique_part}.json")
}

/// Key of a translated outbox activity.
#[must_use]
pub fn make_outbox_key(username: &str, unique_part: &str) -> String {
    format!("outbox/users/{username}/{unique_part}.json")
}

/// Key of a post object.
#[must_use]
pub fn make_post_object_key(username: &str, unique_part: &str) -> String {
    format!("objects/users/{username}/posts/{unique_part}.json")
}

fn username_from_key(prefix: &str, key: &str) -> AppResult<String> {
    let rest = key
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix("/users/"))
        .ok_or_else(|| AppError::BadRequest(format!("no username in object key: {key}")))?;
    match rest.split_once('/') {
        Some((username, _)) if !username.is_empty() => Ok(username.to_string()),
        _ => Err(AppError::BadRequest(format!(
            "no username in object key: {key}"
        ))),
    }
}

/// Extracts the username from an inbox payload key.
pub fn username_from_inbox_key(key: &str) -> AppResult<String> {
    username_from_key("inbox", key)
}

/// Extracts the username from a staging outbox key.
pub fn username_from_staging_outbox_key(key: &str) -> AppResult<String> {
    username_from_key("staging", key)
}

/// Extracts the username from an outbox key.
pub fn username_from_outbox_key(key: &str) -> AppResult<String> {
    username_from_key("outbox", key)
}

/// Typed access to one blob bucket.
#[derive(Clone)]
pub struct ObjectStorage {
    blobs: Arc<dyn BlobStore>,
    bucket: String,
}

impl ObjectStorage {
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>, bucket: impl Into<String>) -> Self {
        Self {
            blobs,
            bucket: bucket.into(),
        }
    }

    /// The bucket this adapter addresses.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Addresses a key inside this bucket.
    #[must_use]
    pub fn object_key(&self, key: impl Into<String>) -> ObjectKey {
        ObjectKey {
            bucket: self.bucket.clone(),
            key: key.into(),
        }
    }

    /// Rejects keys addressed at a different bucket.
    pub fn check_bucket(&self, key: &ObjectKey) -> AppResult<()> {
        if key.bucket != self.bucket {
            return Err(AppError::BadConfiguration(format!(
                "objects bucket mismatch: {} vs {}",
                self.bucket, key.bucket
            )));
        }
        Ok(())
    }

    /// Loads a JSON document.
    pub async fn load_json(&self, key: &str) -> AppResult<Value> {
        let body = self
            .blobs
            .get_object(&self.bucket, key)
            .await
            .map_err(AppError::from)?;
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Corrupted(format!("invalid JSON at {key}: {e}")))
    }

    /// Loads a document as an Activity Streams object.
    pub async fn load_object(&self, key: &str) -> AppResult<ApObject> {
        let value = self.load_json(key).await?;
        ApObject::new(value).map_err(|e| AppError::Corrupted(format!("invalid object at {key}: {e}")))
    }

    /// Loads a document as an activity.
    pub async fn load_activity(&self, key: &str) -> AppResult<Activity> {
        let value = self.load_json(key).await?;
        Activity::parse(value)
            .map_err(|e| AppError::Corrupted(format!("invalid activity at {key}: {e}")))
    }

    /// Saves a JSON document.
    pub async fn save_json(&self, key: &str, value: &Value) -> AppResult<()> {
        let body = serde_json::to_vec(value)
            .map_err(|e| AppError::Internal(format!("serialization failed: {e}")))?;
        let checksum = body_checksum(&body);
        self.blobs
            .put_object(&self.bucket, key, Bytes::from(body), Some(&checksum))
            .await
            .map_err(AppError::from)
    }

    /// Saves a received inbox payload verbatim, addressed and checksummed by
    /// the digest the sender advertised.
    ///
    /// `digest` must be the `Digest` header value, `SHA-256=<base64>`.
    pub async fn save_inbox_payload(
        &self,
        username: &str,
        body: &str,
        digest: &str,
    ) -> AppResult<ObjectKey> {
        let digest_b64 = digest.strip_prefix(DIGEST_PREFIX).ok_or_else(|| {
            AppError::BadRequest(format!("digest must start with \"{DIGEST_PREFIX}\""))
        })?;
        let key = make_inbox_key(username, digest_b64);
        tracing::debug!(key = %key, "saving inbox payload");
        match self
            .blobs
            .put_object(
                &self.bucket,
                &key,
                Bytes::from(body.as_bytes().to_vec()),
                Some(digest_b64),
            )
            .await
        {
            Ok(()) => Ok(self.object_key(key)),
            Err(BlobError::ChecksumMismatch(_)) => Err(AppError::BadRequest(
                "body does not match digest".to_string(),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Saves a translated activity under its outbox key.
    pub async fn save_activity_in_outbox(&self, activity: &Activity) -> AppResult<ObjectKey> {
        let id = activity
            .id()
            .ok_or_else(|| AppError::BadRequest("activity has no id".to_string()))?;
        let (_, username, unique_part) = quill_common::ids::parse_activity_id(id)?;
        let key = make_outbox_key(&username, &unique_part);
        tracing::debug!(key = %key, "saving outbox activity");
        self.save_json(&key, &activity.to_value(true)).await?;
        Ok(self.object_key(key))
    }

    /// Saves a completed post object under its post key.
    pub async fn save_post(&self, note: &Note) -> AppResult<ObjectKey> {
        let id = note
            .id()
            .ok_or_else(|| AppError::BadRequest("note has no id".to_string()))?;
        let (_, username, unique_part) = quill_common::ids::parse_post_id(id)?;
        let key = make_post_object_key(&username, &unique_part);
        tracing::debug!(key = %key, "saving post object");
        self.save_json(&key, &note.to_value(true)).await?;
        Ok(self.object_key(key))
    }

    /// Saves a forensic envelope, addressed by its own digest.
    pub async fn save_quarantined(&self, envelope: &Value) -> AppResult<ObjectKey> {
        let body = serde_json::to_vec(envelope)
            .map_err(|e| AppError::Internal(format!("serialization failed: {e}")))?;
        let digest = Sha256::digest(&body);
        let key = format!("inbox/{}.json", URL_SAFE_NO_PAD.encode(digest));
        tracing::debug!(key = %key, "saving quarantined payload");
        self.blobs
            .put_object(
                &self.bucket,
                &key,
                Bytes::from(body.clone()),
                Some(&body_checksum(&body)),
            )
            .await
            .map_err(AppError::from)?;
        Ok(self.object_key(key))
    }
}
