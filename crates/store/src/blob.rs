//! The blob store contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use quill_common::AppError;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Failure kinds surfaced by a blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("no such key: {0}")]
    NoSuchKey(String),
    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),
    #[error("blob store error: {0}")]
    Other(String),
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NoSuchKey(key) => Self::NotFound(format!("no such object: {key}")),
            BlobError::ChecksumMismatch(key) => {
                Self::BadRequest(format!("checksum mismatch: {key}"))
            }
            BlobError::Other(message) => Self::Internal(message),
        }
    }
}

/// The blob store contract.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Reads one object.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError>;

    /// Writes one object. When a checksum is supplied (standard base64 of
    /// the body's SHA-256), the store verifies it before committing.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        checksum_sha256: Option<&str>,
    ) -> Result<(), BlobError>;
}

/// Standard-base64 SHA-256 of a body, as blob checksums are expressed.
#[must_use]
pub fn body_checksum(body: &[u8]) -> String {
    BASE64.encode(Sha256::digest(body))
}

/// In-memory blob store backing tests and the single-node server.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    buckets: Mutex<HashMap<String, HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently present under a prefix; test helper.
    pub fn list_keys(&self, bucket: &str, prefix: &str) -> Vec<String> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .keys()
                    .filter(|key| key.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| BlobError::NoSuchKey(format!("{bucket}/{key}")))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        checksum_sha256: Option<&str>,
    ) -> Result<(), BlobError> {
        if let Some(expected) = checksum_sha256 {
            if body_checksum(&body) != expected {
                return Err(BlobError::ChecksumMismatch(format!("{bucket}/{key}")));
            }
        }
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let store = MemoryBlobStore::new();
        store
            .put_object("objects", "a/b.json", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        let body = store.get_object("objects", "a/b.json").await.unwrap();
        assert_eq!(&body[..], b"{}");
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = MemoryBlobStore::new();
        let err = store.get_object("objects", "nope").await.unwrap_err();
        assert!(matches!(err, BlobError::NoSuchKey(_)));
        let app: AppError = err.into();
        assert!(matches!(app, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_checksum_verification() {
        let store = MemoryBlobStore::new();
        let body = Bytes::from_static(b"payload");
        let checksum = body_checksum(&body);
        store
            .put_object("objects", "ok.json", body.clone(), Some(&checksum))
            .await
            .unwrap();

        let err = store
            .put_object("objects", "bad.json", Bytes::from_static(b"other"), Some(&checksum))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::ChecksumMismatch(_)));
        // The mismatched body was never committed.
        assert!(store.get_object("objects", "bad.json").await.is_err());
    }

    #[tokio::test]
    async fn test_list_keys() {
        let store = MemoryBlobStore::new();
        for key in ["inbox/users/alice/a.json", "inbox/users/alice/b.json", "outbox/x.json"] {
            store
                .put_object("objects", key, Bytes::from_static(b"{}"), None)
                .await
                .unwrap();
        }
        assert_eq!(store.list_keys("objects", "inbox/users/alice/").len(), 2);
    }
}
