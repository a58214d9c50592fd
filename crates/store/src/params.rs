//! The parameter store contract, holding private key material by reference.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use quill_common::AppError;
use thiserror::Error;

/// Failure kinds surfaced by a parameter store.
#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("parameter not found: {0}")]
    NotFound(String),
}

impl From<ParameterError> for AppError {
    fn from(err: ParameterError) -> Self {
        // A user record pointing at a missing or undecryptable parameter is
        // a deployment problem, not a caller problem.
        Self::BadConfiguration(err.to_string())
    }
}

/// The parameter store contract.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get_parameter(
        &self,
        path: &str,
        with_decryption: bool,
    ) -> Result<String, ParameterError>;
}

/// In-memory parameter store backing tests and the single-node server.
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryParameterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a parameter value.
    pub fn put_parameter(&self, path: &str, value: &str) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(path.to_string(), value.to_string());
    }
}

#[async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn get_parameter(
        &self,
        path: &str,
        _with_decryption: bool,
    ) -> Result<String, ParameterError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .get(path)
            .cloned()
            .ok_or_else(|| ParameterError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let store = MemoryParameterStore::new();
        store.put_parameter("/quill/users/alice/private-key", "PEM");
        let value = store
            .get_parameter("/quill/users/alice/private-key", true)
            .await
            .unwrap();
        assert_eq!(value, "PEM");
    }

    #[tokio::test]
    async fn test_missing_parameter() {
        let store = MemoryParameterStore::new();
        let err = store.get_parameter("/nope", true).await.unwrap_err();
        assert!(matches!(err, ParameterError::NotFound(_)));
    }
}
