//! Actor documents.

use quill_common::{AppError, AppResult};
use serde_json::Value;

use crate::fetch::{Fetch, FetchError};
use crate::object::ApObject;

/// Possible types for an actor.
pub const ACTOR_TYPES: [&str; 5] = ["Application", "Group", "Organization", "Person", "Service"];

/// An actor's public key as carried in its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

/// An actor on the federation network.
#[derive(Debug, Clone)]
pub struct Actor {
    doc: ApObject,
}

impl Actor {
    /// Wraps an actor document, checking its type.
    pub fn new(value: Value) -> AppResult<Self> {
        let doc = ApObject::new(value)?;
        if !ACTOR_TYPES.contains(&doc.object_type()) {
            return Err(AppError::BadRequest(format!(
                "not an actor type: {}",
                doc.object_type()
            )));
        }
        Ok(Self { doc })
    }

    /// Fetches and wraps the actor at a URI.
    pub async fn resolve(uri: &str, fetch: &dyn Fetch) -> Result<Self, ActorResolveError> {
        tracing::debug!(uri = %uri, "resolving actor");
        let value = fetch.fetch_json(uri).await?;
        Self::new(value).map_err(ActorResolveError::Invalid)
    }

    /// ID of the actor.
    pub fn id(&self) -> AppResult<&str> {
        self.doc.require_id()
    }

    /// The actor's inbox URI.
    pub fn inbox(&self) -> AppResult<String> {
        self.doc
            .get("inbox")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest("actor provides no inbox".to_string()))
    }

    /// The instance-wide shared inbox, when the actor advertises one.
    #[must_use]
    pub fn shared_inbox(&self) -> Option<String> {
        self.doc
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .or_else(|| self.doc.get("sharedInbox"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// The inbox deliveries should prefer: shared when present, own
    /// otherwise.
    pub fn preferred_inbox(&self) -> AppResult<String> {
        match self.shared_inbox() {
            Some(shared) => Ok(shared),
            None => self.inbox(),
        }
    }

    /// The actor's public key.
    pub fn public_key(&self) -> AppResult<PublicKey> {
        let key = self
            .doc
            .get("publicKey")
            .ok_or_else(|| AppError::BadRequest("actor provides no public key".to_string()))?;
        let field = |name: &str| -> AppResult<String> {
            key.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::BadRequest(format!("public key {name} must be a string"))
                })
        };
        Ok(PublicKey {
            id: field("id")?,
            owner: field("owner")?,
            public_key_pem: field("publicKeyPem")?,
        })
    }

    /// Borrows the underlying document view.
    #[must_use]
    pub const fn doc(&self) -> &ApObject {
        &self.doc
    }
}

/// Failure resolving an actor.
#[derive(Debug, thiserror::Error)]
pub enum ActorResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Invalid(AppError),
}

impl From<ActorResolveError> for AppError {
    fn from(err: ActorResolveError) -> Self {
        match err {
            ActorResolveError::Fetch(fetch) => fetch.into(),
            ActorResolveError::Invalid(app) => app,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> Value {
        json!({
            "id": "https://r.example/users/bob",
            "type": "Person",
            "inbox": "https://r.example/users/bob/inbox",
            "publicKey": {
                "id": "https://r.example/users/bob#main-key",
                "owner": "https://r.example/users/bob",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\n...",
            },
        })
    }

    #[test]
    fn test_actor_accessors() {
        let actor = Actor::new(person()).unwrap();
        assert_eq!(actor.id().unwrap(), "https://r.example/users/bob");
        assert_eq!(actor.inbox().unwrap(), "https://r.example/users/bob/inbox");
        assert_eq!(actor.shared_inbox(), None);
        assert_eq!(
            actor.preferred_inbox().unwrap(),
            "https://r.example/users/bob/inbox"
        );

        let key = actor.public_key().unwrap();
        assert_eq!(key.id, "https://r.example/users/bob#main-key");
        assert_eq!(key.owner, "https://r.example/users/bob");
    }

    #[test]
    fn test_actor_rejects_non_actor_types() {
        assert!(Actor::new(json!({"type": "Note", "content": "hi"})).is_err());
    }

    #[test]
    fn test_shared_inbox_endpoints_form() {
        let mut value = person();
        value["endpoints"] = json!({"sharedInbox": "https://r.example/inbox"});
        let actor = Actor::new(value).unwrap();
        assert_eq!(actor.shared_inbox().as_deref(), Some("https://r.example/inbox"));
        assert_eq!(actor.preferred_inbox().unwrap(), "https://r.example/inbox");
    }

    #[test]
    fn test_public_key_must_be_complete() {
        let mut value = person();
        value["publicKey"] = json!({"id": "https://r.example/users/bob#main-key"});
        let actor = Actor::new(value).unwrap();
        assert!(actor.public_key().is_err());
    }

    #[tokio::test]
    async fn test_resolve() {
        let fetcher =
            crate::fetch::StaticFetcher::new().with("https://r.example/users/bob", person());
        let actor = Actor::resolve("https://r.example/users/bob", &fetcher)
            .await
            .unwrap();
        assert_eq!(actor.id().unwrap(), "https://r.example/users/bob");
    }
}
