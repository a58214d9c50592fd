//! Core object views: validated wrappers over raw JSON documents.

use std::collections::HashMap;

use quill_common::{AppError, AppResult};
use serde_json::Value;

use crate::fetch::{Fetch, FetchError};

/// JSON-LD context for Activity Streams documents.
pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Reserved address meaning "anyone".
pub const PUBLIC_ADDRESS: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Types representing a collection.
pub const COLLECTION_TYPES: [&str; 2] = ["Collection", "OrderedCollection"];

/// An Activity Streams object wrapping a JSON document.
///
/// Construction validates the parts every object must get right (`type`
/// present and textual, `id` textual when present); refinements layer their
/// own checks on top.
#[derive(Debug, Clone, PartialEq)]
pub struct ApObject {
    value: Value,
}

impl ApObject {
    /// Wraps a JSON document.
    pub fn new(value: Value) -> AppResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| AppError::BadRequest("object must be a JSON object".to_string()))?;
        match map.get("type") {
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(AppError::BadRequest(format!(
                    "type must be a string but was {other}"
                )))
            }
            None => return Err(AppError::BadRequest("invalid object: missing type".to_string())),
        }
        if let Some(id) = map.get("id") {
            if !id.is_string() {
                return Err(AppError::BadRequest(format!(
                    "id must be a string but was {id}"
                )));
            }
        }
        Ok(Self { value })
    }

    /// ID of this object, when assigned.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.value.get("id").and_then(Value::as_str)
    }

    /// ID of this object; fails when unassigned.
    pub fn require_id(&self) -> AppResult<&str> {
        self.id()
            .ok_or_else(|| AppError::BadRequest("object has no id".to_string()))
    }

    /// Type of this object.
    #[must_use]
    pub fn object_type(&self) -> &str {
        self.value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Raw property access.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    /// Assigns a property, replacing any existing value.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Some(map) = self.value.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    /// Assigns the Activity Streams JSON-LD context.
    pub fn set_context(&mut self) {
        self.set("@context", Value::String(ACTIVITY_STREAMS_CONTEXT.to_string()));
    }

    /// Addresses named by an addressing property (`to`, `cc`, `bcc`).
    ///
    /// A single string and an array of strings are both accepted; non-string
    /// entries are skipped.
    #[must_use]
    pub fn addresses(&self, field: &str) -> Vec<String> {
        match self.value.get(field) {
            Some(Value::String(single)) => vec![single.clone()],
            Some(Value::Array(many)) => many
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the public address appears in `to` or `cc`.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.addresses("to")
            .iter()
            .chain(self.addresses("cc").iter())
            .any(|address| address == PUBLIC_ADDRESS)
    }

    /// The `published` timestamp, when present.
    #[must_use]
    pub fn published(&self) -> Option<&str> {
        self.value.get("published").and_then(Value::as_str)
    }

    /// The `inReplyTo` reference, when present.
    pub fn in_reply_to(&self) -> AppResult<Option<Reference>> {
        match self.value.get("inReplyTo") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(Reference::parse(value)?)),
        }
    }

    /// Whether this document is complete enough to put on the wire.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        self.value.get("@context").is_some() && self.id().is_some()
    }

    /// Returns the document, optionally with the JSON-LD context stripped.
    #[must_use]
    pub fn to_value(&self, with_context: bool) -> Value {
        if with_context {
            return self.value.clone();
        }
        let mut value = self.value.clone();
        if let Some(map) = value.as_object_mut() {
            map.remove("@context");
        }
        value
    }

    /// Borrows the underlying document.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.value
    }
}

/// A `Link` object.
#[derive(Debug, Clone)]
pub struct Link {
    href: String,
}

impl Link {
    /// Wraps a JSON document whose type must be `Link` with a textual `href`.
    pub fn new(value: &Value) -> AppResult<Self> {
        if value.get("type").and_then(Value::as_str) != Some("Link") {
            return Err(AppError::BadRequest("type must be Link".to_string()));
        }
        let href = value
            .get("href")
            .ok_or_else(|| AppError::BadRequest("invalid link object: missing href".to_string()))?
            .as_str()
            .ok_or_else(|| AppError::BadRequest("href must be a string".to_string()))?;
        Ok(Self {
            href: href.to_string(),
        })
    }

    /// The link target.
    #[must_use]
    pub fn href(&self) -> &str {
        &self.href
    }
}

/// A reference to an object: a URI, a `Link`, or the object inline.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    /// A bare URI or the target of a `Link`.
    Uri(String),
    /// An inline object carrying its own `id`.
    Inline(Value),
}

impl Reference {
    /// Parses a reference value.
    pub fn parse(value: &Value) -> AppResult<Self> {
        match value {
            Value::String(uri) => Ok(Self::Uri(uri.clone())),
            Value::Object(map) => {
                match map.get("type").and_then(Value::as_str) {
                    None => Err(AppError::BadRequest(
                        "object reference must have type".to_string(),
                    )),
                    Some("Link") => Ok(Self::Uri(Link::new(value)?.href().to_string())),
                    Some(_) => match map.get("id") {
                        Some(Value::String(_)) => Ok(Self::Inline(value.clone())),
                        Some(other) => Err(AppError::BadRequest(format!(
                            "id must be a string but was {other}"
                        ))),
                        None => Err(AppError::BadRequest(
                            "inline object reference must have id".to_string(),
                        )),
                    },
                }
            }
            other => Err(AppError::BadRequest(format!("invalid reference: {other}"))),
        }
    }

    /// The referenced object's ID, uniformly across the three forms.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Uri(uri) => uri,
            Self::Inline(value) => value.get("id").and_then(Value::as_str).unwrap_or_default(),
        }
    }

    /// Resolves the referenced object, fetching when it is not inline.
    pub async fn resolve(&self, fetch: &dyn Fetch) -> Result<ApObject, ResolveError> {
        match self {
            Self::Uri(uri) => {
                tracing::debug!(uri = %uri, "resolving reference");
                let value = fetch.fetch_json(uri).await?;
                ApObject::new(value).map_err(ResolveError::Invalid)
            }
            Self::Inline(value) => ApObject::new(value.clone()).map_err(ResolveError::Invalid),
        }
    }
}

/// Failure resolving a [`Reference`].
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Invalid(AppError),
}

impl ResolveError {
    /// HTTP status of the failure, when there is one.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Fetch(err) => err.status(),
            Self::Invalid(_) => None,
        }
    }
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Fetch(fetch) => fetch.into(),
            ResolveError::Invalid(app) => app,
        }
    }
}

/// An id-keyed map of already-resolved objects.
///
/// Recipient expansion and activity walks use it to avoid fetching the same
/// document twice.
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: HashMap<String, ApObject>,
}

impl ObjectCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached object with a given ID, if any.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ApObject> {
        self.objects.get(id)
    }

    /// Caches an object under its ID. Objects without an ID are not cached.
    pub fn add(&mut self, object: ApObject) {
        if let Some(id) = object.id() {
            self.objects.insert(id.to_string(), object);
        }
    }

    /// Resolves through the cache.
    pub async fn resolve(
        &mut self,
        reference: &Reference,
        fetch: &dyn Fetch,
    ) -> Result<ApObject, ResolveError> {
        if let Some(cached) = self.get(reference.id()) {
            return Ok(cached.clone());
        }
        let object = reference.resolve(fetch).await?;
        self.add(object.clone());
        Ok(object)
    }
}
