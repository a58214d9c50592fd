//! Note documents.

use quill_common::{AppError, AppResult};
use serde_json::Value;

use crate::activity::Activity;
use crate::object::{ApObject, Reference};

/// A `Note` object.
#[derive(Debug, Clone)]
pub struct Note {
    doc: ApObject,
}

impl Note {
    /// Wraps a `Note` document.
    pub fn new(value: Value) -> AppResult<Self> {
        Self::from_object(ApObject::new(value)?)
    }

    /// Wraps an already-validated object as a `Note`.
    pub fn from_object(doc: ApObject) -> AppResult<Self> {
        if doc.object_type() != "Note" {
            return Err(AppError::BadRequest(format!(
                "type must be Note but was {}",
                doc.object_type()
            )));
        }
        match doc.get("content") {
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(AppError::BadRequest(format!(
                    "content must be a string but was {other}"
                )))
            }
            None => return Err(AppError::BadRequest("invalid note: missing content".to_string())),
        }
        if let Some(attributed_to) = doc.get("attributedTo") {
            if !attributed_to.is_string() {
                return Err(AppError::BadRequest(
                    "attributedTo must be a string".to_string(),
                ));
            }
        }
        if let Some(replies) = doc.get("replies") {
            Reference::parse(replies)?;
        }
        Ok(Self { doc })
    }

    /// ID of the note, when assigned.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.doc.id()
    }

    /// The note's text content.
    #[must_use]
    pub fn content(&self) -> &str {
        self.doc
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The authoring actor, when assigned.
    #[must_use]
    pub fn attributed_to(&self) -> Option<&str> {
        self.doc.get("attributedTo").and_then(Value::as_str)
    }

    /// The `published` timestamp, when present.
    #[must_use]
    pub fn published(&self) -> Option<&str> {
        self.doc.published()
    }

    /// Whether the public address appears in `to` or `cc`.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.doc.is_public()
    }

    /// Assigns the Activity Streams JSON-LD context.
    pub fn set_context(&mut self) {
        self.doc.set_context();
    }

    /// Assigns the note's ID.
    pub fn assign_id(&mut self, id: &str) {
        self.doc.set("id", Value::String(id.to_string()));
    }

    /// Assigns the authoring actor.
    pub fn set_attributed_to(&mut self, actor_id: &str) {
        self.doc.set("attributedTo", Value::String(actor_id.to_string()));
    }

    /// Assigns the publication timestamp.
    pub fn set_published(&mut self, published: &str) {
        self.doc.set("published", Value::String(published.to_string()));
    }

    /// Points the `replies` property at a collection URI.
    pub fn set_replies(&mut self, replies_uri: &str) {
        self.doc.set("replies", Value::String(replies_uri.to_string()));
    }

    /// Wraps this note in a `Create` activity.
    ///
    /// The activity copies the note's addressing and `published` time; the
    /// embedded copy keeps no context of its own.
    pub fn wrap_in_create(&self, activity_id: &str) -> AppResult<Activity> {
        let actor = self.attributed_to().ok_or_else(|| {
            AppError::BadRequest("note must be attributed before wrapping".to_string())
        })?;
        let mut value = serde_json::json!({
            "@context": crate::object::ACTIVITY_STREAMS_CONTEXT,
            "id": activity_id,
            "type": "Create",
            "actor": actor,
            "object": self.doc.to_value(false),
        });
        for field in ["to", "cc", "bcc", "published"] {
            if let Some(copied) = self.doc.get(field) {
                value[field] = copied.clone();
            }
        }
        Activity::parse(value)
    }

    /// Returns the document, optionally without the JSON-LD context.
    #[must_use]
    pub fn to_value(&self, with_context: bool) -> Value {
        self.doc.to_value(with_context)
    }

    /// Borrows the underlying document view.
    #[must_use]
    pub const fn doc(&self) -> &ApObject {
        &self.doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::PUBLIC_ADDRESS;
    use serde_json::json;

    #[test]
    fn test_note_requires_content() {
        assert!(Note::new(json!({"type": "Note"})).is_err());
        assert!(Note::new(json!({"type": "Note", "content": 42})).is_err());
        assert!(Note::new(json!({"type": "Article", "content": "hi"})).is_err());
    }

    #[test]
    fn test_note_rejects_bad_attribution() {
        assert!(Note::new(json!({
            "type": "Note",
            "content": "hi",
            "attributedTo": ["https://x.example/users/a"],
        }))
        .is_err());
    }

    #[test]
    fn test_wrap_in_create_copies_addressing() {
        let mut note = Note::new(json!({
            "type": "Note",
            "content": "hello fediverse",
            "to": [PUBLIC_ADDRESS],
            "cc": ["https://example.social/users/alice/followers"],
        }))
        .unwrap();
        note.set_context();
        note.assign_id("https://example.social/users/alice/posts/p1");
        note.set_attributed_to("https://example.social/users/alice");
        note.set_published("2023-04-07T01:02:03Z");

        let create = note
            .wrap_in_create("https://example.social/users/alice/activities/a1")
            .unwrap();
        assert_eq!(create.type_name(), "Create");
        assert_eq!(create.actor_id(), "https://example.social/users/alice");
        assert!(create.is_public());
        assert_eq!(create.published(), Some("2023-04-07T01:02:03Z"));
        assert!(create.is_deliverable());

        // The embedded note keeps its id but not its own context.
        let object = create.doc().get("object").unwrap();
        assert_eq!(object["id"], "https://example.social/users/alice/posts/p1");
        assert!(object.get("@context").is_none());
    }

    #[test]
    fn test_wrap_requires_attribution() {
        let note = Note::new(json!({"type": "Note", "content": "hi"})).unwrap();
        assert!(note.wrap_in_create("https://x.example/activities/1").is_err());
    }
}
