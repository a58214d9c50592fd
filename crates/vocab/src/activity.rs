//! Activities as a tagged sum over validated documents.
//!
//! Dispatchers match on [`ActivityKind`]; unrecognized types parse but carry
//! no kind, so callers can log and ignore them.

use quill_common::{AppError, AppResult};
use serde_json::Value;

use crate::fetch::Fetch;
use crate::object::{ApObject, Reference, ResolveError};

/// The activity types this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Accept,
    Announce,
    Create,
    Delete,
    Follow,
    Like,
    Reject,
    Undo,
}

impl ActivityKind {
    /// Maps a `type` value onto a kind.
    #[must_use]
    pub fn from_type(object_type: &str) -> Option<Self> {
        match object_type {
            "Accept" => Some(Self::Accept),
            "Announce" => Some(Self::Announce),
            "Create" => Some(Self::Create),
            "Delete" => Some(Self::Delete),
            "Follow" => Some(Self::Follow),
            "Like" => Some(Self::Like),
            "Reject" => Some(Self::Reject),
            "Undo" => Some(Self::Undo),
            _ => None,
        }
    }

    /// The wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "Accept",
            Self::Announce => "Announce",
            Self::Create => "Create",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Like => "Like",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
        }
    }
}

/// A validated activity document.
///
/// Every activity carries an actor; the known kinds additionally carry an
/// object reference.
#[derive(Debug, Clone)]
pub struct Activity {
    doc: ApObject,
    kind: Option<ActivityKind>,
    actor_id: String,
    object_ref: Option<Reference>,
}

impl Activity {
    /// Parses an activity document.
    pub fn parse(value: Value) -> AppResult<Self> {
        let doc = ApObject::new(value)?;
        let actor = doc
            .get("actor")
            .ok_or_else(|| AppError::BadRequest("activity must have actor".to_string()))?;
        let actor_id = Reference::parse(actor)?.id().to_string();
        if actor_id.is_empty() {
            return Err(AppError::BadRequest("activity actor has no id".to_string()));
        }
        let kind = ActivityKind::from_type(doc.object_type());
        let object_ref = match doc.get("object") {
            Some(value) => Some(Reference::parse(value)?),
            None if kind.is_some() => {
                return Err(AppError::BadRequest(format!(
                    "{} activity must have object",
                    doc.object_type()
                )))
            }
            None => None,
        };
        Ok(Self {
            doc,
            kind,
            actor_id,
            object_ref,
        })
    }

    /// The kind, when the type is one this server understands.
    #[must_use]
    pub const fn kind(&self) -> Option<ActivityKind> {
        self.kind
    }

    /// The `type` value as it appeared on the wire.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.doc.object_type()
    }

    /// ID of the acting actor.
    #[must_use]
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// The activity's own ID, when assigned.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.doc.id()
    }

    /// The object reference, when present.
    #[must_use]
    pub const fn object_ref(&self) -> Option<&Reference> {
        self.object_ref.as_ref()
    }

    /// The object reference; fails when absent.
    pub fn require_object_ref(&self) -> AppResult<&Reference> {
        self.object_ref
            .as_ref()
            .ok_or_else(|| AppError::BadRequest("activity has no object".to_string()))
    }

    /// For a `Follow`: the actor being followed.
    pub fn followed_id(&self) -> AppResult<&str> {
        if self.kind != Some(ActivityKind::Follow) {
            return Err(AppError::BadRequest(format!(
                "not a Follow activity: {}",
                self.type_name()
            )));
        }
        Ok(self.require_object_ref()?.id())
    }

    /// For an `Undo`: resolves the activity being undone.
    pub async fn resolve_undone(&self, fetch: &dyn Fetch) -> Result<Self, ResolveError> {
        let object = self.require_object_ref().map_err(ResolveError::Invalid)?;
        let resolved = object.resolve(fetch).await?;
        Self::parse(resolved.to_value(true)).map_err(ResolveError::Invalid)
    }

    /// Whether the public address appears in `to` or `cc`.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.doc.is_public()
    }

    /// Whether this document is complete enough to put on the wire.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        self.doc.is_deliverable()
    }

    /// The `published` timestamp, when present.
    #[must_use]
    pub fn published(&self) -> Option<&str> {
        self.doc.published()
    }

    /// Borrows the underlying document view.
    #[must_use]
    pub const fn doc(&self) -> &ApObject {
        &self.doc
    }

    /// Assigns the activity ID.
    pub fn assign_id(&mut self, id: &str) {
        self.doc.set("id", Value::String(id.to_string()));
    }

    /// Assigns the Activity Streams JSON-LD context.
    pub fn set_context(&mut self) {
        self.doc.set_context();
    }

    /// Returns the document, optionally without the JSON-LD context.
    #[must_use]
    pub fn to_value(&self, with_context: bool) -> Value {
        self.doc.to_value(with_context)
    }
}

/// Builds the `Accept` response to a received activity.
///
/// The accepted activity is embedded by value (its context stripped), so the
/// response document is self-contained.
pub fn make_accept_response(actor_id: &str, accepted: &Activity) -> AppResult<Activity> {
    let value = serde_json::json!({
        "type": "Accept",
        "actor": actor_id,
        "object": accepted.to_value(false),
    });
    Activity::parse(value)
}
