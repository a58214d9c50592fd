//! The inbound pipeline: signature verification, prefiltering, idempotent
//! persistence, and per-type dispatch of received activities.

use std::collections::HashMap;

use quill_common::ids::parse_user_object_id;
use quill_common::metrics::{get_metrics, Metrics};
use quill_common::{timefmt, AppError, AppResult};
use quill_store::objects::username_from_inbox_key;
use quill_store::ObjectKey;
use quill_vocab::{make_accept_response, Activity, ActivityKind, Actor, ActorResolveError};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::Context;
use crate::signature::{parse_signature_header, verify_signature_and_headers};

/// Bodies at most this large are parsed before signature verification.
pub const PREFILTER_BODY_SIZE: usize = 10 * 1024;

/// One received inbox request, as the gateway hands it over.
#[derive(Debug, Clone)]
pub struct InboxRequest {
    pub username: String,
    /// The `Signature` header value.
    pub signature: String,
    /// The `Date` header value.
    pub date: String,
    /// The `Digest` header value.
    pub digest: String,
    /// The `Content-Type` header value.
    pub content_type: String,
    /// The raw request body; needed verbatim to verify the signature.
    pub body: String,
}

impl InboxRequest {
    fn envelope(&self) -> Value {
        json!({
            "username": self.username,
            "signature": self.signature,
            "date": self.date,
            "digest": self.digest,
            "contentType": self.content_type,
            "body": self.body,
        })
    }
}

/// Writes a rejected payload to the forensic bucket.
///
/// Quarantining must never fail the request it documents; errors are logged
/// and swallowed.
async fn quarantine(ctx: &Context, tag: &str, request: &InboxRequest, options: Option<Value>) {
    let mut envelope = json!({
        "tag": tag,
        "datetime": timefmt::now_micros(),
        "action": "receive_inbound_activity",
        "payload": request.envelope(),
    });
    if let Some(options) = options {
        envelope["options"] = options;
    }
    Metrics::increment(&get_metrics().activities_quarantined);
    if let Err(err) = ctx.quarantine.save_quarantined(&envelope).await {
        warn!(tag = %tag, error = %err, "failed to quarantine payload");
    }
}

/// Cheap parse-and-drop before any signature work.
///
/// Returns `(dropped, activity)`: bodies over the size threshold come back
/// unparsed, and a self-directed `Delete` is reported as dropped.
fn prefilter_activity(body: &str) -> AppResult<(bool, Option<Activity>)> {
    if body.len() > PREFILTER_BODY_SIZE {
        return Ok((false, None));
    }
    debug!("prefiltering activity");
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))?;
    let activity = Activity::parse(value)?;
    if activity.kind() == Some(ActivityKind::Delete) {
        if let Some(object) = activity.object_ref() {
            if object.id() == activity.actor_id() {
                return Ok((true, Some(activity)));
            }
        }
    }
    Ok((false, Some(activity)))
}

/// Verifies and persists one received activity.
///
/// Returns the inbox blob key for the dispatch step, or `None` when the
/// prefilter dropped the payload. Every rejection path quarantines the
/// envelope first.
pub async fn receive_inbound_activity(
    ctx: &Context,
    request: &InboxRequest,
) -> AppResult<Option<ObjectKey>> {
    let username = &request.username;
    debug!(username = %username, "processing activity sent to inbox");

    let mut activity = match prefilter_activity(&request.body) {
        Ok((true, _)) => {
            debug!("prefiltered activity: Delete of the actor itself");
            Metrics::increment(&get_metrics().activities_prefiltered);
            return Ok(None);
        }
        Ok((false, activity)) => activity,
        Err(err) => {
            quarantine(ctx, "invalid_activity", request, None).await;
            return Err(err);
        }
    };

    debug!("parsing signature");
    let signature = match parse_signature_header(&request.signature) {
        Ok(signature) => signature,
        Err(err) => {
            quarantine(ctx, "bad_signature", request, None).await;
            return Err(AppError::Unauthorized.log_cause(&format!("bad signature: {err}")));
        }
    };

    debug!(key_id = %signature.key_id, "resolving signer");
    let signer = match Actor::resolve(&signature.key_id, ctx.fetch.as_ref()).await {
        Ok(signer) => signer,
        Err(ActorResolveError::Fetch(err)) => {
            quarantine(ctx, "bad_signer", request, None).await;
            return Err(AppError::Unauthorized
                .log_cause(&format!("failed to resolve signer {}: {err}", signature.key_id)));
        }
        Err(ActorResolveError::Invalid(err)) => {
            quarantine(ctx, "bad_signer_format", request, None).await;
            return Err(AppError::Unauthorized.log_cause(&format!("invalid actor: {err}")));
        }
    };

    debug!("loading public key");
    let public_key = match signer.public_key() {
        Ok(key) => key,
        Err(err) => {
            quarantine(ctx, "bad_signer_format", request, Some(signer.doc().to_value(true)))
                .await;
            return Err(AppError::Unauthorized.log_cause(&format!("invalid actor: {err}")));
        }
    };
    if public_key.id != signature.key_id {
        quarantine(ctx, "bad_signer_format", request, Some(signer.doc().to_value(true))).await;
        return Err(
            AppError::Unauthorized.log_cause(&format!("key ID mismatch: {}", signature.key_id))
        );
    }

    debug!("verifying signature");
    let header_values = HashMap::from([
        (
            "(request-target)".to_string(),
            format!("post /users/{username}/inbox"),
        ),
        ("host".to_string(), ctx.domain().to_string()),
        ("date".to_string(), request.date.clone()),
        ("digest".to_string(), request.digest.clone()),
        ("content-type".to_string(), request.content_type.clone()),
    ]);
    if let Err(err) = verify_signature_and_headers(
        &signature,
        &public_key.public_key_pem,
        &header_values,
        &request.body,
    ) {
        quarantine(ctx, "invalid_signature", request, None).await;
        return Err(AppError::Unauthorized.log_cause(&format!("failed to authenticate: {err}")));
    }

    // Only now is the body trusted enough to parse in the large case.
    if activity.is_none() {
        debug!("parsing activity");
        let parsed = serde_json::from_str(&request.body)
            .map_err(AppError::from)
            .and_then(Activity::parse);
        match parsed {
            Ok(parsed) => activity = Some(parsed),
            Err(err) => {
                quarantine(ctx, "invalid_activity", request, None).await;
                return Err(err);
            }
        }
    }
    let activity = activity.ok_or_else(|| AppError::Internal("activity not parsed".to_string()))?;
    let signer_id = signer.id().map_err(|_| AppError::Unauthorized)?;
    if signer_id != activity.actor_id() {
        quarantine(ctx, "invalid_activity", request, Some(activity.to_value(true))).await;
        return Err(AppError::Unauthorized.log_cause(&format!(
            "signer and actor mismatch: {signer_id} != {}",
            activity.actor_id()
        )));
    }

    debug!(username = %username, "looking up recipient");
    let user = ctx
        .users
        .find_user_by_username(username, ctx.domain())
        .await?;
    if user.is_none() {
        quarantine(ctx, "bad_recipient", request, None).await;
        return Err(AppError::NotFound(format!("no such user: {username}")));
    }

    match ctx
        .objects
        .save_inbox_payload(username, &request.body, &request.digest)
        .await
    {
        Ok(key) => {
            Metrics::increment(&get_metrics().activities_received);
            Ok(Some(key))
        }
        Err(err @ AppError::BadRequest(_)) => {
            quarantine(ctx, "bad_signature", request, None).await;
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Dispatches a persisted inbound activity into its state transition.
///
/// Returns the staging-outbox key of a response activity when the dispatch
/// produced one (a `Follow` staging its `Accept`).
pub async fn dispatch_inbound_activity(
    ctx: &Context,
    key: &ObjectKey,
) -> AppResult<Option<ObjectKey>> {
    ctx.objects.check_bucket(key)?;
    let username = username_from_inbox_key(&key.key)
        .map_err(|e| AppError::BadConfiguration(e.to_string()))?;
    debug!(username = %username, "looking up user");
    let user = ctx.require_user(&username).await?;
    debug!(key = %key.key, "loading activity");
    let activity = ctx.objects.load_activity(&key.key).await?;
    debug!(kind = %activity.type_name(), "dispatching activity");

    match activity.kind() {
        Some(ActivityKind::Follow) => {
            ctx.users.add_user_follower(&username, &activity).await?;
            let response = make_accept_response(activity.followed_id()?, &activity)?;
            let staging_key = user.generate_staging_outbox_key();
            debug!(key = %staging_key, "staging Accept response");
            ctx.objects
                .save_json(&staging_key, &response.to_value(true))
                .await?;
            Ok(Some(ctx.objects.object_key(staging_key)))
        }
        Some(ActivityKind::Undo) => {
            let undone = match activity.resolve_undone(ctx.fetch.as_ref()).await {
                Ok(undone) => undone,
                Err(err) if err.status() == Some(401) => {
                    // The referenced activity is not visible to us; treat it
                    // as absent rather than failing the Undo.
                    warn!(error = %err, "undone activity is not accessible");
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };
            if undone.kind() == Some(ActivityKind::Follow) {
                ctx.users.remove_user_follower(&username, &undone).await?;
            } else {
                warn!(kind = %undone.type_name(), "undo of unsupported activity ignored");
            }
            Ok(None)
        }
        Some(ActivityKind::Create) => {
            dispatch_create(ctx, &username, &activity).await?;
            Ok(None)
        }
        other => {
            debug!(kind = ?other, "activity ignored");
            Ok(None)
        }
    }
}

/// Handles a received `Create`: replies to local posts are indexed,
/// everything else is ignored.
async fn dispatch_create(ctx: &Context, username: &str, activity: &Activity) -> AppResult<()> {
    let object = match activity
        .require_object_ref()?
        .resolve(ctx.fetch.as_ref())
        .await
    {
        Ok(object) => object,
        Err(err) if err.status() == Some(401) => {
            warn!(error = %err, "created object is not accessible");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let Some(in_reply_to) = object.in_reply_to()? else {
        warn!("non-reply object is ignored");
        return Ok(());
    };
    debug!(parent = %in_reply_to.id(), "handling reply");
    let (_, post_owner, category, unique_part) = match parse_user_object_id(in_reply_to.id()) {
        Ok(parts) => parts,
        Err(_) => {
            warn!(parent = %in_reply_to.id(), "reply to a foreign object ignored");
            return Ok(());
        }
    };
    if category != "posts" {
        warn!(category = %category, "reply to other than a post is not supported");
        return Ok(());
    }
    if post_owner != username {
        warn!(owner = %post_owner, inbox = %username, "reply to another user's post ignored");
        return Ok(());
    }
    let post = ctx
        .index
        .find_user_post(&post_owner, &unique_part)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no such post: username={post_owner}, unique part={unique_part}"
            ))
        })?;
    match ctx
        .index
        .add_reply_to_post(&post.username, &post.unique_part, &object)
        .await
    {
        Ok(()) => Ok(()),
        // Redelivery of the same reply is a no-op.
        Err(AppError::Duplicate(message)) => {
            debug!(message = %message, "reply already recorded");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
