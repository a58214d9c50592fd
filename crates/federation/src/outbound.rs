//! The outbound pipeline: staging, translation into deliverable activities,
//! recipient expansion, and per-recipient signed delivery.

use std::collections::{BTreeSet, HashSet, VecDeque};

use quill_common::ids::{parse_user_id, split_user_id};
use quill_common::metrics::{get_metrics, Metrics};
use quill_common::{timefmt, AppError, AppResult};
use quill_store::objects::{username_from_outbox_key, username_from_staging_outbox_key};
use quill_store::ObjectKey;
use quill_vocab::{
    Activity, ActivityKind, Actor, ApObject, Note, ObjectCache, Reference, COLLECTION_TYPES,
    PUBLIC_ADDRESS,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::DeliveryError;
use crate::context::Context;

/// How many follower edges each query pulls during fan-out.
const FOLLOWER_ITEMS_PER_QUERY: usize = 100;

/// Result of translating one staged payload.
#[derive(Debug, Clone)]
pub struct Translation {
    /// The deliverable activity's outbox key.
    pub activity_key: ObjectKey,
    /// The completed post object's key, when the payload was a `Note`.
    pub post_key: Option<ObjectKey>,
}

/// Accepts an object from the acting user into the staging outbox.
///
/// The bearer principal must be the acting user.
pub async fn stage_outbound_object(
    ctx: &Context,
    username: &str,
    bearer_username: &str,
    body: Value,
) -> AppResult<ObjectKey> {
    if username != bearer_username {
        return Err(AppError::Forbidden(
            "username and bearer username do not match".to_string(),
        ));
    }
    let user = ctx.require_user(username).await?;
    let object = ApObject::new(body).map_err(|e| AppError::BadRequest(format!("invalid body: {e}")))?;
    let key = user.generate_staging_outbox_key();
    debug!(key = %key, "staging outbound object");
    ctx.objects.save_json(&key, &object.to_value(true)).await?;
    Ok(ctx.objects.object_key(key))
}

/// Translates a staged payload into the activity to deliver.
///
/// An `Accept` is completed with a context and fresh activity ID. A `Note`
/// is completed into a post, persisted, and wrapped in a `Create`. Anything
/// else is undeliverable.
pub async fn translate_staged_object(ctx: &Context, staged: &ObjectKey) -> AppResult<Translation> {
    ctx.objects.check_bucket(staged)?;
    let username = username_from_staging_outbox_key(&staged.key)
        .map_err(|e| AppError::BadConfiguration(e.to_string()))?;
    let user = ctx.require_user(&username).await?;
    debug!(key = %staged.key, "loading staged object");
    let object = ctx.objects.load_object(&staged.key).await?;

    let object_type = object.object_type().to_string();
    let (activity, post_key) = match object_type.as_str() {
        "Accept" => {
            let mut accept = Activity::parse(object.to_value(true))
                .map_err(|e| AppError::Corrupted(e.to_string()))?;
            accept.set_context();
            accept.assign_id(&user.generate_activity_id());
            (accept, None)
        }
        "Note" => {
            let mut note =
                Note::from_object(object).map_err(|e| AppError::Corrupted(e.to_string()))?;
            note.set_context();
            note.assign_id(&user.generate_post_id());
            note.set_attributed_to(&user.id());
            note.set_published(&timefmt::now_seconds());
            let post_key = ctx.objects.save_post(&note).await?;
            let create = note.wrap_in_create(&user.generate_activity_id())?;
            (create, Some(post_key))
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "undeliverable object: {other}"
            )))
        }
    };

    debug!(id = ?activity.id(), "staging translated activity");
    let activity_key = ctx.objects.save_activity_in_outbox(&activity).await?;
    Ok(Translation {
        activity_key,
        post_key,
    })
}

/// Registers a translated activity in its owner's history.
///
/// Returns the acting actor's ID for the closing last-activity update. A
/// re-run that finds the record already present succeeds.
pub async fn push_staged_activity(ctx: &Context, activity_key: &ObjectKey) -> AppResult<String> {
    ctx.objects.check_bucket(activity_key)?;
    let activity = ctx.objects.load_activity(&activity_key.key).await?;
    debug!(id = ?activity.id(), "pushing activity");
    match ctx.index.put_activity(&activity).await {
        Ok(()) | Err(AppError::Duplicate(_)) => Ok(activity.actor_id().to_string()),
        Err(err) => Err(err),
    }
}

/// Registers a completed post in the object index.
pub async fn push_staged_object(ctx: &Context, post_key: &ObjectKey) -> AppResult<()> {
    ctx.objects.check_bucket(post_key)?;
    let object = ctx.objects.load_object(&post_key.key).await?;
    if object.object_type() != "Note" {
        return Err(AppError::BadRequest(format!(
            "\"{}\" cannot be pushed to the object index",
            object.object_type()
        )));
    }
    let note = Note::from_object(object).map_err(|e| AppError::Corrupted(e.to_string()))?;
    match ctx.index.put_post(&note).await {
        Ok(()) | Err(AppError::Duplicate(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Expands the recipients of a translated activity into inbox URIs.
pub async fn expand_recipients(ctx: &Context, activity_key: &ObjectKey) -> AppResult<Vec<String>> {
    ctx.objects.check_bucket(activity_key)?;
    let username = username_from_outbox_key(&activity_key.key)
        .map_err(|e| AppError::BadConfiguration(e.to_string()))?;
    ctx.require_user(&username).await?;
    let activity = ctx.objects.load_activity(&activity_key.key).await?;
    debug!(id = ?activity.id(), "expanding recipients");

    let mut collector = RecipientCollector::new(ctx);
    collector.exclude(activity.actor_id());
    match activity.kind() {
        Some(ActivityKind::Create) => {
            for field in ["to", "cc", "bcc"] {
                debug!(field = %field, "resolving addresses");
                for address in activity.doc().addresses(field) {
                    collector.enqueue(address);
                }
            }
        }
        Some(ActivityKind::Accept) => {
            debug!("resolving accepted object");
            let accepted = activity.require_object_ref()?;
            let accepted = accepted
                .resolve(ctx.fetch.as_ref())
                .await
                .map_err(AppError::from)?;
            let accepted = Activity::parse(accepted.to_value(true))?;
            collector.enqueue(accepted.actor_id().to_string());
        }
        other => {
            warn!(kind = ?other, "no recipients for activity kind");
        }
    }
    collector.run().await
}

/// Collects recipient inbox URIs, deduplicating actors through an object
/// cache and walking internal follower collections.
struct RecipientCollector<'a> {
    ctx: &'a Context,
    queue: VecDeque<String>,
    excluded: HashSet<String>,
    collected: HashSet<String>,
    recipients: BTreeSet<String>,
    cache: ObjectCache,
}

impl<'a> RecipientCollector<'a> {
    fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            queue: VecDeque::new(),
            excluded: HashSet::from([PUBLIC_ADDRESS.to_string()]),
            collected: HashSet::new(),
            recipients: BTreeSet::new(),
            cache: ObjectCache::new(),
        }
    }

    fn exclude(&mut self, id: &str) {
        self.excluded.insert(id.to_string());
    }

    fn enqueue(&mut self, id: String) {
        self.queue.push_back(id);
    }

    async fn run(mut self) -> AppResult<Vec<String>> {
        while let Some(recipient) = self.queue.pop_front() {
            self.resolve_recipient(&recipient).await?;
        }
        Ok(self.recipients.into_iter().collect())
    }

    async fn resolve_recipient(&mut self, recipient: &str) -> AppResult<()> {
        if self.excluded.contains(recipient) || !self.collected.insert(recipient.to_string()) {
            return Ok(());
        }
        debug!(recipient = %recipient, "resolving recipient");
        let host = url::Url::parse(recipient)
            .ok()
            .and_then(|uri| uri.host_str().map(str::to_string));
        if host.as_deref() == Some(self.ctx.domain()) {
            return self.resolve_internal(recipient).await;
        }
        self.resolve_external(recipient).await
    }

    /// A recipient on this host: a user's own inbox, or their follower
    /// collection fanned out edge by edge.
    async fn resolve_internal(&mut self, recipient: &str) -> AppResult<()> {
        let (_, username, remaining) = split_user_id(recipient)?;
        debug!(username = %username, path = %remaining, "resolving internal recipient");
        let user = self.ctx.require_user(&username).await?;
        match remaining.as_str() {
            "" => {
                debug!(username = %username, "internal user");
                self.recipients.insert(user.inbox_uri());
            }
            "/followers" => {
                debug!(username = %username, "expanding user followers");
                let mut walk = self.ctx.users.enumerate_followers(
                    &username,
                    FOLLOWER_ITEMS_PER_QUERY,
                    None,
                    None,
                )?;
                while let Some(follower_id) = walk.next().await? {
                    self.enqueue(follower_id);
                }
            }
            other => {
                return Err(AppError::BadRequest(format!(
                    "unresolvable internal entity: {other}"
                )))
            }
        }
        Ok(())
    }

    /// A remote recipient: resolve the document and take the preferred
    /// inbox of actor-like objects. Gone recipients are skipped; collection
    /// resolution is deferred.
    async fn resolve_external(&mut self, recipient: &str) -> AppResult<()> {
        let reference = Reference::Uri(recipient.to_string());
        let object = match self.cache.resolve(&reference, self.ctx.fetch.as_ref()).await {
            Ok(object) => object,
            Err(err) if err.status() == Some(410) => {
                warn!(recipient = %recipient, "recipient is gone");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if quill_vocab::ACTOR_TYPES.contains(&object.object_type()) {
            let actor = Actor::new(object.to_value(true))?;
            let inbox = actor.preferred_inbox()?;
            debug!(recipient = %recipient, inbox = %inbox, "recipient inbox collected");
            self.recipients.insert(inbox);
        } else if COLLECTION_TYPES.contains(&object.object_type()) {
            debug!(recipient = %recipient, "collection recipients are deferred");
        } else {
            return Err(AppError::BadRequest(format!(
                "unsupported recipient type \"{}\": {recipient}",
                object.object_type()
            )));
        }
        Ok(())
    }
}

/// Delivers a translated activity to one recipient inbox.
///
/// A gone recipient is skipped; 429 and timeouts surface as transient so
/// the orchestrator retries.
pub async fn deliver_activity(
    ctx: &Context,
    activity_key: &ObjectKey,
    recipient: &str,
) -> AppResult<()> {
    ctx.objects.check_bucket(activity_key)?;
    debug!(key = %activity_key.key, recipient = %recipient, "delivering activity");
    let activity = ctx.objects.load_activity(&activity_key.key).await?;
    if !activity.is_deliverable() {
        return Err(AppError::Corrupted(
            "activity is not ready to be delivered".to_string(),
        ));
    }
    let (domain, username) = parse_user_id(activity.actor_id())?;
    if domain != ctx.domain() {
        return Err(AppError::BadConfiguration(format!(
            "actor domain mismatch: {domain} != {}",
            ctx.domain()
        )));
    }
    let user = ctx.require_user(&username).await?;
    let private_key_pem = ctx
        .params
        .get_parameter(&user.private_key_path, true)
        .await
        .map_err(|e| AppError::BadConfiguration(format!("no private key: {e}")))?;
    let body = serde_json::to_vec(&activity.to_value(true))
        .map_err(|e| AppError::Internal(format!("serialization failed: {e}")))?;

    let metrics = get_metrics();
    match ctx
        .deliverer
        .deliver(recipient, &body, &user.key_id(), &private_key_pem)
        .await
    {
        Ok(()) => {
            Metrics::increment(&metrics.deliveries_succeeded);
            Ok(())
        }
        Err(DeliveryError::Gone(inbox)) => {
            warn!(inbox = %inbox, "skipping gone recipient");
            Metrics::increment(&metrics.recipients_gone);
            Ok(())
        }
        Err(err @ DeliveryError::Transient(_)) => {
            Metrics::increment(&metrics.deliveries_transient);
            Err(AppError::Transient(err.to_string()))
        }
        Err(err @ DeliveryError::Signing(_)) => {
            Metrics::increment(&metrics.deliveries_failed);
            Err(AppError::BadConfiguration(err.to_string()))
        }
        Err(err) => {
            Metrics::increment(&metrics.deliveries_failed);
            Err(AppError::Communication(err.to_string()))
        }
    }
}

/// Stamps the acting user's last-activity time.
pub async fn update_last_activity(ctx: &Context, actor_id: &str) -> AppResult<()> {
    let (domain, username, _) = split_user_id(actor_id)?;
    if domain != ctx.domain() {
        return Err(AppError::BadConfiguration(format!(
            "domain name mismatch: {} vs {domain}",
            ctx.domain()
        )));
    }
    ctx.require_user(&username).await?;
    ctx.users.update_last_activity(&username).await
}

/// Composes the outbound units for one staged payload the way the
/// orchestrating state machine does: translate, register, expand, deliver
/// to every recipient, then stamp the actor.
///
/// Per-recipient permanent failures are logged and do not stop the rest of
/// the fan-out.
pub async fn run_outbound_pipeline(ctx: &Context, staged: &ObjectKey) -> AppResult<()> {
    let translation = translate_staged_object(ctx, staged).await?;
    if let Some(post_key) = &translation.post_key {
        push_staged_object(ctx, post_key).await?;
    }
    let actor_id = push_staged_activity(ctx, &translation.activity_key).await?;
    let recipients = expand_recipients(ctx, &translation.activity_key).await?;
    info!(count = recipients.len(), "delivering to recipients");
    for recipient in &recipients {
        match deliver_activity(ctx, &translation.activity_key, recipient).await {
            Ok(()) => {}
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                warn!(recipient = %recipient, error = %err, "delivery failed");
            }
        }
    }
    update_last_activity(ctx, &actor_id).await
}
