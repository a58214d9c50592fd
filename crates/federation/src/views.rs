//! Read views: actor documents and the paginated collection endpoints.
//!
//! Roots are `OrderedCollection` documents pointing at their first page;
//! pages are `OrderedCollectionPage` documents whose `next`/`prev` links
//! embed percent-encoded cursors. `next` is omitted when no later page
//! exists and `prev` is omitted on the first page.

use quill_common::cursor::{
    deserialize_activity_cursor, deserialize_reply_cursor, make_oldest_activity_key,
    serialize_activity_cursor, urlencode, OLDEST_REPLY_CURSOR,
};
use quill_common::{timefmt, AppError, AppResult};
use quill_index::{ActivityRecord, ReplyRecord};
use quill_vocab::{Note, ACTIVITY_STREAMS_CONTEXT};
use serde_json::{json, Map, Value};

use crate::context::Context;

fn reject_both_cursors(before: Option<&String>, after: Option<&String>) -> AppResult<()> {
    if before.is_some() && after.is_some() {
        return Err(AppError::BadRequest(
            "both of after and before are specified".to_string(),
        ));
    }
    Ok(())
}

/// The actor document of a local user.
pub async fn describe_user(ctx: &Context, username: &str) -> AppResult<Value> {
    let user = ctx.require_user(username).await?;
    Ok(json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "id": user.id(),
        "type": "Person",
        "name": user.name,
        "preferredUsername": user.preferred_username,
        "summary": user.summary,
        "url": user.url,
        "inbox": user.inbox_uri(),
        "outbox": user.outbox_uri(),
        "followers": user.followers_uri(),
        "following": user.following_uri(),
        "publicKey": user.public_key_value(),
    }))
}

/// A collection page document with optional `next`/`prev` links.
fn collection_page(
    id: &str,
    part_of: &str,
    total_items: Option<i64>,
    items: Vec<Value>,
    options: Vec<(&str, String)>,
) -> Value {
    let mut page = Map::new();
    page.insert("@context".to_string(), json!(ACTIVITY_STREAMS_CONTEXT));
    page.insert("id".to_string(), json!(id));
    page.insert("type".to_string(), json!("OrderedCollectionPage"));
    if let Some(total) = total_items {
        page.insert("totalItems".to_string(), json!(total));
    }
    page.insert("partOf".to_string(), json!(part_of));
    page.insert("orderedItems".to_string(), Value::Array(items));
    for (name, value) in options {
        page.insert(name.to_string(), json!(value));
    }
    Value::Object(page)
}

// === outbox ===

/// The outbox collection or one of its pages.
pub async fn outbox_view(
    ctx: &Context,
    username: &str,
    page: bool,
    before: Option<String>,
    after: Option<String>,
) -> AppResult<Value> {
    reject_both_cursors(before.as_ref(), after.as_ref())?;
    let user = ctx.require_user(username).await?;
    let outbox_uri = user.outbox_uri();
    if !page {
        return Ok(json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": outbox_uri,
            "type": "OrderedCollection",
            "first": format!("{outbox_uri}?page=true"),
        }));
    }

    let page_size = ctx.config.pages.outbox;
    let before_key = before
        .as_deref()
        .map(|cursor| deserialize_activity_cursor(cursor, &user.username))
        .transpose()?;
    let after_key = after
        .as_deref()
        .map(|cursor| deserialize_activity_cursor(cursor, &user.username))
        .transpose()?;

    let mut walk =
        ctx.index
            .enumerate_user_activities(&user, page_size, before_key, after_key)?;
    let mut records = walk.take(page_size).await?;
    if after.is_some() {
        // The walk ran chronologically; pages read newest-first.
        records.reverse();
    }

    let mut items = Vec::with_capacity(records.len());
    for record in &records {
        let activity = record.resolve(&ctx.objects).await.map_err(|err| match err {
            AppError::NotFound(message) => AppError::Corrupted(message),
            other => other,
        })?;
        items.push(activity.to_value(true));
    }

    let cursor_of = |record: &ActivityRecord| -> AppResult<String> {
        Ok(urlencode(&serialize_activity_cursor(&record.primary_key())?))
    };

    let (current_id, options) = match (&before, &after) {
        (None, None) => {
            let id = format!("{outbox_uri}?page=true");
            let options = match records.last() {
                None => Vec::new(),
                Some(last) => vec![(
                    "next",
                    format!("{outbox_uri}?page=true&before={}", cursor_of(last)?),
                )],
            };
            (id, options)
        }
        (Some(before), None) => {
            let id = format!("{outbox_uri}?page=true&before={}", urlencode(before));
            let options = if records.is_empty() {
                let oldest = make_oldest_activity_key(
                    &user.username,
                    timefmt::month_of(user.created_at),
                );
                let prev = urlencode(&serialize_activity_cursor(&oldest)?);
                vec![("prev", format!("{outbox_uri}?page=true&after={prev}"))]
            } else {
                vec![
                    (
                        "prev",
                        format!("{outbox_uri}?page=true&after={}", cursor_of(&records[0])?),
                    ),
                    (
                        "next",
                        format!(
                            "{outbox_uri}?page=true&before={}",
                            cursor_of(&records[records.len() - 1])?
                        ),
                    ),
                ]
            };
            (id, options)
        }
        (None, Some(after)) => {
            let id = format!("{outbox_uri}?page=true&after={}", urlencode(after));
            let options = if records.is_empty() {
                vec![("next", format!("{outbox_uri}?page=true"))]
            } else {
                vec![
                    (
                        "prev",
                        format!("{outbox_uri}?page=true&after={}", cursor_of(&records[0])?),
                    ),
                    (
                        "next",
                        format!(
                            "{outbox_uri}?page=true&before={}",
                            cursor_of(&records[records.len() - 1])?
                        ),
                    ),
                ]
            };
            (id, options)
        }
        (Some(_), Some(_)) => unreachable!("both cursors rejected above"),
    };

    Ok(collection_page(&current_id, &outbox_uri, None, items, options))
}

// === followers / following ===

enum EdgeCollection {
    Followers,
    Following,
}

async fn edge_view(
    ctx: &Context,
    username: &str,
    which: EdgeCollection,
    page: bool,
    before: Option<String>,
    after: Option<String>,
) -> AppResult<Value> {
    reject_both_cursors(before.as_ref(), after.as_ref())?;
    let user = ctx.require_user(username).await?;
    let (collection_uri, total, page_size) = match which {
        EdgeCollection::Followers => (
            user.followers_uri(),
            user.follower_count,
            ctx.config.pages.followers,
        ),
        EdgeCollection::Following => (
            user.following_uri(),
            user.following_count,
            ctx.config.pages.following,
        ),
    };
    if !page {
        return Ok(json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": collection_uri,
            "type": "OrderedCollection",
            "totalItems": total,
            "first": format!("{collection_uri}?page=true"),
        }));
    }

    let mut walk = match which {
        EdgeCollection::Followers => {
            ctx.users
                .enumerate_followers(username, page_size, after.clone(), before.clone())?
        }
        EdgeCollection::Following => {
            ctx.users
                .enumerate_followees(username, page_size, after.clone(), before.clone())?
        }
    };
    let ids = walk.take(page_size).await?;
    let items: Vec<Value> = ids.iter().map(|id| json!(id)).collect();

    let (current_id, options) = match (&before, &after) {
        (None, None) => {
            let id = format!("{collection_uri}?page=true");
            let options = match ids.last() {
                None => Vec::new(),
                Some(last) => vec![(
                    "next",
                    format!("{collection_uri}?page=true&after={}", urlencode(last)),
                )],
            };
            (id, options)
        }
        (None, Some(after)) => {
            let id = format!("{collection_uri}?page=true&after={}", urlencode(after));
            let options = if ids.is_empty() {
                vec![("prev", format!("{collection_uri}?page=true&before=~"))]
            } else {
                vec![
                    (
                        "prev",
                        format!("{collection_uri}?page=true&before={}", urlencode(&ids[0])),
                    ),
                    (
                        "next",
                        format!(
                            "{collection_uri}?page=true&after={}",
                            urlencode(&ids[ids.len() - 1])
                        ),
                    ),
                ]
            };
            (id, options)
        }
        (Some(before), None) => {
            let id = format!("{collection_uri}?page=true&before={}", urlencode(before));
            let options = if ids.is_empty() {
                vec![("next", format!("{collection_uri}?page=true"))]
            } else {
                vec![
                    (
                        "prev",
                        format!("{collection_uri}?page=true&before={}", urlencode(&ids[0])),
                    ),
                    (
                        "next",
                        format!(
                            "{collection_uri}?page=true&after={}",
                            urlencode(&ids[ids.len() - 1])
                        ),
                    ),
                ]
            };
            (id, options)
        }
        (Some(_), Some(_)) => unreachable!("both cursors rejected above"),
    };

    Ok(collection_page(
        &current_id,
        &collection_uri,
        Some(total),
        items,
        options,
    ))
}

/// The followers collection or one of its pages.
pub async fn followers_view(
    ctx: &Context,
    username: &str,
    page: bool,
    before: Option<String>,
    after: Option<String>,
) -> AppResult<Value> {
    edge_view(ctx, username, EdgeCollection::Followers, page, before, after).await
}

/// The following collection or one of its pages.
pub async fn following_view(
    ctx: &Context,
    username: &str,
    page: bool,
    before: Option<String>,
    after: Option<String>,
) -> AppResult<Value> {
    edge_view(ctx, username, EdgeCollection::Following, page, before, after).await
}

// === posts / replies ===

/// A public post document, its `replies` pointing at the collection.
pub async fn post_view(ctx: &Context, username: &str, unique_part: &str) -> AppResult<Value> {
    let post = ctx
        .index
        .find_user_post(username, unique_part)
        .await?
        .filter(|post| post.is_public)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no such post: username={username}, unique part={unique_part}"
            ))
        })?;
    let object = post.resolve(&ctx.objects).await.map_err(|err| match err {
        AppError::NotFound(message) => AppError::Corrupted(message),
        other => other,
    })?;
    let mut note = Note::from_object(object).map_err(|e| AppError::Corrupted(e.to_string()))?;
    note.set_replies(&post.replies_uri());
    Ok(note.to_value(true))
}

/// The replies collection of a post, or one of its pages.
pub async fn replies_view(
    ctx: &Context,
    username: &str,
    unique_part: &str,
    page: bool,
    before: Option<String>,
    after: Option<String>,
) -> AppResult<Value> {
    reject_both_cursors(before.as_ref(), after.as_ref())?;
    let post = ctx
        .index
        .find_user_post(username, unique_part)
        .await?
        .filter(|post| post.is_public)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no such post: username={username}, unique part={unique_part}"
            ))
        })?;
    let replies_uri = post.replies_uri();
    if !page {
        return Ok(json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": replies_uri,
            "type": "OrderedCollection",
            "totalItems": post.reply_count,
            "first": format!("{replies_uri}?page=true"),
        }));
    }

    let page_size = ctx.config.pages.replies;
    let before_sk = before.as_deref().map(deserialize_reply_cursor).transpose()?;
    let after_sk = after.as_deref().map(deserialize_reply_cursor).transpose()?;
    let mut walk =
        ctx.index
            .enumerate_replies(username, unique_part, page_size, before_sk, after_sk)?;
    let records = walk.take(page_size).await?;
    let items: Vec<Value> = records.iter().map(|r| json!(r.reply_id)).collect();

    let cursor_of = |record: &ReplyRecord| -> AppResult<String> {
        Ok(urlencode(&record.serialized_cursor()?))
    };

    let (current_id, options) = match (&before, &after) {
        (None, None) => {
            let id = format!("{replies_uri}?page=true");
            let options = match records.last() {
                None => Vec::new(),
                Some(last) => vec![(
                    "next",
                    format!("{replies_uri}?page=true&before={}", cursor_of(last)?),
                )],
            };
            (id, options)
        }
        (Some(before), None) => {
            let id = format!("{replies_uri}?page=true&before={}", urlencode(before));
            let options = if records.is_empty() {
                vec![(
                    "prev",
                    format!(
                        "{replies_uri}?page=true&after={}",
                        urlencode(OLDEST_REPLY_CURSOR)
                    ),
                )]
            } else {
                vec![
                    (
                        "prev",
                        format!("{replies_uri}?page=true&after={}", cursor_of(&records[0])?),
                    ),
                    (
                        "next",
                        format!(
                            "{replies_uri}?page=true&before={}",
                            cursor_of(&records[records.len() - 1])?
                        ),
                    ),
                ]
            };
            (id, options)
        }
        (None, Some(after)) => {
            let id = format!("{replies_uri}?page=true&after={}", urlencode(after));
            let options = if records.is_empty() {
                vec![("next", format!("{replies_uri}?page=true"))]
            } else {
                vec![
                    (
                        "prev",
                        format!("{replies_uri}?page=true&after={}", cursor_of(&records[0])?),
                    ),
                    (
                        "next",
                        format!(
                            "{replies_uri}?page=true&before={}",
                            cursor_of(&records[records.len() - 1])?
                        ),
                    ),
                ]
            };
            (id, options)
        }
        (Some(_), Some(_)) => unreachable!("both cursors rejected above"),
    };

    Ok(collection_page(
        &current_id,
        &replies_uri,
        Some(post.reply_count),
        items,
        options,
    ))
}
