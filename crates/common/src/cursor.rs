//! Index key grammar and the pagination cursor codec.
//!
//! Both index tables share one `(pk, sk)` layout:
//!
//! | `pk` | `sk` | holds |
//! |---|---|---|
//! | `user:{u}` | `reserved` | user record |
//! | `follower:{u}` | `{followerId}` | follower edge |
//! | `followee:{u}` | `{followeeId}` | followee edge |
//! | `activity:{u}:{YYYY-MM}` | `{DDTHH:MM:SS.ffffff}:{uniquePart}` | activity record |
//! | `object:{u}:post:{uniquePart}` | `metadata` | post record |
//! | `object:{u}:post:{uniquePart}` | `reply:{publishedZ}:{replyId}` | reply edge |
//!
//! Cursors embedded in collection page links serialize a `(pk, sk)` pair into
//! one sortable string and back.

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, AppResult};
use crate::timefmt;

/// Prefix of a partition key holding a user record.
pub const USER_PK_PREFIX: &str = "user:";
/// Prefix of a partition key holding follower edges.
pub const FOLLOWER_PK_PREFIX: &str = "follower:";
/// Prefix of a partition key holding followee edges.
pub const FOLLOWEE_PK_PREFIX: &str = "followee:";
/// Prefix of a partition key holding monthly activity records.
pub const ACTIVITY_PK_PREFIX: &str = "activity:";
/// Prefix of a partition key holding post records and reply edges.
pub const OBJECT_PK_PREFIX: &str = "object:";
/// Sort key of a post metadata record.
pub const POST_METADATA_SK: &str = "metadata";
/// Prefix of a reply-edge sort key.
pub const REPLY_SK_PREFIX: &str = "reply:";

/// Sort key that precedes every real activity in a month partition.
pub const OLDEST_ACTIVITY_SK: &str = "00T00:00:00.000000:@";
/// Serialized reply cursor that precedes every real reply.
pub const OLDEST_REPLY_CURSOR: &str = "1970-01-01T00:00:00Z:!";
/// Cursor sentinel that follows every real sort key ("newest").
pub const NEWEST_CURSOR: &str = "~";

/// Primary key of an item in the user or object table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    /// Partition key.
    pub pk: String,
    /// Sort key.
    pub sk: String,
}

static ACTIVITY_PK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^activity:([^:]+):([0-9]{4}-[0-9]{2})$").expect("static pattern"));

static ACTIVITY_SK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{2}\.[0-9]{6}):([^:]+)$")
        .expect("static pattern")
});

static ACTIVITY_CURSOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]{4}-[0-9]{2})-([0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{2}\.[0-9]{6}):([^:]+)$")
        .expect("static pattern")
});

static REPLY_CURSOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{2}Z):(.+)$")
        .expect("static pattern")
});

/// Percent-encodes a cursor for embedding in a query string.
///
/// Slashes are encoded as well.
#[must_use]
pub fn urlencode(text: &str) -> String {
    urlencoding::encode(text).into_owned()
}

// === user table keys ===

/// Primary key of a user record.
#[must_use]
pub fn make_user_key(username: &str) -> PrimaryKey {
    PrimaryKey {
        pk: format!("{USER_PK_PREFIX}{username}"),
        sk: "reserved".to_string(),
    }
}

/// Primary key of a follower edge.
#[must_use]
pub fn make_follower_key(username: &str, follower_id: &str) -> PrimaryKey {
    PrimaryKey {
        pk: format!("{FOLLOWER_PK_PREFIX}{username}"),
        sk: follower_id.to_string(),
    }
}

/// Primary key of a followee edge.
#[must_use]
pub fn make_followee_key(username: &str, followee_id: &str) -> PrimaryKey {
    PrimaryKey {
        pk: format!("{FOLLOWEE_PK_PREFIX}{username}"),
        sk: followee_id.to_string(),
    }
}

/// Extracts the username from a user partition key.
pub fn parse_user_partition_key(pk: &str) -> AppResult<String> {
    pk.strip_prefix(USER_PK_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("not a user partition key: {pk}")))
}

/// Extracts the username from a follower partition key.
pub fn parse_follower_partition_key(pk: &str) -> AppResult<String> {
    pk.strip_prefix(FOLLOWER_PK_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("not a follower partition key: {pk}")))
}

/// Extracts the username from a followee partition key.
pub fn parse_followee_partition_key(pk: &str) -> AppResult<String> {
    pk.strip_prefix(FOLLOWEE_PK_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("not a followee partition key: {pk}")))
}

// === object table keys ===

/// Partition key of a user's activities in one month.
#[must_use]
pub fn make_activity_partition_key(username: &str, month: NaiveDate) -> String {
    format!(
        "{ACTIVITY_PK_PREFIX}{username}:{}",
        timefmt::format_month(month)
    )
}

/// Parses an activity partition key into `(username, month)`.
pub fn parse_activity_partition_key(pk: &str) -> AppResult<(String, NaiveDate)> {
    let caps = ACTIVITY_PK
        .captures(pk)
        .ok_or_else(|| AppError::BadRequest(format!("invalid activity partition key: {pk}")))?;
    let username = caps.get(1).map_or("", |m| m.as_str()).to_string();
    let month = timefmt::parse_month(caps.get(2).map_or("", |m| m.as_str()))?;
    Ok((username, month))
}

/// Sort key of an activity record.
#[must_use]
pub fn make_activity_sort_key(created_at: DateTime<Utc>, unique_part: &str) -> String {
    format!("{}:{unique_part}", created_at.format("%dT%H:%M:%S%.6f"))
}

/// Primary key of an activity record.
#[must_use]
pub fn make_activity_key(
    username: &str,
    created_at: DateTime<Utc>,
    unique_part: &str,
) -> PrimaryKey {
    PrimaryKey {
        pk: make_activity_partition_key(username, timefmt::month_of(created_at)),
        sk: make_activity_sort_key(created_at, unique_part),
    }
}

/// Primary key that precedes the oldest activity a user can have, given the
/// month the user record was created in.
#[must_use]
pub fn make_oldest_activity_key(username: &str, earliest_month: NaiveDate) -> PrimaryKey {
    PrimaryKey {
        pk: make_activity_partition_key(username, earliest_month),
        sk: OLDEST_ACTIVITY_SK.to_string(),
    }
}

/// Partition key of a post record and its reply edges.
#[must_use]
pub fn make_post_partition_key(username: &str, unique_part: &str) -> String {
    format!("{OBJECT_PK_PREFIX}{username}:post:{unique_part}")
}

/// Primary key of a post metadata record.
#[must_use]
pub fn make_post_key(username: &str, unique_part: &str) -> PrimaryKey {
    PrimaryKey {
        pk: make_post_partition_key(username, unique_part),
        sk: POST_METADATA_SK.to_string(),
    }
}

/// Sort key of a reply edge.
#[must_use]
pub fn make_reply_sort_key(published: &str, reply_id: &str) -> String {
    format!("{REPLY_SK_PREFIX}{published}:{reply_id}")
}

// === cursors ===

/// Serializes an activity primary key into
/// `YYYY-MM-DDTHH:MM:SS.ffffff:{uniquePart}`.
///
/// The username is dropped; the deserializer is given it back.
pub fn serialize_activity_cursor(key: &PrimaryKey) -> AppResult<String> {
    let pk_caps = ACTIVITY_PK
        .captures(&key.pk)
        .ok_or_else(|| AppError::BadRequest(format!("invalid activity key (pk): {}", key.pk)))?;
    let sk_caps = ACTIVITY_SK
        .captures(&key.sk)
        .ok_or_else(|| AppError::BadRequest(format!("invalid activity key (sk): {}", key.sk)))?;
    let year_month = pk_caps.get(2).map_or("", |m| m.as_str());
    let date_time = sk_caps.get(1).map_or("", |m| m.as_str());
    let unique_part = sk_caps.get(2).map_or("", |m| m.as_str());
    Ok(format!("{year_month}-{date_time}:{unique_part}"))
}

/// Deserializes an activity cursor back into the primary key it names,
/// scoped to `username`.
pub fn deserialize_activity_cursor(cursor: &str, username: &str) -> AppResult<PrimaryKey> {
    let caps = ACTIVITY_CURSOR
        .captures(cursor)
        .ok_or_else(|| AppError::BadRequest(format!("invalid activity cursor: {cursor}")))?;
    let year_month = caps.get(1).map_or("", |m| m.as_str());
    let date_time = caps.get(2).map_or("", |m| m.as_str());
    let unique_part = caps.get(3).map_or("", |m| m.as_str());
    Ok(PrimaryKey {
        pk: format!("{ACTIVITY_PK_PREFIX}{username}:{year_month}"),
        sk: format!("{date_time}:{unique_part}"),
    })
}

/// Serializes a reply-edge sort key into `YYYY-MM-DDTHH:MM:SSZ:{replyId}`.
pub fn serialize_reply_cursor(sort_key: &str) -> AppResult<String> {
    let cursor = sort_key
        .strip_prefix(REPLY_SK_PREFIX)
        .ok_or_else(|| AppError::BadRequest(format!("invalid reply sort key: {sort_key}")))?;
    if !REPLY_CURSOR.is_match(cursor) {
        return Err(AppError::BadRequest(format!(
            "invalid reply sort key: {sort_key}"
        )));
    }
    Ok(cursor.to_string())
}

/// Deserializes a reply cursor back into a reply-edge sort key.
///
/// The newest sentinel `~` maps to a sort key past every real reply.
pub fn deserialize_reply_cursor(cursor: &str) -> AppResult<String> {
    if cursor == NEWEST_CURSOR {
        return Ok(format!("{REPLY_SK_PREFIX}{NEWEST_CURSOR}"));
    }
    if !REPLY_CURSOR.is_match(cursor) {
        return Err(AppError::BadRequest(format!(
            "invalid reply cursor: {cursor}"
        )));
    }
    Ok(format!("{REPLY_SK_PREFIX}{cursor}"))
}
