//! The ID/URI scheme.
//!
//! Every entity this server owns is addressed below its actor URI:
//!
//! - actor: `https://{domain}/users/{username}`
//! - inbox/outbox/followers/following: `{actor}/inbox` etc.
//! - signature key: `{actor}#main-key`
//! - activity: `{actor}/activities/{uniquePart}`
//! - post: `{actor}/posts/{uniquePart}`
//! - replies collection: `{post}/replies`
//!
//! `uniquePart` is a UUID v7 in canonical textual form, so lexicographic
//! order equals creation order.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

static USER_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/users/([^/]+)").expect("static pattern"));

static OBJECT_REMAINDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/([^/]+)/([^/]+)$").expect("static pattern"));

/// Builds the actor URI of a local user.
#[must_use]
pub fn make_user_id(domain: &str, username: &str) -> String {
    format!("https://{domain}/users/{username}")
}

/// Builds the inbox URI of an actor.
#[must_use]
pub fn make_inbox_uri(user_id: &str) -> String {
    format!("{user_id}/inbox")
}

/// Builds the outbox URI of an actor.
#[must_use]
pub fn make_outbox_uri(user_id: &str) -> String {
    format!("{user_id}/outbox")
}

/// Builds the followers collection URI of an actor.
#[must_use]
pub fn make_followers_uri(user_id: &str) -> String {
    format!("{user_id}/followers")
}

/// Builds the following collection URI of an actor.
#[must_use]
pub fn make_following_uri(user_id: &str) -> String {
    format!("{user_id}/following")
}

/// Builds the signature key id of an actor.
#[must_use]
pub fn make_key_id(user_id: &str) -> String {
    format!("{user_id}#main-key")
}

/// Builds an activity URI from its owner and unique part.
#[must_use]
pub fn make_activity_id(user_id: &str, unique_part: &str) -> String {
    format!("{user_id}/activities/{unique_part}")
}

/// Builds a post URI from its owner and unique part.
#[must_use]
pub fn make_post_id(user_id: &str, unique_part: &str) -> String {
    format!("{user_id}/posts/{unique_part}")
}

/// Builds the replies collection URI of a post.
#[must_use]
pub fn make_replies_uri(post_id: &str) -> String {
    format!("{post_id}/replies")
}

/// Generates the unique part of an ID.
///
/// UUID v7 keeps generated IDs time-ordered.
#[must_use]
pub fn generate_unique_part() -> String {
    Uuid::now_v7().to_string()
}

/// Recovers the creation time embedded in a unique part.
///
/// Record sort keys derive from this rather than the wall clock, so a
/// re-run registers the same record instead of a second one.
#[must_use]
pub fn unique_part_timestamp(unique_part: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let uuid = Uuid::parse_str(unique_part).ok()?;
    let timestamp = uuid.get_timestamp()?;
    let (secs, nanos) = timestamp.to_unix();
    chrono::DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
}

/// Splits a user URI into `(domain, username, remainder)`.
///
/// `https://example.social/users/alice/followers` becomes
/// `("example.social", "alice", "/followers")`.
pub fn split_user_id(user_id: &str) -> AppResult<(String, String, String)> {
    let parsed =
        Url::parse(user_id).map_err(|e| AppError::BadRequest(format!("invalid URI: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::BadRequest(format!("no domain name: {user_id}")))?
        .to_string();
    let path = urlencoding::decode(parsed.path())
        .map_err(|e| AppError::BadRequest(format!("invalid path encoding: {e}")))?
        .into_owned();
    let (username, remainder) = split_user_path(&path)?;
    Ok((host, username, remainder))
}

/// Splits the path part of a user URI into `(username, remainder)`.
pub fn split_user_path(path: &str) -> AppResult<(String, String)> {
    let caps = USER_PATH
        .captures(path)
        .ok_or_else(|| AppError::BadRequest(format!("not a user path: {path}")))?;
    let full = caps.get(0).map_or("", |m| m.as_str());
    let username = caps.get(1).map_or("", |m| m.as_str()).to_string();
    Ok((username, path[full.len()..].to_string()))
}

/// Parses an actor URI into `(domain, username)`.
///
/// Fails unless the path is exactly `/users/{username}`; a trailing slash is
/// accepted.
pub fn parse_user_id(user_id: &str) -> AppResult<(String, String)> {
    let (domain, username, remainder) = split_user_id(user_id)?;
    if !remainder.trim_end_matches('/').is_empty() {
        return Err(AppError::BadRequest(format!("not a user ID: {user_id}")));
    }
    Ok((domain, username))
}

/// Parses a user-owned object URI into
/// `(domain, username, category, uniquePart)`.
///
/// The category is plural (`activities`, `posts`). A trailing slash is
/// accepted; extra path segments are not.
pub fn parse_user_object_id(object_id: &str) -> AppResult<(String, String, String, String)> {
    let (domain, username, remainder) = split_user_id(object_id)?;
    let remainder = remainder.trim_end_matches('/');
    let caps = OBJECT_REMAINDER
        .captures(remainder)
        .ok_or_else(|| AppError::BadRequest(format!("invalid user object ID: {object_id}")))?;
    let category = caps.get(1).map_or("", |m| m.as_str()).to_string();
    let unique_part = caps.get(2).map_or("", |m| m.as_str()).to_string();
    Ok((domain, username, category, unique_part))
}

/// Parses an activity URI into `(domain, username, uniquePart)`.
pub fn parse_activity_id(activity_id: &str) -> AppResult<(String, String, String)> {
    let (domain, username, category, unique_part) = parse_user_object_id(activity_id)?;
    if category != "activities" {
        return Err(AppError::BadRequest(format!(
            "invalid activity ID: {activity_id}"
        )));
    }
    Ok((domain, username, unique_part))
}

/// Parses a post URI into `(domain, username, uniquePart)`.
pub fn parse_post_id(post_id: &str) -> AppResult<(String, String, String)> {
    let (domain, username, category, unique_part) = parse_user_object_id(post_id)?;
    if category != "posts" {
        return Err(AppError::BadRequest(format!("invalid post ID: {post_id}")));
    }
    Ok((domain, username, unique_part))
}

/// Parses a WebFinger account like `alice@example.social` into
/// `(name, domain)`.
pub fn parse_webfinger_id(account: &str) -> AppResult<(String, String)> {
    match account.split_once('@') {
        Some((name, domain)) if !name.is_empty() && !domain.is_empty() => {
            Ok((name.to_string(), domain.to_string()))
        }
        _ => Err(AppError::BadRequest(format!(
            "WebFinger ID must be in the form \"name@domain\": {account}"
        ))),
    }
}

/// Parses an `acct:` resource URI into `(name, domain)`.
pub fn parse_acct_uri(uri: &str) -> AppResult<(String, String)> {
    let rest = uri
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::BadRequest(format!("\"acct\" URI must start with acct: {uri}")))?;
    parse_webfinger_id(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_user_id() {
        assert_eq!(
            make_user_id("example.social", "alice"),
            "https://example.social/users/alice"
        );
    }

    #[test]
    fn test_split_user_id() {
        let (domain, username, remainder) =
            split_user_id("https://example.social/users/alice").unwrap();
        assert_eq!(domain, "example.social");
        assert_eq!(username, "alice");
        assert_eq!(remainder, "");

        let (_, _, remainder) =
            split_user_id("https://example.social/users/alice/activities/abc").unwrap();
        assert_eq!(remainder, "/activities/abc");
    }

    #[test]
    fn test_split_user_id_rejects_non_user_path() {
        assert!(split_user_id("https://example.social/channels/alice").is_err());
        assert!(split_user_id("urn:uuid:not-a-user").is_err());
    }

    #[test]
    fn test_parse_user_id() {
        let (domain, username) = parse_user_id("https://example.social/users/alice").unwrap();
        assert_eq!(domain, "example.social");
        assert_eq!(username, "alice");
        // trailing slash tolerated
        assert!(parse_user_id("https://example.social/users/alice/").is_ok());
        // extra segments rejected
        assert!(parse_user_id("https://example.social/users/alice/inbox").is_err());
    }

    #[test]
    fn test_parse_activity_id() {
        let id = "https://example.social/users/alice/activities/0188-abc";
        let (domain, username, unique) = parse_activity_id(id).unwrap();
        assert_eq!(domain, "example.social");
        assert_eq!(username, "alice");
        assert_eq!(unique, "0188-abc");

        assert!(parse_activity_id("https://example.social/users/alice/posts/0188-abc").is_err());
        assert!(
            parse_activity_id("https://example.social/users/alice/activities/a/b").is_err()
        );
    }

    #[test]
    fn test_parse_post_id_round_trip() {
        let user = make_user_id("example.social", "alice");
        let unique = generate_unique_part();
        let post = make_post_id(&user, &unique);
        let (domain, username, parsed_unique) = parse_post_id(&post).unwrap();
        assert_eq!(domain, "example.social");
        assert_eq!(username, "alice");
        assert_eq!(parsed_unique, unique);
    }

    #[test]
    fn test_parse_post_id_accepts_trailing_slash() {
        let (_, _, unique) =
            parse_post_id("https://example.social/users/alice/posts/xyz/").unwrap();
        assert_eq!(unique, "xyz");
    }

    #[test]
    fn test_generate_unique_part_is_ordered() {
        let a = generate_unique_part();
        let b = generate_unique_part();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_unique_part_timestamp() {
        let before = chrono::Utc::now() - chrono::Duration::seconds(1);
        let unique = generate_unique_part();
        let after = chrono::Utc::now() + chrono::Duration::seconds(1);
        let embedded = unique_part_timestamp(&unique).unwrap();
        assert!(embedded >= before && embedded <= after);
        // Stable across calls.
        assert_eq!(unique_part_timestamp(&unique).unwrap(), embedded);
        assert!(unique_part_timestamp("not-a-uuid").is_none());
    }

    #[test]
    fn test_parse_acct_uri() {
        let (name, domain) = parse_acct_uri("acct:alice@example.social").unwrap();
        assert_eq!(name, "alice");
        assert_eq!(domain, "example.social");
        assert!(parse_acct_uri("alice@example.social").is_err());
        assert!(parse_acct_uri("acct:alice").is_err());
    }

    #[test]
    fn test_collection_uris() {
        let user = make_user_id("example.social", "alice");
        assert_eq!(make_inbox_uri(&user), "https://example.social/users/alice/inbox");
        assert_eq!(make_key_id(&user), "https://example.social/users/alice#main-key");
        let post = make_post_id(&user, "p1");
        assert_eq!(
            make_replies_uri(&post),
            "https://example.social/users/alice/posts/p1/replies"
        );
    }
}
