//! The user index: user records and follower/followee edges.
//!
//! Edge writes are guarded by conditional expressions and are idempotent;
//! they never touch the derived counters, which belong to the statistics
//! maintainer.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quill_common::cursor::{
    make_followee_key, make_follower_key, make_user_key, parse_user_partition_key, PrimaryKey,
};
use quill_common::ids::{
    generate_unique_part, make_followers_uri, make_following_uri, make_inbox_uri, make_key_id,
    make_outbox_uri, make_user_id, parse_user_id,
};
use quill_common::{timefmt, AppError, AppResult};
use quill_store::objects::make_staging_outbox_key;
use quill_store::{Item, KeyValueStore, KvError, Query, UpdateAction, WriteCondition};
use quill_vocab::Activity;
use serde_json::Value;

/// A user record.
#[derive(Debug, Clone)]
pub struct User {
    pub domain: String,
    pub username: String,
    pub name: String,
    pub preferred_username: String,
    pub summary: String,
    pub url: String,
    /// PEM representation of the public key.
    pub public_key_pem: String,
    /// Opaque reference to the private key in the parameter store.
    pub private_key_path: String,
    pub follower_count: i64,
    pub following_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

fn string_field(item: &Item, name: &str) -> AppResult<String> {
    item.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Corrupted(format!("user item is missing {name}")))
}

impl User {
    /// Parses a user-table item.
    pub fn parse_item(item: &Item, domain: &str) -> AppResult<Self> {
        let pk = string_field(item, "pk")?;
        let username = parse_user_partition_key(&pk)
            .map_err(|e| AppError::Corrupted(format!("invalid user item: {e}")))?;
        let created_at = timefmt::parse_micros(&string_field(item, "createdAt")?)
            .map_err(|e| AppError::Corrupted(format!("invalid user item: {e}")))?;
        let updated_at = timefmt::parse_micros(&string_field(item, "updatedAt")?)
            .map_err(|e| AppError::Corrupted(format!("invalid user item: {e}")))?;
        let last_activity_at = match item.get("lastActivityAt").and_then(Value::as_str) {
            Some(text) => timefmt::parse_micros(text)
                .map_err(|e| AppError::Corrupted(format!("invalid user item: {e}")))?,
            None => updated_at,
        };
        Ok(Self {
            domain: domain.to_string(),
            username,
            name: string_field(item, "name")?,
            preferred_username: string_field(item, "preferredUsername")?,
            summary: string_field(item, "summary")?,
            url: string_field(item, "url")?,
            public_key_pem: string_field(item, "publicKeyPem")?,
            private_key_path: string_field(item, "privateKeyPath")?,
            follower_count: item.get("followerCount").and_then(Value::as_i64).unwrap_or(0),
            following_count: item.get("followingCount").and_then(Value::as_i64).unwrap_or(0),
            created_at,
            updated_at,
            last_activity_at,
        })
    }

    /// Serializes this record into a user-table item.
    #[must_use]
    pub fn to_item(&self) -> Item {
        let key = make_user_key(&self.username);
        let mut item = Item::new();
        item.insert("pk".to_string(), Value::String(key.pk));
        item.insert("sk".to_string(), Value::String(key.sk));
        item.insert("name".to_string(), Value::String(self.name.clone()));
        item.insert(
            "preferredUsername".to_string(),
            Value::String(self.preferred_username.clone()),
        );
        item.insert("summary".to_string(), Value::String(self.summary.clone()));
        item.insert("url".to_string(), Value::String(self.url.clone()));
        item.insert(
            "publicKeyPem".to_string(),
            Value::String(self.public_key_pem.clone()),
        );
        item.insert(
            "privateKeyPath".to_string(),
            Value::String(self.private_key_path.clone()),
        );
        item.insert("followerCount".to_string(), Value::from(self.follower_count));
        item.insert("followingCount".to_string(), Value::from(self.following_count));
        item.insert(
            "createdAt".to_string(),
            Value::String(timefmt::format_micros(self.created_at)),
        );
        item.insert(
            "updatedAt".to_string(),
            Value::String(timefmt::format_micros(self.updated_at)),
        );
        item.insert(
            "lastActivityAt".to_string(),
            Value::String(timefmt::format_micros(self.last_activity_at)),
        );
        item
    }

    /// ID (actor URI) of the user.
    #[must_use]
    pub fn id(&self) -> String {
        make_user_id(&self.domain, &self.username)
    }

    /// URI of the inbox.
    #[must_use]
    pub fn inbox_uri(&self) -> String {
        make_inbox_uri(&self.id())
    }

    /// URI of the outbox.
    #[must_use]
    pub fn outbox_uri(&self) -> String {
        make_outbox_uri(&self.id())
    }

    /// URI of the followers collection.
    #[must_use]
    pub fn followers_uri(&self) -> String {
        make_followers_uri(&self.id())
    }

    /// URI of the following collection.
    #[must_use]
    pub fn following_uri(&self) -> String {
        make_following_uri(&self.id())
    }

    /// ID of the user's signature key.
    #[must_use]
    pub fn key_id(&self) -> String {
        make_key_id(&self.id())
    }

    /// The public key as carried in the actor document.
    #[must_use]
    pub fn public_key_value(&self) -> Value {
        serde_json::json!({
            "id": self.key_id(),
            "owner": self.id(),
            "publicKeyPem": self.public_key_pem,
        })
    }

    /// Generates a fresh activity ID owned by this user.
    #[must_use]
    pub fn generate_activity_id(&self) -> String {
        quill_common::ids::make_activity_id(&self.id(), &generate_unique_part())
    }

    /// Generates a fresh post ID owned by this user.
    #[must_use]
    pub fn generate_post_id(&self) -> String {
        quill_common::ids::make_post_id(&self.id(), &generate_unique_part())
    }

    /// Generates a fresh staging-outbox blob key for this user.
    #[must_use]
    pub fn generate_staging_outbox_key(&self) -> String {
        make_staging_outbox_key(&self.username, &generate_unique_part())
    }
}

/// Access to the user table.
#[derive(Clone)]
pub struct UserIndex {
    kv: Arc<dyn KeyValueStore>,
    table: String,
}

impl UserIndex {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, table: impl Into<String>) -> Self {
        Self {
            kv,
            table: table.into(),
        }
    }

    /// Finds the user associated with a username.
    pub async fn find_user_by_username(
        &self,
        username: &str,
        domain: &str,
    ) -> AppResult<Option<User>> {
        let key = make_user_key(username);
        let item = self
            .kv
            .get_item(&self.table, &key)
            .await
            .map_err(KvError::into_app)?;
        match item {
            None => Ok(None),
            Some(item) => User::parse_item(&item, domain)
                .map(Some)
                .map_err(|e| AppError::Corrupted(format!("invalid user data \"{username}\": {e}"))),
        }
    }

    /// Writes a user record. Used at bootstrap and in tests.
    pub async fn put_user(&self, user: &User) -> AppResult<()> {
        self.kv
            .put_item(&self.table, user.to_item(), None)
            .await
            .map_err(KvError::into_app)
    }

    /// Records that a remote actor follows a local user.
    ///
    /// The insert is conditional on the edge not existing; a duplicate
    /// `Follow` is logged and succeeds without further effect. Counters are
    /// not touched here.
    pub async fn add_user_follower(&self, username: &str, follow: &Activity) -> AppResult<()> {
        let followed_id = follow.followed_id()?;
        let (_, followed_username) = parse_user_id(followed_id)?;
        if followed_username != username {
            return Err(AppError::BadRequest(format!(
                "follow request in wrong inbox: {followed_id}, inbox={username}"
            )));
        }
        let follow_id = follow
            .id()
            .ok_or_else(|| AppError::BadRequest("follow activity has no id".to_string()))?;
        let key = make_follower_key(username, follow.actor_id());
        let now = timefmt::now_micros();
        let mut item = Item::new();
        item.insert("pk".to_string(), Value::String(key.pk.clone()));
        item.insert("sk".to_string(), Value::String(key.sk.clone()));
        item.insert("createdAt".to_string(), Value::String(now.clone()));
        item.insert("updatedAt".to_string(), Value::String(now));
        item.insert(
            "followerId".to_string(),
            Value::String(follow.actor_id().to_string()),
        );
        item.insert(
            "followActivityId".to_string(),
            Value::String(follow_id.to_string()),
        );
        tracing::debug!(username = %username, follower = %follow.actor_id(), "putting follower");
        match self
            .kv
            .put_item(&self.table, item, Some(WriteCondition::KeyNotExists))
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => {
                tracing::debug!(follower = %follow.actor_id(), "existing follower");
                Ok(())
            }
            Err(err) => Err(err.into_app()),
        }
    }

    /// Removes a follower edge in response to an undone `Follow`.
    ///
    /// Removal of an absent edge is logged and succeeds.
    pub async fn remove_user_follower(&self, username: &str, follow: &Activity) -> AppResult<()> {
        let followed_id = follow.followed_id()?;
        let (_, followed_username) = parse_user_id(followed_id)?;
        if followed_username != username {
            return Err(AppError::BadRequest(format!(
                "unfollow request in wrong inbox: {followed_id}, inbox={username}"
            )));
        }
        let key = make_follower_key(username, follow.actor_id());
        tracing::debug!(username = %username, follower = %follow.actor_id(), "removing follower");
        match self
            .kv
            .delete_item(&self.table, &key, Some(WriteCondition::KeyExists))
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => {
                tracing::debug!(follower = %follow.actor_id(), "no such follower");
                Ok(())
            }
            Err(err) => Err(err.into_app()),
        }
    }

    /// Records that a local user follows a remote actor.
    pub async fn add_user_followee(
        &self,
        username: &str,
        followee_id: &str,
        follow_activity_id: &str,
    ) -> AppResult<()> {
        let key = make_followee_key(username, followee_id);
        let now = timefmt::now_micros();
        let mut item = Item::new();
        item.insert("pk".to_string(), Value::String(key.pk.clone()));
        item.insert("sk".to_string(), Value::String(key.sk.clone()));
        item.insert("createdAt".to_string(), Value::String(now.clone()));
        item.insert("updatedAt".to_string(), Value::String(now));
        item.insert("followeeId".to_string(), Value::String(followee_id.to_string()));
        item.insert(
            "followActivityId".to_string(),
            Value::String(follow_activity_id.to_string()),
        );
        tracing::debug!(username = %username, followee = %followee_id, "putting followee");
        match self
            .kv
            .put_item(&self.table, item, Some(WriteCondition::KeyNotExists))
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => {
                tracing::debug!(followee = %followee_id, "existing followee");
                Ok(())
            }
            Err(err) => Err(err.into_app()),
        }
    }

    /// Removes a followee edge.
    pub async fn remove_user_followee(&self, username: &str, followee_id: &str) -> AppResult<()> {
        let key = make_followee_key(username, followee_id);
        tracing::debug!(username = %username, followee = %followee_id, "removing followee");
        match self
            .kv
            .delete_item(&self.table, &key, Some(WriteCondition::KeyExists))
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => {
                tracing::debug!(followee = %followee_id, "no such followee");
                Ok(())
            }
            Err(err) => Err(err.into_app()),
        }
    }

    /// Lazily enumerates follower actor IDs.
    pub fn enumerate_followers(
        &self,
        username: &str,
        items_per_query: usize,
        after: Option<String>,
        before: Option<String>,
    ) -> AppResult<EdgeWalk> {
        EdgeWalk::new(
            self.kv.clone(),
            self.table.clone(),
            format!("{}{username}", quill_common::cursor::FOLLOWER_PK_PREFIX),
            items_per_query,
            after,
            before,
        )
    }

    /// Lazily enumerates followee actor IDs.
    pub fn enumerate_followees(
        &self,
        username: &str,
        items_per_query: usize,
        after: Option<String>,
        before: Option<String>,
    ) -> AppResult<EdgeWalk> {
        EdgeWalk::new(
            self.kv.clone(),
            self.table.clone(),
            format!("{}{username}", quill_common::cursor::FOLLOWEE_PK_PREFIX),
            items_per_query,
            after,
            before,
        )
    }

    /// Stamps the user's last-activity time.
    ///
    /// Fails with `NotFound` when no such user exists.
    pub async fn update_last_activity(&self, username: &str) -> AppResult<()> {
        let now = timefmt::now_micros();
        let action = UpdateAction {
            set: vec![
                ("lastActivityAt".to_string(), Value::String(now.clone())),
                ("updatedAt".to_string(), Value::String(now)),
            ],
            add: Vec::new(),
        };
        match self
            .kv
            .update_item(
                &self.table,
                &make_user_key(username),
                action,
                Some(WriteCondition::KeyExists),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => {
                Err(AppError::NotFound(format!("no such user: {username}")))
            }
            Err(err) => Err(err.into_app()),
        }
    }
}

/// A lazy walk over one edge partition.
///
/// Pages are pulled on demand with the store's exclusive-start-key
/// continuation. On a `before` walk the store scans backward and each page is
/// emitted in reverse, so callers read an ascending run that ends just short
/// of the bound.
pub struct EdgeWalk {
    kv: Arc<dyn KeyValueStore>,
    table: String,
    pk: String,
    items_per_query: usize,
    scan_forward: bool,
    reverse_pages: bool,
    exclusive_start: Option<PrimaryKey>,
    buffer: VecDeque<String>,
    exhausted: bool,
}

impl EdgeWalk {
    fn new(
        kv: Arc<dyn KeyValueStore>,
        table: String,
        pk: String,
        items_per_query: usize,
        after: Option<String>,
        before: Option<String>,
    ) -> AppResult<Self> {
        if after.is_some() && before.is_some() {
            return Err(AppError::BadRequest(
                "both of after and before are specified".to_string(),
            ));
        }
        let (scan_forward, reverse_pages, bound) = match (after, before) {
            (Some(after), None) => (true, false, Some(after)),
            (None, Some(before)) => (false, true, Some(before)),
            _ => (true, false, None),
        };
        Ok(Self {
            kv,
            table,
            exclusive_start: bound.map(|sk| PrimaryKey {
                pk: pk.clone(),
                sk,
            }),
            pk,
            items_per_query,
            scan_forward,
            reverse_pages,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// The next edge sort key, or `None` once the partition is exhausted.
    pub async fn next(&mut self) -> AppResult<Option<String>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self
                .kv
                .query(
                    &self.table,
                    Query {
                        pk: self.pk.clone(),
                        sk_begins_with: None,
                        require_true: None,
                        scan_forward: self.scan_forward,
                        limit: self.items_per_query,
                        exclusive_start_key: self.exclusive_start.clone(),
                    },
                )
                .await
                .map_err(KvError::into_app)?;
            let mut ids: Vec<String> = page
                .items
                .iter()
                .filter_map(|item| item.get("sk").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if self.reverse_pages {
                ids.reverse();
            }
            self.buffer.extend(ids);
            match page.last_evaluated_key {
                Some(key) => self.exclusive_start = Some(key),
                None => self.exhausted = true,
            }
        }
    }

    /// Pulls up to `n` items.
    pub async fn take(&mut self, n: usize) -> AppResult<Vec<String>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next().await? {
                Some(item) => out.push(item),
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_store::MemoryKeyValueStore;
    use serde_json::json;

    fn follow(actor: &str, object: &str, id: &str) -> Activity {
        Activity::parse(json!({
            "id": id,
            "type": "Follow",
            "actor": actor,
            "object": object,
        }))
        .unwrap()
    }

    fn sample_user(username: &str) -> User {
        let now = Utc::now();
        User {
            domain: "example.social".to_string(),
            username: username.to_string(),
            name: "Alice".to_string(),
            preferred_username: username.to_string(),
            summary: String::new(),
            url: format!("https://example.social/@{username}"),
            public_key_pem: "-----BEGIN PUBLIC KEY-----".to_string(),
            private_key_path: format!("/quill/users/{username}/private-key"),
            follower_count: 0,
            following_count: 0,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    fn index() -> (Arc<MemoryKeyValueStore>, UserIndex) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let index = UserIndex::new(kv.clone(), "users");
        (kv, index)
    }

    #[tokio::test]
    async fn test_user_round_trip() {
        let (_, index) = index();
        let user = sample_user("alice");
        index.put_user(&user).await.unwrap();
        let found = index
            .find_user_by_username("alice", "example.social")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), "https://example.social/users/alice");
        assert_eq!(found.key_id(), "https://example.social/users/alice#main-key");
        assert!(index
            .find_user_by_username("nobody", "example.social")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_add_follower_is_idempotent() {
        let (kv, index) = index();
        let follow = follow(
            "https://r.example/users/bob",
            "https://example.social/users/alice",
            "https://r.example/activities/1",
        );
        index.add_user_follower("alice", &follow).await.unwrap();
        // Same Follow again: logged and dropped, and no second stream event.
        index.add_user_follower("alice", &follow).await.unwrap();
        let inserts = kv
            .drain_events("users")
            .into_iter()
            .filter(|e| e.event == quill_store::StreamEventKind::Insert)
            .count();
        assert_eq!(inserts, 1);
    }

    #[tokio::test]
    async fn test_add_follower_rejects_wrong_inbox() {
        let (_, index) = index();
        let follow = follow(
            "https://r.example/users/bob",
            "https://example.social/users/carol",
            "https://r.example/activities/1",
        );
        let err = index.add_user_follower("alice", &follow).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_remove_follower_tolerates_absence() {
        let (_, index) = index();
        let follow = follow(
            "https://r.example/users/bob",
            "https://example.social/users/alice",
            "https://r.example/activities/1",
        );
        index.remove_user_follower("alice", &follow).await.unwrap();
        index.add_user_follower("alice", &follow).await.unwrap();
        index.remove_user_follower("alice", &follow).await.unwrap();
    }

    #[tokio::test]
    async fn test_enumerate_followers_pages() {
        let (_, index) = index();
        for i in 0..5 {
            let follow = follow(
                &format!("https://r.example/users/u{i}"),
                "https://example.social/users/alice",
                &format!("https://r.example/activities/{i}"),
            );
            index.add_user_follower("alice", &follow).await.unwrap();
        }

        let mut walk = index.enumerate_followers("alice", 2, None, None).unwrap();
        let all = walk.take(10).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0] < w[1]));

        let mut walk = index
            .enumerate_followers("alice", 2, Some(all[2].clone()), None)
            .unwrap();
        assert_eq!(walk.take(10).await.unwrap(), &all[3..]);

        // A before walk emits an ascending run ending just short of the bound.
        let mut walk = index
            .enumerate_followers("alice", 2, None, Some(all[2].clone()))
            .unwrap();
        assert_eq!(walk.take(2).await.unwrap(), &all[..2]);

        // "~" bounds past every real id.
        let mut walk = index
            .enumerate_followers("alice", 5, None, Some("~".to_string()))
            .unwrap();
        assert_eq!(walk.take(10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_enumerate_rejects_both_cursors() {
        let (_, index) = index();
        assert!(index
            .enumerate_followers("alice", 2, Some("a".into()), Some("b".into()))
            .is_err());
    }

    #[tokio::test]
    async fn test_update_last_activity() {
        let (_, index) = index();
        let err = index.update_last_activity("alice").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        index.put_user(&sample_user("alice")).await.unwrap();
        index.update_last_activity("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_followee_edges() {
        let (_, index) = index();
        index
            .add_user_followee(
                "alice",
                "https://r.example/users/bob",
                "https://example.social/users/alice/activities/f1",
            )
            .await
            .unwrap();
        let mut walk = index.enumerate_followees("alice", 10, None, None).unwrap();
        assert_eq!(
            walk.take(10).await.unwrap(),
            vec!["https://r.example/users/bob".to_string()]
        );
        index
            .remove_user_followee("alice", "https://r.example/users/bob")
            .await
            .unwrap();
        let mut walk = index.enumerate_followees("alice", 10, None, None).unwrap();
        assert!(walk.take(10).await.unwrap().is_empty());
    }
}
