//! The object index: activity history in monthly partitions, post metadata,
//! and reply edges.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use quill_common::cursor::{
    make_activity_partition_key, make_activity_sort_key, make_post_key, make_post_partition_key,
    make_reply_sort_key, parse_activity_partition_key, serialize_reply_cursor, PrimaryKey,
    REPLY_SK_PREFIX,
};
use quill_common::ids::{make_replies_uri, parse_activity_id, parse_post_id};
use quill_common::{timefmt, AppError, AppResult};
use quill_store::objects::{make_outbox_key, make_post_object_key};
use quill_store::{Item, KeyValueStore, KvError, ObjectStorage, Query, WriteCondition};
use quill_vocab::{Activity, ApObject, Note};
use serde_json::Value;

use crate::user::User;

/// Metadata of one activity in a user's history.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub pk: String,
    pub sk: String,
    pub id: String,
    pub activity_type: String,
    pub username: String,
    pub published: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub is_public: bool,
}

fn string_field(item: &Item, name: &str) -> AppResult<String> {
    item.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Corrupted(format!("item is missing {name}")))
}

impl ActivityRecord {
    /// Parses an object-table item into an activity record.
    pub fn parse_item(item: &Item) -> AppResult<Self> {
        Ok(Self {
            pk: string_field(item, "pk")?,
            sk: string_field(item, "sk")?,
            id: string_field(item, "id")?,
            activity_type: string_field(item, "type")?,
            username: string_field(item, "username")?,
            published: timefmt::parse_seconds(&string_field(item, "published")?)
                .map_err(|e| AppError::Corrupted(e.to_string()))?,
            created_at: timefmt::parse_micros(&string_field(item, "createdAt")?)
                .map_err(|e| AppError::Corrupted(e.to_string()))?,
            is_public: item.get("isPublic").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    /// The record's primary key.
    #[must_use]
    pub fn primary_key(&self) -> PrimaryKey {
        PrimaryKey {
            pk: self.pk.clone(),
            sk: self.sk.clone(),
        }
    }

    /// Unique part of the activity ID.
    pub fn unique_part(&self) -> AppResult<String> {
        let (_, _, unique_part) = parse_activity_id(&self.id)?;
        Ok(unique_part)
    }

    /// Loads the activity document this record points at.
    pub async fn resolve(&self, storage: &ObjectStorage) -> AppResult<Activity> {
        let key = make_outbox_key(&self.username, &self.unique_part()?);
        storage.load_activity(&key).await
    }
}

/// Metadata of one post.
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub username: String,
    pub unique_part: String,
    pub id: String,
    pub published: Option<DateTime<Utc>>,
    pub is_public: bool,
    pub reply_count: i64,
}

impl PostRecord {
    /// Parses an object-table item into a post record.
    pub fn parse_item(item: &Item, username: &str, unique_part: &str) -> AppResult<Self> {
        let published = match item.get("published").and_then(Value::as_str) {
            Some(text) => Some(
                timefmt::parse_seconds(text).map_err(|e| AppError::Corrupted(e.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            username: username.to_string(),
            unique_part: unique_part.to_string(),
            id: string_field(item, "id")?,
            published,
            is_public: item.get("isPublic").and_then(Value::as_bool).unwrap_or(false),
            reply_count: item.get("replyCount").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    /// URI of the post's replies collection.
    #[must_use]
    pub fn replies_uri(&self) -> String {
        make_replies_uri(&self.id)
    }

    /// Loads the post document this record points at.
    pub async fn resolve(&self, storage: &ObjectStorage) -> AppResult<ApObject> {
        let key = make_post_object_key(&self.username, &self.unique_part);
        storage.load_object(&key).await
    }
}

/// One reply edge under a post's partition.
#[derive(Debug, Clone)]
pub struct ReplyRecord {
    pub sort_key: String,
    pub reply_id: String,
    pub published: String,
}

impl ReplyRecord {
    fn parse_item(item: &Item) -> AppResult<Self> {
        Ok(Self {
            sort_key: string_field(item, "sk")?,
            reply_id: string_field(item, "id")?,
            published: string_field(item, "published")?,
        })
    }

    /// The reply's serialized pagination cursor.
    pub fn serialized_cursor(&self) -> AppResult<String> {
        serialize_reply_cursor(&self.sort_key)
    }
}

/// Access to the object table.
#[derive(Clone)]
pub struct ObjectIndex {
    kv: Arc<dyn KeyValueStore>,
    table: String,
}

impl ObjectIndex {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, table: impl Into<String>) -> Self {
        Self {
            kv,
            table: table.into(),
        }
    }

    /// Registers a translated activity in its owner's history.
    ///
    /// Fails with `Duplicate` when the record already exists.
    pub async fn put_activity(&self, activity: &Activity) -> AppResult<()> {
        let id = activity
            .id()
            .ok_or_else(|| AppError::BadRequest("activity has no id".to_string()))?;
        let (_, username, unique_part) = parse_activity_id(id)?;
        // The creation time comes from the unique part so a re-run lands on
        // the same sort key and trips the conditional write.
        let created_at =
            quill_common::ids::unique_part_timestamp(&unique_part).unwrap_or_else(Utc::now);
        let published = activity
            .published()
            .map(str::to_string)
            .unwrap_or_else(timefmt::now_seconds);
        let pk = make_activity_partition_key(&username, timefmt::month_of(created_at));
        let sk = make_activity_sort_key(created_at, &unique_part);
        let now = timefmt::format_micros(created_at);

        let mut item = Item::new();
        item.insert("pk".to_string(), Value::String(pk));
        item.insert("sk".to_string(), Value::String(sk));
        item.insert("id".to_string(), Value::String(id.to_string()));
        item.insert(
            "type".to_string(),
            Value::String(activity.type_name().to_string()),
        );
        item.insert("username".to_string(), Value::String(username));
        item.insert("published".to_string(), Value::String(published));
        item.insert("createdAt".to_string(), Value::String(now.clone()));
        item.insert("updatedAt".to_string(), Value::String(now));
        item.insert("isPublic".to_string(), Value::Bool(activity.is_public()));

        match self
            .kv
            .put_item(&self.table, item, Some(WriteCondition::KeyNotExists))
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => {
                Err(AppError::Duplicate(format!("activity already exists: {id}")))
            }
            Err(err) => Err(err.into_app()),
        }
    }

    /// Registers a completed post.
    ///
    /// Fails with `Duplicate` when the record already exists.
    pub async fn put_post(&self, note: &Note) -> AppResult<()> {
        let id = note
            .id()
            .ok_or_else(|| AppError::BadRequest("note has no id".to_string()))?;
        let (_, username, unique_part) = parse_post_id(id)?;
        let key = make_post_key(&username, &unique_part);
        let now = timefmt::now_micros();

        let mut item = Item::new();
        item.insert("pk".to_string(), Value::String(key.pk));
        item.insert("sk".to_string(), Value::String(key.sk));
        item.insert("id".to_string(), Value::String(id.to_string()));
        item.insert("type".to_string(), Value::String("Note".to_string()));
        if let Some(published) = note.published() {
            item.insert("published".to_string(), Value::String(published.to_string()));
        }
        item.insert("createdAt".to_string(), Value::String(now.clone()));
        item.insert("updatedAt".to_string(), Value::String(now));
        item.insert("isPublic".to_string(), Value::Bool(note.is_public()));
        item.insert("replyCount".to_string(), Value::from(0));

        match self
            .kv
            .put_item(&self.table, item, Some(WriteCondition::KeyNotExists))
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => {
                Err(AppError::Duplicate(format!("post already exists: {id}")))
            }
            Err(err) => Err(err.into_app()),
        }
    }

    /// Looks up a post's metadata.
    pub async fn find_user_post(
        &self,
        username: &str,
        unique_part: &str,
    ) -> AppResult<Option<PostRecord>> {
        let key = make_post_key(username, unique_part);
        let item = self
            .kv
            .get_item(&self.table, &key)
            .await
            .map_err(KvError::into_app)?;
        match item {
            None => Ok(None),
            Some(item) => PostRecord::parse_item(&item, username, unique_part).map(Some),
        }
    }

    /// Records a reply under its parent post's partition.
    ///
    /// Fails with `Duplicate` when the same reply is already recorded.
    pub async fn add_reply_to_post(
        &self,
        username: &str,
        unique_part: &str,
        reply: &ApObject,
    ) -> AppResult<()> {
        let reply_id = reply.require_id()?;
        let published = reply
            .published()
            .ok_or_else(|| AppError::BadRequest("reply has no published time".to_string()))?;
        let published = normalize_published(published)?;
        let pk = make_post_partition_key(username, unique_part);
        let sk = make_reply_sort_key(&published, reply_id);
        let now = timefmt::now_micros();

        let mut item = Item::new();
        item.insert("pk".to_string(), Value::String(pk));
        item.insert("sk".to_string(), Value::String(sk));
        item.insert("id".to_string(), Value::String(reply_id.to_string()));
        item.insert("published".to_string(), Value::String(published));
        item.insert("createdAt".to_string(), Value::String(now.clone()));
        item.insert("updatedAt".to_string(), Value::String(now));

        tracing::debug!(username = %username, post = %unique_part, reply = %reply_id, "adding reply");
        match self
            .kv
            .put_item(&self.table, item, Some(WriteCondition::KeyNotExists))
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => Err(AppError::Duplicate(format!(
                "reply already recorded: {reply_id}"
            ))),
            Err(err) => Err(err.into_app()),
        }
    }

    /// Lazily enumerates a user's public activities across monthly
    /// partitions.
    ///
    /// Chronological when `after` is given, reverse-chronological otherwise.
    /// The walk starts at the month the cursor names (or the latest month)
    /// and keeps its direction across months; each subsequent month is
    /// scanned from its extreme end.
    pub fn enumerate_user_activities(
        &self,
        user: &User,
        items_per_query: usize,
        before: Option<PrimaryKey>,
        after: Option<PrimaryKey>,
    ) -> AppResult<ActivityWalk> {
        ActivityWalk::new(
            self.kv.clone(),
            self.table.clone(),
            user,
            items_per_query,
            before,
            after,
        )
    }

    /// Lazily enumerates replies to a post, reverse-chronological.
    ///
    /// On an `after` walk the store scans forward and each page is emitted in
    /// reverse, so the caller still reads newest-first runs.
    pub fn enumerate_replies(
        &self,
        username: &str,
        unique_part: &str,
        items_per_query: usize,
        before: Option<String>,
        after: Option<String>,
    ) -> AppResult<ReplyWalk> {
        ReplyWalk::new(
            self.kv.clone(),
            self.table.clone(),
            make_post_partition_key(username, unique_part),
            items_per_query,
            before,
            after,
        )
    }
}

/// Accepts both the second-precision wire form and RFC 3339 and normalizes
/// to the second-precision form reply keys use.
fn normalize_published(text: &str) -> AppResult<String> {
    if let Ok(time) = timefmt::parse_seconds(text) {
        return Ok(timefmt::format_seconds(time));
    }
    let time = DateTime::parse_from_rfc3339(text)
        .map_err(|e| AppError::BadRequest(format!("invalid published time {text:?}: {e}")))?;
    Ok(timefmt::format_seconds(time.with_timezone(&Utc)))
}

/// A lazy walk over a user's monthly activity partitions.
pub struct ActivityWalk {
    kv: Arc<dyn KeyValueStore>,
    table: String,
    username: String,
    items_per_query: usize,
    chronological: bool,
    earliest_month: NaiveDate,
    latest_month: NaiveDate,
    current_month: Option<NaiveDate>,
    exclusive_start: Option<PrimaryKey>,
    buffer: VecDeque<ActivityRecord>,
    month_done: bool,
}

impl ActivityWalk {
    fn new(
        kv: Arc<dyn KeyValueStore>,
        table: String,
        user: &User,
        items_per_query: usize,
        before: Option<PrimaryKey>,
        after: Option<PrimaryKey>,
    ) -> AppResult<Self> {
        if before.is_some() && after.is_some() {
            return Err(AppError::BadRequest(
                "both of before and after are specified".to_string(),
            ));
        }
        let earliest_month = timefmt::month_of(user.created_at);
        let latest_month = timefmt::month_of(user.last_activity_at);
        tracing::debug!(
            earliest = %earliest_month,
            latest = %latest_month,
            "activity query range"
        );
        let check_user = |key: &PrimaryKey| -> AppResult<NaiveDate> {
            let (username, month) = parse_activity_partition_key(&key.pk)?;
            if username != user.username {
                return Err(AppError::BadRequest(format!(
                    "cursor is for different user: {} vs {username}",
                    user.username
                )));
            }
            Ok(month)
        };
        let (chronological, start_month, bound) = match (&before, &after) {
            (Some(before), None) => (false, check_user(before)?, Some(before.clone())),
            (None, Some(after)) => (true, check_user(after)?, Some(after.clone())),
            _ => (false, latest_month, None),
        };
        Ok(Self {
            kv,
            table,
            username: user.username.clone(),
            items_per_query,
            chronological,
            earliest_month,
            latest_month,
            current_month: Some(start_month),
            exclusive_start: bound,
            buffer: VecDeque::new(),
            month_done: false,
        })
    }

    /// Whether a month is still inside the walk's range. Only the bound in
    /// the walk's direction matters: a cursor may name a month past the
    /// other end.
    fn in_range(&self, month: NaiveDate) -> bool {
        if self.chronological {
            month <= self.latest_month
        } else {
            month >= self.earliest_month
        }
    }

    fn advance_month(&mut self) {
        // Cursors are meaningless past the month they name.
        self.exclusive_start = None;
        self.month_done = false;
        self.current_month = self.current_month.map(|month| {
            if self.chronological {
                timefmt::next_month(month)
            } else {
                timefmt::previous_month(month)
            }
        });
    }

    /// The next public activity record, or `None` when the earliest or
    /// latest month has been crossed.
    pub async fn next(&mut self) -> AppResult<Option<ActivityRecord>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            if self.month_done {
                self.advance_month();
            }
            let Some(month) = self.current_month else {
                return Ok(None);
            };
            if !self.in_range(month) {
                return Ok(None);
            }
            let page = self
                .kv
                .query(
                    &self.table,
                    Query {
                        pk: make_activity_partition_key(&self.username, month),
                        sk_begins_with: None,
                        require_true: Some("isPublic".to_string()),
                        scan_forward: self.chronological,
                        limit: self.items_per_query,
                        exclusive_start_key: self.exclusive_start.clone(),
                    },
                )
                .await
                .map_err(KvError::into_app)?;
            for item in &page.items {
                self.buffer.push_back(ActivityRecord::parse_item(item)?);
            }
            match page.last_evaluated_key {
                Some(key) => self.exclusive_start = Some(key),
                // Empty pages do not end the walk; the next month is scanned
                // from its extreme end.
                None => self.month_done = true,
            }
        }
    }

    /// Pulls up to `n` records.
    pub async fn take(&mut self, n: usize) -> AppResult<Vec<ActivityRecord>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next().await? {
                Some(record) => out.push(record),
                None => break,
            }
        }
        Ok(out)
    }
}

/// A lazy walk over a post's reply edges.
pub struct ReplyWalk {
    kv: Arc<dyn KeyValueStore>,
    table: String,
    pk: String,
    items_per_query: usize,
    scan_forward: bool,
    reverse_pages: bool,
    exclusive_start: Option<PrimaryKey>,
    buffer: VecDeque<ReplyRecord>,
    exhausted: bool,
}

impl ReplyWalk {
    fn new(
        kv: Arc<dyn KeyValueStore>,
        table: String,
        pk: String,
        items_per_query: usize,
        before: Option<String>,
        after: Option<String>,
    ) -> AppResult<Self> {
        if before.is_some() && after.is_some() {
            return Err(AppError::BadRequest(
                "both of before and after are specified".to_string(),
            ));
        }
        let (scan_forward, reverse_pages, bound) = match (before, after) {
            (Some(before), None) => (false, false, Some(before)),
            (None, Some(after)) => (true, true, Some(after)),
            _ => (false, false, None),
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

    /// The next reply record, or `None` once the partition is exhausted.
    pub async fn next(&mut self) -> AppResult<Option<ReplyRecord>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
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
                        sk_begins_with: Some(REPLY_SK_PREFIX.to_string()),
                        require_true: None,
                        scan_forward: self.scan_forward,
                        limit: self.items_per_query,
                        exclusive_start_key: self.exclusive_start.clone(),
                    },
                )
                .await
                .map_err(KvError::into_app)?;
            let mut records = page
                .items
                .iter()
                .map(ReplyRecord::parse_item)
                .collect::<AppResult<Vec<_>>>()?;
            if self.reverse_pages {
                records.reverse();
            }
            self.buffer.extend(records);
            match page.last_evaluated_key {
                Some(key) => self.exclusive_start = Some(key),
                None => self.exhausted = true,
            }
        }
    }

    /// Pulls up to `n` records.
    pub async fn take(&mut self, n: usize) -> AppResult<Vec<ReplyRecord>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next().await? {
                Some(record) => out.push(record),
                None => break,
            }
        }
        Ok(out)
    }
}
