//! Derived-counter maintenance driven by the table change streams.
//!
//! This component is the only writer of `followerCount`, `followingCount`
//! and `replyCount`; the edge-mutation sites never touch them. Each
//! invocation folds its batch of change records into per-record deltas and
//! flushes them as batched counter updates. Failed statements are logged and
//! not retried here; the stream trigger owns invocation-level retry.

use std::collections::HashMap;
use std::sync::Arc;

use quill_common::cursor::{
    make_user_key, parse_followee_partition_key, parse_follower_partition_key, PrimaryKey,
    FOLLOWEE_PK_PREFIX, FOLLOWER_PK_PREFIX, OBJECT_PK_PREFIX, POST_METADATA_SK, REPLY_SK_PREFIX,
};
use quill_common::metrics::{get_metrics, Metrics};
use quill_common::{AppError, AppResult};
use quill_store::{ChangeRecord, CounterUpdate, KeyValueStore, StreamEventKind};

/// Hard limit on items in a single batch of the underlying store.
const BATCH_SIZE: usize = 25;

/// Applies change-stream batches to the derived counters.
#[derive(Clone)]
pub struct StatisticsMaintainer {
    kv: Arc<dyn KeyValueStore>,
    user_table: String,
    object_table: String,
}

/// Accumulated deltas for one user record.
#[derive(Debug, Default)]
struct UserDeltas {
    follower: i64,
    following: i64,
}

impl StatisticsMaintainer {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        user_table: impl Into<String>,
        object_table: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            user_table: user_table.into(),
            object_table: object_table.into(),
        }
    }

    /// Folds user-table change records into follower/following counters.
    ///
    /// The accumulator lives only for this invocation.
    pub async fn apply_user_events(&self, records: &[ChangeRecord]) -> AppResult<()> {
        let mut deltas: HashMap<String, UserDeltas> = HashMap::new();
        for record in records {
            let delta = match record.event {
                StreamEventKind::Insert => 1,
                StreamEventKind::Remove => -1,
                StreamEventKind::Modify => {
                    tracing::debug!(pk = %record.key.pk, "ignoring modify event");
                    continue;
                }
            };
            if record.key.pk.starts_with(FOLLOWER_PK_PREFIX) {
                let username = parse_follower_partition_key(&record.key.pk)?;
                deltas.entry(username).or_default().follower += delta;
            } else if record.key.pk.starts_with(FOLLOWEE_PK_PREFIX) {
                let username = parse_followee_partition_key(&record.key.pk)?;
                deltas.entry(username).or_default().following += delta;
            } else {
                tracing::debug!(pk = %record.key.pk, "ignoring key");
            }
        }

        let statements: Vec<CounterUpdate> = deltas
            .into_iter()
            .map(|(username, delta)| CounterUpdate {
                key: make_user_key(&username),
                deltas: vec![
                    ("followerCount".to_string(), delta.follower),
                    ("followingCount".to_string(), delta.following),
                ],
            })
            .collect();
        self.flush(&self.user_table, statements).await
    }

    /// Folds object-table change records into reply counters.
    pub async fn apply_object_events(&self, records: &[ChangeRecord]) -> AppResult<()> {
        let mut deltas: HashMap<String, i64> = HashMap::new();
        for record in records {
            let delta = match record.event {
                StreamEventKind::Insert => 1,
                StreamEventKind::Remove => -1,
                StreamEventKind::Modify => continue,
            };
            let is_reply = record.key.pk.starts_with(OBJECT_PK_PREFIX)
                && record.key.sk.starts_with(REPLY_SK_PREFIX);
            if is_reply {
                *deltas.entry(record.key.pk.clone()).or_default() += delta;
            } else {
                tracing::debug!(pk = %record.key.pk, sk = %record.key.sk, "ignoring key");
            }
        }

        let statements: Vec<CounterUpdate> = deltas
            .into_iter()
            .map(|(post_pk, delta)| CounterUpdate {
                key: PrimaryKey {
                    pk: post_pk,
                    sk: POST_METADATA_SK.to_string(),
                },
                deltas: vec![("replyCount".to_string(), delta)],
            })
            .collect();
        self.flush(&self.object_table, statements).await
    }

    async fn flush(&self, table: &str, statements: Vec<CounterUpdate>) -> AppResult<()> {
        for batch in statements.chunks(BATCH_SIZE) {
            tracing::debug!(table = %table, statements = batch.len(), "executing batch");
            let results = self
                .kv
                .execute_batch(table, batch)
                .await
                .map_err(|e| AppError::Transient(e.to_string()))?;
            Metrics::increment(&get_metrics().counter_batches_flushed);
            for (statement, result) in batch.iter().zip(results) {
                if let Err(err) = result {
                    Metrics::increment(&get_metrics().counter_statements_failed);
                    tracing::error!(
                        pk = %statement.key.pk,
                        sk = %statement.key.sk,
                        error = %err,
                        "counter update failed"
                    );
                }
            }
        }
        Ok(())
    }
}
