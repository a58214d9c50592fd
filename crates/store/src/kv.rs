//! The key-value table contract.
//!
//! One wide table per index, items addressed by `(pk, sk)`. Conditional
//! writes are the only concurrency-control primitive the rest of the system
//! relies on; there are no application-level locks.

use async_trait::async_trait;
use quill_common::cursor::PrimaryKey;
use quill_common::AppError;
use serde_json::Value;
use thiserror::Error;

/// An item as stored in a table.
pub type Item = serde_json::Map<String, Value>;

/// Failure kinds surfaced by a key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    /// A conditional expression did not hold.
    #[error("conditional check failed")]
    ConditionalCheckFailed,
    /// Provisioned throughput exceeded; retryable upstream.
    #[error("provisioned throughput exceeded")]
    ThroughputExceeded,
    /// API request limit exceeded; retryable upstream.
    #[error("request limit exceeded")]
    RequestLimitExceeded,
    #[error("store error: {0}")]
    Other(String),
}

impl KvError {
    /// Maps this error onto an application failure kind.
    ///
    /// `ConditionalCheckFailed` is deliberately not mapped here: call sites
    /// must decide whether it means "duplicate", "missing", or "fine".
    #[must_use]
    pub fn into_app(self) -> AppError {
        match self {
            Self::ThroughputExceeded | Self::RequestLimitExceeded => {
                AppError::Transient(self.to_string())
            }
            Self::ConditionalCheckFailed => {
                AppError::Internal("unhandled conditional check failure".to_string())
            }
            Self::Other(message) => AppError::Internal(message),
        }
    }
}

/// Conditional expression attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// The write succeeds only if no item exists under the primary key.
    KeyNotExists,
    /// The write succeeds only if an item exists under the primary key.
    KeyExists,
}

/// Mutation applied by `update_item`.
#[derive(Debug, Clone, Default)]
pub struct UpdateAction {
    /// Attribute assignments.
    pub set: Vec<(String, Value)>,
    /// Atomic counter additions.
    pub add: Vec<(String, i64)>,
}

/// A paged partition query.
#[derive(Debug, Clone)]
pub struct Query {
    /// Partition key to query.
    pub pk: String,
    /// Restricts to sort keys with this prefix.
    pub sk_begins_with: Option<String>,
    /// Server-side filter: only items whose named attribute is `true` are
    /// returned. Filtered items still count against `limit`.
    pub require_true: Option<String>,
    /// Ascending sort-key order when `true`, descending otherwise.
    pub scan_forward: bool,
    /// Maximum number of items scanned in this query.
    pub limit: usize,
    /// Exclusive continuation position from a previous page.
    pub exclusive_start_key: Option<PrimaryKey>,
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub items: Vec<Item>,
    /// Continuation key; absent when the partition range is exhausted.
    pub last_evaluated_key: Option<PrimaryKey>,
}

/// A batched counter-update statement.
#[derive(Debug, Clone)]
pub struct CounterUpdate {
    pub key: PrimaryKey,
    /// Counter attribute names and the deltas added to them.
    pub deltas: Vec<(String, i64)>,
}

/// Kind of a change-stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    Insert,
    Modify,
    Remove,
}

/// One record on a table's change stream.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub event: StreamEventKind,
    pub key: PrimaryKey,
}

/// The key-value table contract.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads one item.
    async fn get_item(&self, table: &str, key: &PrimaryKey) -> Result<Option<Item>, KvError>;

    /// Writes one item, replacing any existing one unless a condition says
    /// otherwise. The item must carry `pk` and `sk` attributes.
    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<WriteCondition>,
    ) -> Result<(), KvError>;

    /// Mutates one item in place.
    async fn update_item(
        &self,
        table: &str,
        key: &PrimaryKey,
        action: UpdateAction,
        condition: Option<WriteCondition>,
    ) -> Result<(), KvError>;

    /// Deletes one item.
    async fn delete_item(
        &self,
        table: &str,
        key: &PrimaryKey,
        condition: Option<WriteCondition>,
    ) -> Result<(), KvError>;

    /// Runs one paged partition query.
    async fn query(&self, table: &str, query: Query) -> Result<QueryPage, KvError>;

    /// Executes a batch of counter updates, returning per-statement results.
    ///
    /// The batch as a whole only fails on transport-level errors; individual
    /// statement failures come back in the result vector.
    async fn execute_batch(
        &self,
        table: &str,
        statements: &[CounterUpdate],
    ) -> Result<Vec<Result<(), KvError>>, KvError>;
}

mod memory {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use super::{
        ChangeRecord, CounterUpdate, Item, KvError, PrimaryKey, Query, QueryPage, StreamEventKind,
        UpdateAction, WriteCondition,
    };
    use async_trait::async_trait;
    use serde_json::Value;

    type Partitioned = BTreeMap<(String, String), Item>;

    /// In-memory key-value store.
    ///
    /// Backs tests and the single-node server. Each table is an ordered map
    /// keyed by `(pk, sk)`; every committed write appends to a per-table
    /// change stream that the statistics maintainer drains.
    #[derive(Debug, Default)]
    pub struct MemoryKeyValueStore {
        tables: Mutex<HashMap<String, Partitioned>>,
        events: Mutex<HashMap<String, Vec<ChangeRecord>>>,
    }

    impl MemoryKeyValueStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Drains the change stream of one table.
        pub fn drain_events(&self, table: &str) -> Vec<ChangeRecord> {
            let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
            events.remove(table).unwrap_or_default()
        }

        fn record(&self, table: &str, event: StreamEventKind, key: &PrimaryKey) {
            let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
            events
                .entry(table.to_string())
                .or_default()
                .push(ChangeRecord {
                    event,
                    key: key.clone(),
                });
        }

        fn item_key(item: &Item) -> Result<PrimaryKey, KvError> {
            let field = |name: &str| -> Result<String, KvError> {
                item.get(name)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| KvError::Other(format!("item is missing {name}")))
            };
            Ok(PrimaryKey {
                pk: field("pk")?,
                sk: field("sk")?,
            })
        }
    }

    #[async_trait]
    impl super::KeyValueStore for MemoryKeyValueStore {
        async fn get_item(
            &self,
            table: &str,
            key: &PrimaryKey,
        ) -> Result<Option<Item>, KvError> {
            let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            Ok(tables
                .get(table)
                .and_then(|items| items.get(&(key.pk.clone(), key.sk.clone())))
                .cloned())
        }

        async fn put_item(
            &self,
            table: &str,
            item: Item,
            condition: Option<WriteCondition>,
        ) -> Result<(), KvError> {
            let key = Self::item_key(&item)?;
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            let items = tables.entry(table.to_string()).or_default();
            let exists = items.contains_key(&(key.pk.clone(), key.sk.clone()));
            match condition {
                Some(WriteCondition::KeyNotExists) if exists => {
                    return Err(KvError::ConditionalCheckFailed)
                }
                Some(WriteCondition::KeyExists) if !exists => {
                    return Err(KvError::ConditionalCheckFailed)
                }
                _ => {}
            }
            items.insert((key.pk.clone(), key.sk.clone()), item);
            drop(tables);
            let event = if exists {
                StreamEventKind::Modify
            } else {
                StreamEventKind::Insert
            };
            self.record(table, event, &key);
            Ok(())
        }

        async fn update_item(
            &self,
            table: &str,
            key: &PrimaryKey,
            action: UpdateAction,
            condition: Option<WriteCondition>,
        ) -> Result<(), KvError> {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            let items = tables.entry(table.to_string()).or_default();
            let map_key = (key.pk.clone(), key.sk.clone());
            let exists = items.contains_key(&map_key);
            match (condition, exists) {
                (Some(WriteCondition::KeyExists), false) => {
                    return Err(KvError::ConditionalCheckFailed)
                }
                (Some(WriteCondition::KeyNotExists), true) => {
                    return Err(KvError::ConditionalCheckFailed)
                }
                _ => {}
            }
            // An unconditional update upserts, like the real table does.
            let item = items.entry(map_key).or_insert_with(|| {
                let mut fresh = Item::new();
                fresh.insert("pk".to_string(), Value::String(key.pk.clone()));
                fresh.insert("sk".to_string(), Value::String(key.sk.clone()));
                fresh
            });
            for (name, value) in action.set {
                item.insert(name, value);
            }
            for (name, delta) in action.add {
                let current = item.get(&name).and_then(Value::as_i64).unwrap_or(0);
                item.insert(name, Value::from(current + delta));
            }
            drop(tables);
            self.record(table, StreamEventKind::Modify, key);
            Ok(())
        }

        async fn delete_item(
            &self,
            table: &str,
            key: &PrimaryKey,
            condition: Option<WriteCondition>,
        ) -> Result<(), KvError> {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            let items = tables.entry(table.to_string()).or_default();
            let exists = items.contains_key(&(key.pk.clone(), key.sk.clone()));
            match condition {
                Some(WriteCondition::KeyExists) if !exists => {
                    return Err(KvError::ConditionalCheckFailed)
                }
                Some(WriteCondition::KeyNotExists) if exists => {
                    return Err(KvError::ConditionalCheckFailed)
                }
                _ => {}
            }
            let removed = items.remove(&(key.pk.clone(), key.sk.clone()));
            drop(tables);
            if removed.is_some() {
                self.record(table, StreamEventKind::Remove, key);
            }
            Ok(())
        }

        async fn query(&self, table: &str, query: Query) -> Result<QueryPage, KvError> {
            let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            let Some(items) = tables.get(table) else {
                return Ok(QueryPage {
                    items: Vec::new(),
                    last_evaluated_key: None,
                });
            };

            let range_start = (query.pk.clone(), String::new());
            let range_end = (format!("{}\u{10ffff}", query.pk), String::new());
            let mut partition: Vec<(&(String, String), &Item)> = items
                .range(range_start..range_end)
                .filter(|((pk, sk), _)| {
                    *pk == query.pk
                        && query
                            .sk_begins_with
                            .as_ref()
                            .map_or(true, |prefix| sk.starts_with(prefix.as_str()))
                })
                .collect();
            if !query.scan_forward {
                partition.reverse();
            }

            // Apply the exclusive continuation bound in scan order.
            let start_index = match &query.exclusive_start_key {
                Some(start) => partition
                    .iter()
                    .position(|((_, sk), _)| {
                        if query.scan_forward {
                            *sk > start.sk
                        } else {
                            *sk < start.sk
                        }
                    })
                    .unwrap_or(partition.len()),
                None => 0,
            };

            let mut scanned = 0usize;
            let mut out = Vec::new();
            let mut last_key: Option<PrimaryKey> = None;
            for ((pk, sk), item) in partition.iter().skip(start_index) {
                if scanned == query.limit {
                    break;
                }
                scanned += 1;
                last_key = Some(PrimaryKey {
                    pk: pk.clone(),
                    sk: sk.clone(),
                });
                if let Some(attr) = &query.require_true {
                    if item.get(attr.as_str()).and_then(Value::as_bool) != Some(true) {
                        continue;
                    }
                }
                out.push((*item).clone());
            }

            // A continuation key is only returned while items remain past the
            // last scanned position.
            let remaining = partition.len() - start_index > scanned;
            Ok(QueryPage {
                items: out,
                last_evaluated_key: if remaining { last_key } else { None },
            })
        }

        async fn execute_batch(
            &self,
            table: &str,
            statements: &[CounterUpdate],
        ) -> Result<Vec<Result<(), KvError>>, KvError> {
            let mut results = Vec::with_capacity(statements.len());
            for statement in statements {
                let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
                let items = tables.entry(table.to_string()).or_default();
                let entry =
                    items.get_mut(&(statement.key.pk.clone(), statement.key.sk.clone()));
                let result = match entry {
                    None => Err(KvError::Other(format!(
                        "no item for statement: pk={}, sk={}",
                        statement.key.pk, statement.key.sk
                    ))),
                    Some(item) => {
                        for (name, delta) in &statement.deltas {
                            let current = item.get(name).and_then(Value::as_i64).unwrap_or(0);
                            item.insert(name.clone(), Value::from(current + delta));
                        }
                        Ok(())
                    }
                };
                drop(tables);
                if result.is_ok() {
                    self.record(table, StreamEventKind::Modify, &statement.key);
                }
                results.push(result);
            }
            Ok(results)
        }
    }
}

pub use memory::MemoryKeyValueStore;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(pk: &str, sk: &str, extra: &[(&str, Value)]) -> Item {
        let mut item = Item::new();
        item.insert("pk".to_string(), json!(pk));
        item.insert("sk".to_string(), json!(sk));
        for (name, value) in extra {
            item.insert((*name).to_string(), value.clone());
        }
        item
    }

    fn key(pk: &str, sk: &str) -> PrimaryKey {
        PrimaryKey {
            pk: pk.to_string(),
            sk: sk.to_string(),
        }
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let store = MemoryKeyValueStore::new();
        store
            .put_item("t", item("a", "1", &[]), Some(WriteCondition::KeyNotExists))
            .await
            .unwrap();
        let err = store
            .put_item("t", item("a", "1", &[]), Some(WriteCondition::KeyNotExists))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::ConditionalCheckFailed));
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let store = MemoryKeyValueStore::new();
        let err = store
            .delete_item("t", &key("a", "1"), Some(WriteCondition::KeyExists))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::ConditionalCheckFailed));

        store.put_item("t", item("a", "1", &[]), None).await.unwrap();
        store
            .delete_item("t", &key("a", "1"), Some(WriteCondition::KeyExists))
            .await
            .unwrap();
        assert!(store.get_item("t", &key("a", "1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_counters() {
        let store = MemoryKeyValueStore::new();
        store
            .put_item("t", item("a", "1", &[("count", json!(2))]), None)
            .await
            .unwrap();
        store
            .update_item(
                "t",
                &key("a", "1"),
                UpdateAction {
                    set: vec![("name".to_string(), json!("x"))],
                    add: vec![("count".to_string(), 3)],
                },
                Some(WriteCondition::KeyExists),
            )
            .await
            .unwrap();
        let stored = store.get_item("t", &key("a", "1")).await.unwrap().unwrap();
        assert_eq!(stored["count"], json!(5));
        assert_eq!(stored["name"], json!("x"));
    }

    #[tokio::test]
    async fn test_query_pagination_and_order() {
        let store = MemoryKeyValueStore::new();
        for sk in ["1", "2", "3", "4", "5"] {
            store.put_item("t", item("a", sk, &[]), None).await.unwrap();
        }
        store.put_item("t", item("b", "9", &[]), None).await.unwrap();

        let page = store
            .query(
                "t",
                Query {
                    pk: "a".to_string(),
                    sk_begins_with: None,
                    require_true: None,
                    scan_forward: true,
                    limit: 2,
                    exclusive_start_key: None,
                },
            )
            .await
            .unwrap();
        let sks: Vec<&str> = page.items.iter().map(|i| i["sk"].as_str().unwrap()).collect();
        assert_eq!(sks, vec!["1", "2"]);
        let continuation = page.last_evaluated_key.unwrap();
        assert_eq!(continuation.sk, "2");

        let page = store
            .query(
                "t",
                Query {
                    pk: "a".to_string(),
                    sk_begins_with: None,
                    require_true: None,
                    scan_forward: false,
                    limit: 10,
                    exclusive_start_key: Some(key("a", "4")),
                },
            )
            .await
            .unwrap();
        let sks: Vec<&str> = page.items.iter().map(|i| i["sk"].as_str().unwrap()).collect();
        assert_eq!(sks, vec!["3", "2", "1"]);
        assert!(page.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_query_filter_counts_against_limit() {
        let store = MemoryKeyValueStore::new();
        for (sk, public) in [("1", false), ("2", false), ("3", true)] {
            store
                .put_item("t", item("a", sk, &[("isPublic", json!(public))]), None)
                .await
                .unwrap();
        }
        let page = store
            .query(
                "t",
                Query {
                    pk: "a".to_string(),
                    sk_begins_with: None,
                    require_true: Some("isPublic".to_string()),
                    scan_forward: true,
                    limit: 2,
                    exclusive_start_key: None,
                },
            )
            .await
            .unwrap();
        // Both scanned items were filtered out, but the page still advances.
        assert!(page.items.is_empty());
        assert_eq!(page.last_evaluated_key.unwrap().sk, "2");
    }

    #[tokio::test]
    async fn test_change_stream() {
        let store = MemoryKeyValueStore::new();
        store.put_item("t", item("a", "1", &[]), None).await.unwrap();
        store.put_item("t", item("a", "1", &[]), None).await.unwrap();
        store.delete_item("t", &key("a", "1"), None).await.unwrap();

        let events = store.drain_events("t");
        let kinds: Vec<StreamEventKind> = events.iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Insert,
                StreamEventKind::Modify,
                StreamEventKind::Remove
            ]
        );
        assert!(store.drain_events("t").is_empty());
    }

    #[tokio::test]
    async fn test_execute_batch_reports_per_statement_errors() {
        let store = MemoryKeyValueStore::new();
        store
            .put_item("t", item("a", "1", &[("count", json!(1))]), None)
            .await
            .unwrap();
        let results = store
            .execute_batch(
                "t",
                &[
                    CounterUpdate {
                        key: key("a", "1"),
                        deltas: vec![("count".to_string(), 2)],
                    },
                    CounterUpdate {
                        key: key("missing", "1"),
                        deltas: vec![("count".to_string(), 1)],
                    },
                ],
            )
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        let stored = store.get_item("t", &key("a", "1")).await.unwrap().unwrap();
        assert_eq!(stored["count"], json!(3));
    }
}
