//! Narrow contracts for the external stores (key-value table, blob store,
//! parameter store), in-memory backends, and the object-blob adapter.

pub mod blob;
pub mod kv;
pub mod objects;
pub mod params;

pub use blob::{body_checksum, BlobError, BlobStore, MemoryBlobStore};
pub use kv::{
    ChangeRecord, CounterUpdate, Item, KeyValueStore, KvError, MemoryKeyValueStore, Query,
    QueryPage, StreamEventKind, UpdateAction, WriteCondition,
};
pub use objects::{
    make_inbox_key, make_outbox_key, make_post_object_key, make_staging_outbox_key,
    to_urlsafe_base64, username_from_inbox_key, username_from_outbox_key,
    username_from_staging_outbox_key, ObjectKey, ObjectStorage, DIGEST_PREFIX,
};
pub use params::{MemoryParameterStore, ParameterError, ParameterStore};
