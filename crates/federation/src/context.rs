//! The application context: configuration and store handles built once at
//! startup and threaded through every handler.

use std::sync::Arc;

use quill_common::{AppError, AppResult, Config};
use quill_index::{ObjectIndex, User, UserIndex};
use quill_store::{BlobStore, KeyValueStore, ObjectStorage, ParameterStore};
use quill_vocab::Fetch;

use crate::client::Deliver;

/// Dependencies shared by the pipeline units and read views.
#[derive(Clone)]
pub struct Context {
    pub config: Config,
    pub params: Arc<dyn ParameterStore>,
    /// Adapter over the objects bucket.
    pub objects: ObjectStorage,
    /// Adapter over the write-only forensic bucket.
    pub quarantine: ObjectStorage,
    pub users: UserIndex,
    pub index: ObjectIndex,
    pub fetch: Arc<dyn Fetch>,
    pub deliverer: Arc<dyn Deliver>,
}

impl Context {
    /// Builds a context over concrete store implementations.
    #[must_use]
    pub fn new(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        blobs: Arc<dyn BlobStore>,
        params: Arc<dyn ParameterStore>,
        fetch: Arc<dyn Fetch>,
        deliverer: Arc<dyn Deliver>,
    ) -> Self {
        let objects = ObjectStorage::new(blobs.clone(), config.buckets.objects.clone());
        let quarantine = ObjectStorage::new(blobs, config.buckets.quarantine.clone());
        let users = UserIndex::new(kv.clone(), config.tables.user_table.clone());
        let index = ObjectIndex::new(kv, config.tables.object_table.clone());
        Self {
            config,
            params,
            objects,
            quarantine,
            users,
            index,
            fetch,
            deliverer,
        }
    }

    /// The domain every local URI carries.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.config.federation.domain
    }

    /// Looks up a local user, failing with `NotFound` when absent.
    pub async fn require_user(&self, username: &str) -> AppResult<User> {
        self.users
            .find_user_by_username(username, self.domain())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no such user: {username}")))
    }
}
