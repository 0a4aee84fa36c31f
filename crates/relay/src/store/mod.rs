// Session persistence: session records, batch uniqueness and membership.
//
// The hub only needs existence and membership; everything else about
// batches and images lives in the surrounding system.

mod memory;
mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use memory::MemorySessionStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("batch already has a collaborative session")]
    BatchInUse,
    #[error("session record not found")]
    NotFound,
    #[error("session store backend failure: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(database_error) = &error {
            if database_error.code().as_deref() == Some("23505") {
                return Self::BatchInUse;
            }
        }
        Self::Backend(error.to_string())
    }
}

#[derive(Clone)]
pub enum SessionStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemorySessionStore>>),
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemorySessionStore::default())))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    /// Fails with [`StoreError::BatchInUse`] when another session holds the batch.
    pub async fn create_session(
        &self,
        owner_id: Uuid,
        batch_id: Uuid,
    ) -> Result<SessionRecord, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::create_session(pool, owner_id, batch_id).await,
            Self::Memory(store) => memory::create_session(store, owner_id, batch_id).await,
        }
    }

    pub async fn fetch_session(&self, session_id: Uuid) -> Result<SessionRecord, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::fetch_session(pool, session_id).await,
            Self::Memory(store) => memory::fetch_session(store, session_id).await,
        }
    }

    pub async fn session_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Option<SessionRecord>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::session_for_batch(pool, batch_id).await,
            Self::Memory(store) => memory::session_for_batch(store, batch_id).await,
        }
    }

    /// The owner counts as a member of their own session.
    pub async fn is_member(&self, session_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::is_member(pool, session_id, user_id).await,
            Self::Memory(store) => memory::is_member(store, session_id, user_id).await,
        }
    }

    /// Idempotent.
    pub async fn add_member(&self, session_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::add_member(pool, session_id, user_id).await,
            Self::Memory(store) => memory::add_member(store, session_id, user_id).await,
        }
    }

    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::delete_session(pool, session_id).await,
            Self::Memory(store) => memory::delete_session(store, session_id).await,
        }
    }
}
