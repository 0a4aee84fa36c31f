use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{SessionRecord, StoreError};

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: HashMap<Uuid, SessionRecord>,
    batches: HashMap<Uuid, Uuid>,
    members: HashMap<Uuid, HashSet<Uuid>>,
}

pub(super) async fn create_session(
    store: &Arc<RwLock<MemorySessionStore>>,
    owner_id: Uuid,
    batch_id: Uuid,
) -> Result<SessionRecord, StoreError> {
    let mut state = store.write().await;
    if state.batches.contains_key(&batch_id) {
        return Err(StoreError::BatchInUse);
    }

    let record =
        SessionRecord { id: Uuid::new_v4(), batch_id, owner_id, created_at: Utc::now() };
    state.batches.insert(batch_id, record.id);
    state.members.insert(record.id, HashSet::new());
    state.sessions.insert(record.id, record.clone());
    Ok(record)
}

pub(super) async fn fetch_session(
    store: &Arc<RwLock<MemorySessionStore>>,
    session_id: Uuid,
) -> Result<SessionRecord, StoreError> {
    store.read().await.sessions.get(&session_id).cloned().ok_or(StoreError::NotFound)
}

pub(super) async fn session_for_batch(
    store: &Arc<RwLock<MemorySessionStore>>,
    batch_id: Uuid,
) -> Result<Option<SessionRecord>, StoreError> {
    let state = store.read().await;
    Ok(state.batches.get(&batch_id).and_then(|session_id| state.sessions.get(session_id)).cloned())
}

pub(super) async fn is_member(
    store: &Arc<RwLock<MemorySessionStore>>,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<bool, StoreError> {
    let state = store.read().await;
    let Some(record) = state.sessions.get(&session_id) else {
        return Ok(false);
    };
    Ok(record.owner_id == user_id
        || state.members.get(&session_id).is_some_and(|members| members.contains(&user_id)))
}

pub(super) async fn add_member(
    store: &Arc<RwLock<MemorySessionStore>>,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    if !state.sessions.contains_key(&session_id) {
        return Err(StoreError::NotFound);
    }
    state.members.entry(session_id).or_default().insert(user_id);
    Ok(())
}

pub(super) async fn delete_session(
    store: &Arc<RwLock<MemorySessionStore>>,
    session_id: Uuid,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    let record = state.sessions.remove(&session_id).ok_or(StoreError::NotFound)?;
    state.batches.remove(&record.batch_id);
    state.members.remove(&session_id);
    Ok(())
}
