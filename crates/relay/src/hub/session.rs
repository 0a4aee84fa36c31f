// A live collaborative session: at most one owner plus any number of
// members, guarded by the session's own lock.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tandem_common::protocol::ws::{ServerEnvelope, ServerEvent};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::HubError,
    hub::connection::{ConnectionHandle, Delivery},
    metrics::MessageClass,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub batch_id: Uuid,
    pub owner_connected: bool,
    pub member_count: usize,
    pub updated_at: DateTime<Utc>,
}

struct SessionState {
    owner: Option<Arc<ConnectionHandle>>,
    /// Keyed by connection id; one user may hold several sockets.
    members: HashMap<Uuid, Arc<ConnectionHandle>>,
    ended: bool,
    updated_at: DateTime<Utc>,
}

pub struct Session {
    id: Uuid,
    batch_id: Uuid,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(id: Uuid, batch_id: Uuid) -> Self {
        Self {
            id,
            batch_id,
            state: RwLock::new(SessionState {
                owner: None,
                members: HashMap::new(),
                ended: false,
                updated_at: Utc::now(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn attach_owner(&self, connection: Arc<ConnectionHandle>) -> Result<(), HubError> {
        let mut state = self.state.write().await;
        if state.ended {
            return Err(HubError::NotFound);
        }
        if state.owner.is_some() {
            return Err(HubError::Conflict);
        }
        state.owner = Some(connection);
        state.updated_at = Utc::now();
        Ok(())
    }

    pub async fn add_member(&self, connection: Arc<ConnectionHandle>) -> Result<(), HubError> {
        let mut state = self.state.write().await;
        if state.ended {
            return Err(HubError::NotFound);
        }
        state.members.insert(connection.id(), connection);
        state.updated_at = Utc::now();
        Ok(())
    }

    /// Returns the removed member, or `None` if it was already gone.
    pub async fn remove_member(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        let mut state = self.state.write().await;
        let removed = state.members.remove(&connection_id);
        if removed.is_some() {
            state.updated_at = Utc::now();
        }
        removed
    }

    /// Clears the owner slot if `connection_id` holds it.
    pub async fn detach_owner(&self, connection_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        match &state.owner {
            Some(owner) if owner.id() == connection_id => {
                state.owner = None;
                state.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Non-blocking fan-out to everyone not in `exclude`. A full queue drops
    /// that recipient's copy; nothing is sent once the session has ended.
    pub async fn broadcast(&self, event: ServerEvent, exclude: &[Uuid]) -> BroadcastReport {
        let state = self.state.read().await;
        let mut report = BroadcastReport::default();
        if state.ended {
            return report;
        }

        let envelope = ServerEnvelope::new(self.id, event);
        let recipients = state
            .owner
            .iter()
            .chain(state.members.values())
            .filter(|connection| !exclude.contains(&connection.id()));
        for connection in recipients {
            match connection.outbound().try_deliver(envelope.clone(), MessageClass::Presence) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Closed => {}
            }
        }
        report
    }

    /// Marks the session ended and hands back every remaining participant.
    /// `None` if it had already ended.
    pub async fn end(&self) -> Option<Vec<Arc<ConnectionHandle>>> {
        let mut state = self.state.write().await;
        if state.ended {
            return None;
        }
        state.ended = true;
        state.updated_at = Utc::now();

        let mut participants: Vec<_> = state.owner.take().into_iter().collect();
        participants.extend(state.members.drain().map(|(_, connection)| connection));
        Some(participants)
    }

    pub async fn is_vacant(&self) -> bool {
        let state = self.state.read().await;
        state.owner.is_none() && state.members.is_empty()
    }

    pub async fn has_owner(&self) -> bool {
        self.state.read().await.owner.is_some()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().await;
        SessionSnapshot {
            session_id: self.id,
            batch_id: self.batch_id,
            owner_connected: state.owner.is_some(),
            member_count: state.members.len(),
            updated_at: state.updated_at,
        }
    }
}
