// Departure handling, run once per connection from the writer's cleanup.
//
// Owner departure ends the session for everyone. The session id sits in the
// registry's terminating set for the whole cascade so that members dropping
// at the same moment skip their own departure work.

use std::sync::Arc;

use axum::extract::ws::close_code;
use tandem_common::{
    protocol::ws::{ServerEnvelope, ServerEvent, SessionEndReason},
    types::ParticipantRole,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ConnectionHandle, Delivery, Hub, Session};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Owner left; the session ended and `notified` members were told.
    OwnerCascade { notified: usize },
    /// Member removed and the rest were told.
    MemberLeft,
    /// A cascade for this session was already running.
    Superseded,
    /// The session (or this connection's place in it) was already gone.
    SessionGone,
}

impl TeardownOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OwnerCascade { .. } => "owner_cascade",
            Self::MemberLeft => "member_left",
            Self::Superseded => "superseded",
            Self::SessionGone => "session_gone",
        }
    }
}

impl Hub {
    pub async fn depart(&self, connection: &ConnectionHandle) -> TeardownOutcome {
        let outcome = match connection.role() {
            ParticipantRole::Owner => self.owner_departed(connection).await,
            ParticipantRole::Member => self.member_departed(connection).await,
        };
        metrics::record_teardown(outcome.as_str());
        debug!(
            session_id = %connection.session_id(),
            connection_id = %connection.id(),
            role = %connection.role(),
            outcome = outcome.as_str(),
            "connection departed"
        );
        outcome
    }

    /// Ends a live session for every participant. False if there was no
    /// live session or a cascade was already running.
    pub async fn end_session(&self, session_id: Uuid, reason: SessionEndReason) -> bool {
        let Some(session) = self.begin_termination(session_id).await else {
            return false;
        };
        let notified = self.run_cascade(&session, reason).await;
        self.finish_termination(session_id).await;
        info!(session_id = %session_id, reason = ?reason, notified, "session ended");
        true
    }

    async fn owner_departed(&self, connection: &ConnectionHandle) -> TeardownOutcome {
        let session_id = connection.session_id();
        let session = {
            let mut registry = self.registry.lock().await;
            let Some(session) = registry.sessions.get(&session_id).cloned() else {
                return TeardownOutcome::SessionGone;
            };
            if !registry.terminating.insert(session_id) {
                return TeardownOutcome::Superseded;
            }
            session
        };

        // A newer session may hold the id; only its own owner can end it.
        if !session.detach_owner(connection.id()).await {
            self.finish_termination(session_id).await;
            return TeardownOutcome::SessionGone;
        }

        let notified = self.run_cascade(&session, SessionEndReason::OwnerLeft).await;
        self.finish_termination(session_id).await;
        info!(session_id = %session_id, notified, "owner left; session ended");
        TeardownOutcome::OwnerCascade { notified }
    }

    async fn member_departed(&self, connection: &ConnectionHandle) -> TeardownOutcome {
        let session_id = connection.session_id();
        let session = {
            let registry = self.registry.lock().await;
            if registry.terminating.contains(&session_id) {
                return TeardownOutcome::Superseded;
            }
            match registry.sessions.get(&session_id) {
                Some(session) => session.clone(),
                None => return TeardownOutcome::SessionGone,
            }
        };

        if session.remove_member(connection.id()).await.is_none() {
            return TeardownOutcome::SessionGone;
        }
        session.broadcast(ServerEvent::MemberLeft { member_id: connection.user_id() }, &[]).await;
        if session.is_vacant().await {
            self.remove_if_current(&session).await;
        }
        TeardownOutcome::MemberLeft
    }

    async fn begin_termination(&self, session_id: Uuid) -> Option<Arc<Session>> {
        let mut registry = self.registry.lock().await;
        let session = registry.sessions.get(&session_id).cloned()?;
        if !registry.terminating.insert(session_id) {
            return None;
        }
        Some(session)
    }

    async fn finish_termination(&self, session_id: Uuid) {
        self.registry.lock().await.terminating.remove(&session_id);
    }

    /// Ends the session, unregisters it, then hands each remaining
    /// participant its `session_ended` notice and close frame. Returns how
    /// many were told.
    async fn run_cascade(&self, session: &Arc<Session>, reason: SessionEndReason) -> usize {
        let participants = session.end().await.unwrap_or_default();
        self.remove_if_current(session).await;

        let (code, close_reason) = match reason {
            SessionEndReason::ServerShutdown => (close_code::RESTART, "server shutting down"),
            SessionEndReason::OwnerLeft => (close_code::NORMAL, "owner left"),
            SessionEndReason::Deleted => (close_code::NORMAL, "session deleted"),
        };

        let mut notified = 0;
        for participant in participants {
            let ended = ServerEnvelope::new(participant.session_id(), ServerEvent::SessionEnded { reason });
            match participant.outbound().deliver_final(ended, code, close_reason) {
                Delivery::Delivered => notified += 1,
                Delivery::Dropped | Delivery::Closed => {
                    debug!(connection_id = %participant.id(), "participant unreachable; no session_ended")
                }
            }
        }
        notified
    }
}
