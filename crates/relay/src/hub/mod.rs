// Registry of live collaborative sessions.
//
// Lock order: the registry mutex is always released before any session lock
// is taken. Nothing here holds both.

pub mod connection;
pub mod session;
pub mod teardown;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tandem_common::{
    protocol::ws::{ServerEvent, SessionEndReason},
    types::ParticipantRole,
};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        join_token::{IssuedJoinToken, JoinClaims, JoinTokenAuthority, JoinTokenError},
        primary::PrimaryCredentialVerifier,
    },
    config::HubConfig,
    error::HubError,
    feed::ChangeFeed,
    metrics,
    store::{SessionStore, StoreError},
};

pub use connection::{ConnectionHandle, ConnectionState, Delivery, OutboundReceiver, Outgoing};
pub use session::{Session, SessionSnapshot};
pub use teardown::TeardownOutcome;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Proof that an upgrade request passed every pre-upgrade check.
#[derive(Debug, Clone)]
pub struct Admission {
    claims: JoinClaims,
    role: ParticipantRole,
    batch_id: Uuid,
}

impl Admission {
    pub fn session_id(&self) -> Uuid {
        self.claims.session_id
    }

    pub fn user_id(&self) -> Uuid {
        self.claims.user_id
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }
}

/// A connection freshly attached to a session, ready for its task pair.
pub struct Attachment {
    pub connection: Arc<ConnectionHandle>,
    pub receiver: OutboundReceiver,
    pub session: Arc<Session>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<Uuid, Arc<Session>>,
    /// Sessions whose end-of-session cascade is running.
    terminating: HashSet<Uuid>,
    shutting_down: bool,
}

pub struct Hub {
    config: HubConfig,
    join_tokens: Arc<JoinTokenAuthority>,
    primary: PrimaryCredentialVerifier,
    store: SessionStore,
    feed: ChangeFeed,
    registry: Mutex<RegistryState>,
    shutdown: CancellationToken,
    live_connections: AtomicUsize,
    connections_drained: Notify,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        join_tokens: Arc<JoinTokenAuthority>,
        primary: PrimaryCredentialVerifier,
        store: SessionStore,
        feed: ChangeFeed,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            join_tokens,
            primary,
            store,
            feed,
            registry: Mutex::new(RegistryState::default()),
            shutdown: CancellationToken::new(),
            live_connections: AtomicUsize::new(0),
            connections_drained: Notify::new(),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn issue_join_token(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        batch_id: Option<Uuid>,
    ) -> Result<IssuedJoinToken, JoinTokenError> {
        self.join_tokens.issue(user_id, session_id, batch_id, self.config.join_token_ttl)
    }

    /// Pre-upgrade checks for an owner-class token against `session_id`.
    pub async fn authorize_owner(
        &self,
        session_id: Uuid,
        token: &str,
        credential: Option<&str>,
    ) -> Result<Admission, HubError> {
        self.ensure_accepting().await?;
        let claims = self.validate_for_session(session_id, token)?;
        let Some(batch_id) = claims.batch_id else {
            return Err(HubError::Auth("member token cannot create a session".into()));
        };
        self.verify_primary(&claims, credential)?;

        let record = self.store.fetch_session(session_id).await.map_err(not_found)?;
        if record.owner_id != claims.user_id {
            return Err(HubError::Auth("caller does not own this session".into()));
        }
        if record.batch_id != batch_id {
            return Err(HubError::Auth("token batch does not match the session".into()));
        }

        if let Some(session) = self.live_session(session_id).await? {
            if session.has_owner().await {
                return Err(HubError::Conflict);
            }
        }

        self.join_tokens.consume(&claims)?;
        Ok(Admission { claims, role: ParticipantRole::Owner, batch_id })
    }

    /// Pre-upgrade checks for a member-class token against `session_id`.
    pub async fn authorize_member(
        &self,
        session_id: Uuid,
        token: &str,
        credential: Option<&str>,
    ) -> Result<Admission, HubError> {
        self.ensure_accepting().await?;
        let claims = self.validate_for_session(session_id, token)?;
        if claims.is_owner_class() {
            return Err(HubError::Auth("owner token cannot join as a member".into()));
        }
        self.verify_primary(&claims, credential)?;

        let record = self.store.fetch_session(session_id).await.map_err(not_found)?;
        if !self.store.is_member(session_id, claims.user_id).await? {
            return Err(HubError::Auth("caller is not a member of this session".into()));
        }
        if self.live_session(session_id).await?.is_none() {
            return Err(HubError::NotFound);
        }

        self.join_tokens.consume(&claims)?;
        Ok(Admission { claims, role: ParticipantRole::Member, batch_id: record.batch_id })
    }

    /// Attaches an admitted owner, creating the live session if absent.
    pub async fn create_session(&self, admission: &Admission) -> Result<Attachment, HubError> {
        if admission.role != ParticipantRole::Owner {
            return Err(HubError::Auth("admission is not owner-class".into()));
        }
        let session_id = admission.session_id();

        let (session, created) = {
            let mut registry = self.registry.lock().await;
            if registry.shutting_down {
                return Err(HubError::ShuttingDown);
            }
            if registry.terminating.contains(&session_id) {
                return Err(HubError::Conflict);
            }
            match registry.sessions.get(&session_id) {
                Some(session) => (session.clone(), false),
                None => {
                    let session = Arc::new(Session::new(session_id, admission.batch_id));
                    registry.sessions.insert(session_id, session.clone());
                    metrics::set_live_sessions(registry.sessions.len());
                    (session, true)
                }
            }
        };

        let (connection, receiver) = self.new_connection(admission);
        if let Err(error) = session.attach_owner(connection.clone()).await {
            if created && session.is_vacant().await {
                self.remove_if_current(&session).await;
            }
            return Err(error);
        }

        self.connection_attached(&connection);
        info!(
            session_id = %session_id,
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            created,
            "owner attached"
        );
        Ok(Attachment { connection, receiver, session })
    }

    /// Attaches an admitted member to an existing live session.
    pub async fn join_session(&self, admission: &Admission) -> Result<Attachment, HubError> {
        if admission.role != ParticipantRole::Member {
            return Err(HubError::Auth("admission is not member-class".into()));
        }
        let session_id = admission.session_id();

        let session = {
            let registry = self.registry.lock().await;
            if registry.shutting_down {
                return Err(HubError::ShuttingDown);
            }
            if registry.terminating.contains(&session_id) {
                return Err(HubError::NotFound);
            }
            registry.sessions.get(&session_id).cloned().ok_or(HubError::NotFound)?
        };

        let (connection, receiver) = self.new_connection(admission);
        session.add_member(connection.clone()).await?;
        self.connection_attached(&connection);

        let report = session
            .broadcast(
                ServerEvent::MemberJoined { member_id: connection.user_id() },
                &[connection.id()],
            )
            .await;
        info!(
            session_id = %session_id,
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            notified = report.delivered,
            "member joined"
        );
        Ok(Attachment { connection, receiver, session })
    }

    /// Refuses new attachments, ends every session with `server_shutdown`,
    /// waits briefly for sockets to drain, then cancels the rest.
    pub async fn shutdown(&self) {
        let session_ids: Vec<Uuid> = {
            let mut registry = self.registry.lock().await;
            registry.shutting_down = true;
            registry.sessions.keys().copied().collect()
        };
        info!(sessions = session_ids.len(), "hub shutting down");

        for session_id in session_ids {
            self.end_session(session_id, SessionEndReason::ServerShutdown).await;
        }

        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, self.wait_for_connections()).await.is_err() {
            warn!(
                remaining = self.live_connections.load(Ordering::SeqCst),
                "connections did not drain before shutdown deadline"
            );
        }
        self.shutdown.cancel();
    }

    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }

    pub async fn is_terminating(&self, session_id: Uuid) -> bool {
        self.registry.lock().await.terminating.contains(&session_id)
    }

    pub async fn session_snapshot(&self, session_id: Uuid) -> Option<SessionSnapshot> {
        let session = self.registry.lock().await.sessions.get(&session_id).cloned()?;
        Some(session.snapshot().await)
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::SeqCst)
    }

    /// Called once by the connection lifecycle after its teardown ran.
    pub(crate) fn connection_released(&self, connection: &ConnectionHandle) {
        metrics::record_connection_closed(connection.role().as_str());
        if self.live_connections.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.connections_drained.notify_waiters();
        }
    }

    async fn wait_for_connections(&self) {
        loop {
            let drained = self.connections_drained.notified();
            if self.live_connections.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    fn connection_attached(&self, connection: &ConnectionHandle) {
        self.live_connections.fetch_add(1, Ordering::SeqCst);
        metrics::record_connection_opened(connection.role().as_str());
    }

    fn new_connection(&self, admission: &Admission) -> (Arc<ConnectionHandle>, OutboundReceiver) {
        ConnectionHandle::new(
            admission.user_id(),
            admission.role,
            admission.session_id(),
            self.config.outbound_queue_capacity,
            self.shutdown.child_token(),
        )
    }

    async fn ensure_accepting(&self) -> Result<(), HubError> {
        if self.registry.lock().await.shutting_down {
            return Err(HubError::ShuttingDown);
        }
        Ok(())
    }

    fn validate_for_session(&self, session_id: Uuid, token: &str) -> Result<JoinClaims, HubError> {
        let claims = self.join_tokens.validate(token)?;
        if claims.session_id != session_id {
            debug!(
                token_session = %claims.session_id,
                url_session = %session_id,
                "join token presented for another session"
            );
            return Err(HubError::Auth("token was issued for another session".into()));
        }
        Ok(claims)
    }

    fn verify_primary(&self, claims: &JoinClaims, credential: Option<&str>) -> Result<(), HubError> {
        let Some(credential) = credential else {
            return Err(HubError::Auth("missing primary credential".into()));
        };
        if !self.primary.verify(claims.user_id, credential) {
            return Err(HubError::Auth("primary credential rejected".into()));
        }
        Ok(())
    }

    /// The live session, unless it is absent or mid-cascade.
    async fn live_session(&self, session_id: Uuid) -> Result<Option<Arc<Session>>, HubError> {
        let registry = self.registry.lock().await;
        if registry.terminating.contains(&session_id) {
            return Ok(None);
        }
        Ok(registry.sessions.get(&session_id).cloned())
    }

    /// Drops `session` from the registry only if it is still the registered instance.
    async fn remove_if_current(&self, session: &Arc<Session>) -> bool {
        let mut registry = self.registry.lock().await;
        let current = registry
            .sessions
            .get(&session.id())
            .is_some_and(|registered| Arc::ptr_eq(registered, session));
        if current {
            registry.sessions.remove(&session.id());
            metrics::set_live_sessions(registry.sessions.len());
        }
        current
    }
}

fn not_found(error: StoreError) -> HubError {
    match error {
        StoreError::NotFound => HubError::NotFound,
        other => HubError::Store(other),
    }
}
