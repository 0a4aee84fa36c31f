// One participant socket: identity, lifecycle state and the bounded
// outbound queue drained by that socket's writer task.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use tandem_common::{
    protocol::ws::{ServerEnvelope, ServerEvent},
    types::ParticipantRole,
};
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError, error::TrySendError},
    Notify,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::{self, MessageClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Disconnecting,
            _ => Self::Closed,
        }
    }
}

/// Item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Message(ServerEnvelope),
    /// Write a close frame after everything queued before it.
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue was full; the message is gone.
    Dropped,
    /// Writer is gone.
    Closed,
}

/// Last words for a connection, kept outside the queue. Set at most once.
#[derive(Default)]
struct FinalNotice {
    slot: OnceLock<(ServerEnvelope, u16, String)>,
    ready: Notify,
}

/// Producer side of the outbound queue. Cheap to clone.
#[derive(Clone)]
pub struct Outbound {
    sender: mpsc::Sender<Outgoing>,
    final_notice: Arc<FinalNotice>,
    connection_id: Uuid,
    shutdown: CancellationToken,
}

impl Outbound {
    /// Non-blocking enqueue. Drops the message when the queue is full.
    pub fn try_deliver(&self, envelope: ServerEnvelope, class: MessageClass) -> Delivery {
        let kind = envelope.kind();
        match self.sender.try_send(Outgoing::Message(envelope)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.connection_id,
                    kind,
                    class = class.as_str(),
                    "outbound queue full; dropping message"
                );
                metrics::record_message_dropped(class);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Waits up to `timeout` for queue space, then drops. Used for data.
    pub async fn deliver_within(&self, envelope: ServerEnvelope, timeout: Duration) -> Delivery {
        let kind = envelope.kind();
        match self.sender.send_timeout(Outgoing::Message(envelope), timeout).await {
            Ok(()) => Delivery::Delivered,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    connection_id = %self.connection_id,
                    kind,
                    timeout_ms = timeout.as_millis() as u64,
                    "outbound queue stayed full; dropping data message"
                );
                metrics::record_message_dropped(MessageClass::Data);
                Delivery::Dropped
            }
            Err(SendTimeoutError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queues a close marker behind pending messages. With no room left the
    /// connection is shut down immediately instead. True if the marker was queued.
    pub fn request_close(&self, code: u16, reason: impl Into<String>) -> bool {
        let close = Outgoing::Close { code, reason: reason.into() };
        match self.sender.try_send(close) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(connection_id = %self.connection_id, "outbound queue full; forcing close");
                self.shutdown.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queues `envelope` and then a close marker. When the queue has no room
    /// for both, they go to the final-notice slot, which the writer reads
    /// ahead of anything still queued.
    pub fn deliver_final(
        &self,
        envelope: ServerEnvelope,
        code: u16,
        reason: impl Into<String>,
    ) -> Delivery {
        if self.sender.is_closed() {
            return Delivery::Closed;
        }
        let reason = reason.into();
        match self.sender.try_reserve_many(2) {
            Ok(mut permits) => {
                if let Some(permit) = permits.next() {
                    permit.send(Outgoing::Message(envelope));
                }
                if let Some(permit) = permits.next() {
                    permit.send(Outgoing::Close { code, reason });
                }
                Delivery::Delivered
            }
            Err(TrySendError::Full(())) => {
                let kind = envelope.kind();
                if self.final_notice.slot.set((envelope, code, reason)).is_err() {
                    return Delivery::Dropped;
                }
                self.final_notice.ready.notify_one();
                debug!(
                    connection_id = %self.connection_id,
                    kind,
                    "outbound queue full; final notice skips the queue"
                );
                Delivery::Delivered
            }
            Err(TrySendError::Closed(())) => Delivery::Closed,
        }
    }
}

/// Consumer side, owned by the writer task.
pub struct OutboundReceiver {
    receiver: mpsc::Receiver<Outgoing>,
    final_notice: Arc<FinalNotice>,
    final_items: VecDeque<Outgoing>,
    final_taken: bool,
    closed: bool,
}

impl OutboundReceiver {
    /// Next item to write. A final notice overtakes whatever is still queued.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        loop {
            if let Some(item) = self.take_final() {
                return Some(item);
            }
            if self.final_taken {
                return self.receiver.recv().await;
            }
            tokio::select! {
                biased;
                _ = self.final_notice.ready.notified() => continue,
                item = self.receiver.recv() => return item,
            }
        }
    }

    fn take_final(&mut self) -> Option<Outgoing> {
        if !self.final_taken {
            if let Some((envelope, code, reason)) = self.final_notice.slot.get() {
                self.final_taken = true;
                self.final_items.push_back(Outgoing::Message(envelope.clone()));
                self.final_items.push_back(Outgoing::Close { code: *code, reason: reason.clone() });
            }
        }
        self.final_items.pop_front()
    }

    /// Stops accepting new messages. Returns true only on the first call.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.receiver.close();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next queued item without waiting. Test helper.
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<Outgoing> {
        self.take_final().or_else(|| self.receiver.try_recv().ok())
    }
}

/// Shared identity and control surface of one connection.
pub struct ConnectionHandle {
    id: Uuid,
    user_id: Uuid,
    role: ParticipantRole,
    session_id: Uuid,
    outbound: Outbound,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Builds a handle in `Connecting` plus the receiving end of its queue.
    pub fn new(
        user_id: Uuid,
        role: ParticipantRole,
        session_id: Uuid,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, OutboundReceiver) {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let final_notice = Arc::new(FinalNotice::default());
        let outbound = Outbound {
            sender,
            final_notice: final_notice.clone(),
            connection_id: id,
            shutdown: shutdown.clone(),
        };
        let handle = Arc::new(Self {
            id,
            user_id,
            role,
            session_id,
            outbound,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            shutdown,
        });
        let receiver = OutboundReceiver {
            receiver,
            final_notice,
            final_items: VecDeque::new(),
            final_taken: false,
            closed: false,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Wraps `event` for this connection's session and enqueues it without blocking.
    pub fn send(&self, event: ServerEvent, class: MessageClass) -> Delivery {
        self.outbound.try_deliver(ServerEnvelope::new(self.session_id, event), class)
    }

    pub fn mark_connected(&self) -> bool {
        self.advance(ConnectionState::Connected)
    }

    pub fn begin_disconnect(&self) -> bool {
        self.advance(ConnectionState::Disconnecting)
    }

    pub fn mark_closed(&self) -> bool {
        self.advance(ConnectionState::Closed)
    }

    /// Moves strictly forward. Nothing leaves `Closed`.
    fn advance(&self, next: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if ConnectionState::from_u8(current) >= next {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!(
                        connection_id = %self.id,
                        session_id = %self.session_id,
                        role = %self.role,
                        from = ?ConnectionState::from_u8(current),
                        to = ?next,
                        "connection state changed"
                    );
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tandem_common::{
        protocol::ws::{ServerEnvelope, ServerEvent},
        types::ParticipantRole,
    };
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::{ConnectionHandle, ConnectionState, Delivery, Outgoing};
    use crate::metrics::MessageClass;

    fn handle(capacity: usize) -> (std::sync::Arc<ConnectionHandle>, super::OutboundReceiver) {
        ConnectionHandle::new(
            Uuid::new_v4(),
            ParticipantRole::Member,
            Uuid::new_v4(),
            capacity,
            CancellationToken::new(),
        )
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let (connection, _queue) = handle(1);
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(connection.mark_connected());
        assert!(!connection.mark_connected());
        assert!(connection.begin_disconnect());
        assert!(connection.mark_closed());
        assert!(!connection.begin_disconnect());
        assert!(!connection.mark_connected());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn failure_before_connect_can_skip_straight_to_disconnecting() {
        let (connection, _queue) = handle(1);
        assert!(connection.begin_disconnect());
        assert!(!connection.mark_connected());
        assert_eq!(connection.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (connection, mut queue) = handle(1);
        assert_eq!(connection.send(ServerEvent::Pong, MessageClass::Control), Delivery::Delivered);
        assert_eq!(connection.send(ServerEvent::Keepalive, MessageClass::Presence), Delivery::Dropped);

        let first = queue.try_recv().expect("first message queued");
        assert!(matches!(first, Outgoing::Message(envelope) if envelope.event == ServerEvent::Pong));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn closed_queue_reports_closed_and_close_is_idempotent() {
        let (connection, mut queue) = handle(4);
        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());
        assert_eq!(connection.send(ServerEvent::Pong, MessageClass::Control), Delivery::Closed);
    }

    #[tokio::test]
    async fn close_marker_queues_behind_pending_messages() {
        let (connection, mut queue) = handle(4);
        connection.send(ServerEvent::Pong, MessageClass::Control);
        assert!(connection.outbound().request_close(1000, "done"));

        assert!(matches!(queue.recv().await, Some(Outgoing::Message(_))));
        assert_eq!(
            queue.recv().await,
            Some(Outgoing::Close { code: 1000, reason: "done".to_string() })
        );
        assert!(!connection.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn close_request_on_full_queue_forces_shutdown() {
        let (connection, _queue) = handle(1);
        connection.send(ServerEvent::Pong, MessageClass::Control);
        assert!(!connection.outbound().request_close(1000, "done"));
        assert!(connection.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn final_notice_follows_pending_messages_when_there_is_room() {
        let (connection, mut queue) = handle(4);
        connection.send(ServerEvent::Pong, MessageClass::Control);
        let ended = ServerEnvelope::new(connection.session_id(), ServerEvent::Keepalive);
        assert_eq!(connection.outbound().deliver_final(ended.clone(), 1000, "bye"), Delivery::Delivered);

        assert!(matches!(queue.recv().await, Some(Outgoing::Message(envelope)) if envelope.event == ServerEvent::Pong));
        assert_eq!(queue.recv().await, Some(Outgoing::Message(ended)));
        assert_eq!(queue.recv().await, Some(Outgoing::Close { code: 1000, reason: "bye".to_string() }));
    }

    #[tokio::test]
    async fn final_notice_overtakes_a_full_queue() {
        let (connection, mut queue) = handle(2);
        while connection.send(ServerEvent::Pong, MessageClass::Control) == Delivery::Delivered {}
        let ended = ServerEnvelope::new(connection.session_id(), ServerEvent::Keepalive);

        assert_eq!(connection.outbound().deliver_final(ended.clone(), 1001, "gone"), Delivery::Delivered);
        assert!(!connection.shutdown_token().is_cancelled());
        assert_eq!(
            connection.outbound().deliver_final(ended.clone(), 1001, "again"),
            Delivery::Dropped
        );

        assert_eq!(queue.recv().await, Some(Outgoing::Message(ended)));
        assert_eq!(queue.recv().await, Some(Outgoing::Close { code: 1001, reason: "gone".to_string() }));
    }

    #[tokio::test]
    async fn waiting_writer_wakes_for_a_final_notice() {
        let (connection, mut queue) = handle(1);
        connection.send(ServerEvent::Pong, MessageClass::Control);
        assert!(matches!(queue.recv().await, Some(Outgoing::Message(_))));

        let pending = tokio::spawn(async move { queue.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let ended = ServerEnvelope::new(connection.session_id(), ServerEvent::Keepalive);
        assert_eq!(connection.outbound().deliver_final(ended.clone(), 1000, "bye"), Delivery::Delivered);

        let received = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("writer side wakes")
            .expect("recv task");
        assert_eq!(received, Some(Outgoing::Message(ended)));
    }

    #[test]
    fn final_notice_to_a_closed_queue_reports_closed() {
        let (connection, mut queue) = handle(2);
        queue.close();
        let ended = ServerEnvelope::new(connection.session_id(), ServerEvent::Keepalive);
        assert_eq!(connection.outbound().deliver_final(ended, 1000, "bye"), Delivery::Closed);
    }

    #[tokio::test]
    async fn data_delivery_waits_for_space_then_drops() {
        let (connection, mut queue) = handle(1);
        let envelope = || ServerEnvelope::new(connection.session_id(), ServerEvent::Keepalive);
        connection.outbound().try_deliver(envelope(), MessageClass::Presence);

        let dropped =
            connection.outbound().deliver_within(envelope(), Duration::from_millis(20)).await;
        assert_eq!(dropped, Delivery::Dropped);

        let outbound = connection.outbound().clone();
        let pending = tokio::spawn({
            let envelope = envelope();
            async move { outbound.deliver_within(envelope, Duration::from_secs(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.recv().await.expect("first message");
        assert_eq!(pending.await.expect("delivery task"), Delivery::Delivered);
    }
}
