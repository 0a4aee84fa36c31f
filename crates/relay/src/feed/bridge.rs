// Per-connection change forwarding, owned by the connection's reader.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tandem_common::protocol::ws::{ServerEnvelope, ServerEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChangeFeed, ChangeSubscription, FeedError};
use crate::{
    hub::{ConnectionHandle, Delivery},
    metrics::MessageClass,
};

struct ActiveForward {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ChangeFeedBridge {
    feed: ChangeFeed,
    connection: Arc<ConnectionHandle>,
    data_send_timeout: Duration,
    subject: String,
    active: Option<ActiveForward>,
}

impl ChangeFeedBridge {
    pub fn new(feed: ChangeFeed, connection: Arc<ConnectionHandle>, data_send_timeout: Duration) -> Self {
        Self { feed, connection, data_send_timeout, subject: String::new(), active: None }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_forwarding(&self) -> bool {
        self.active.is_some()
    }

    /// Retargets forwarding to `subject` and acknowledges with `watching`.
    ///
    /// The previous forwarder has fully stopped before the acknowledgement is
    /// queued, so no batch for the old subject can follow it. An empty subject
    /// stops forwarding.
    pub async fn switch_subject(&mut self, subject: String) -> Delivery {
        let unchanged = subject == self.subject && (self.active.is_some() || subject.is_empty());
        if !unchanged {
            self.stop().await;
            self.subject = subject.clone();
            if !subject.is_empty() {
                self.start();
            }
            debug!(
                connection_id = %self.connection.id(),
                subject = %self.subject,
                "change feed subject switched"
            );
        }

        self.connection.send(ServerEvent::Watching { image_id: subject }, MessageClass::Control)
    }

    /// Cancels the forwarder and waits for it to exit.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();
        if let Err(error) = active.task.await {
            warn!(connection_id = %self.connection.id(), error = %error, "change forwarder panicked");
        }
    }

    fn start(&mut self) {
        // Subscribe before acknowledging so nothing published after the ack is missed.
        let subscription = self.feed.subscribe(self.subject.clone());
        let cancel = self.connection.shutdown_token().child_token();
        let task = tokio::spawn(forward_changes(
            subscription,
            self.subject.clone(),
            self.connection.clone(),
            self.data_send_timeout,
            cancel.clone(),
        ));
        self.active = Some(ActiveForward { cancel, task });
    }
}

async fn forward_changes(
    mut subscription: ChangeSubscription,
    subject: String,
    connection: Arc<ConnectionHandle>,
    data_send_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = subscription.next() => next,
        };

        let batch = match next {
            None => {
                debug!(connection_id = %connection.id(), subject = %subject, "change feed closed");
                return;
            }
            Some(Err(FeedError::Lagged(skipped))) => {
                warn!(connection_id = %connection.id(), subject = %subject, skipped, "change subscription lagged");
                continue;
            }
            Some(Ok(batch)) => batch,
        };

        let envelope = ServerEnvelope::new(
            connection.session_id(),
            ServerEvent::ChangeBatch { image_id: subject.clone(), changes: batch.changes.clone() },
        );
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            delivery = connection.outbound().deliver_within(envelope, data_send_timeout) => delivery,
        };
        if delivery == Delivery::Closed {
            return;
        }
    }
}
