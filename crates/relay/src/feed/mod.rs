// Change feed: fans change batches out to per-connection subscriptions.
//
// Sources publish `ChangeBatch`es into a broadcast channel; every
// subscription filters it down to one subject. Postgres deployments pump
// `LISTEN/NOTIFY` payloads into the same channel.

pub mod bridge;

use std::{pin::Pin, sync::Arc, time::Duration};

use futures::{future, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgListener, PgPool};
use tandem_common::types::ChangeEvent;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use bridge::ChangeFeedBridge;

pub const DEFAULT_FEED_CAPACITY: usize = 256;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Changes observed on one subject (an image id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub subject: String,
    pub changes: Vec<ChangeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("subscriber fell behind and skipped {0} batches")]
    Lagged(u64),
}

pub type ChangeSubscription =
    Pin<Box<dyn Stream<Item = Result<Arc<ChangeBatch>, FeedError>> + Send>>;

#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<Arc<ChangeBatch>>,
}

impl ChangeFeed {
    pub fn in_memory(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscriptions saw the batch.
    pub fn publish(&self, batch: ChangeBatch) -> usize {
        self.sender.send(Arc::new(batch)).unwrap_or(0)
    }

    /// Stream of batches for `subject` only. Ends when every feed handle is dropped.
    pub fn subscribe(&self, subject: impl Into<String>) -> ChangeSubscription {
        let subject = subject.into();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |result| {
            let item = match result {
                Ok(batch) if batch.subject == subject => Some(Ok(batch)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    Some(Err(FeedError::Lagged(skipped)))
                }
            };
            future::ready(item)
        });
        Box::pin(stream)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Pumps JSON `ChangeBatch` payloads from a Postgres `LISTEN` channel
    /// into a new feed until `shutdown` fires.
    pub fn listen_postgres(
        pool: PgPool,
        channel: String,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let feed = Self::in_memory(capacity);
        let pump = tokio::spawn(run_postgres_pump(feed.clone(), pool, channel, shutdown));
        (feed, pump)
    }
}

async fn run_postgres_pump(
    feed: ChangeFeed,
    pool: PgPool,
    channel: String,
    shutdown: CancellationToken,
) {
    loop {
        let error = tokio::select! {
            _ = shutdown.cancelled() => return,
            error = pump_notifications(&feed, &pool, &channel) => error,
        };
        warn!(channel = %channel, error = %error, "change feed listener failed; retrying");

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(LISTENER_RETRY_DELAY) => {}
        }
    }
}

/// Runs until the listener errors.
async fn pump_notifications(feed: &ChangeFeed, pool: &PgPool, channel: &str) -> sqlx::Error {
    let mut listener = match PgListener::connect_with(pool).await {
        Ok(listener) => listener,
        Err(error) => return error,
    };
    if let Err(error) = listener.listen(channel).await {
        return error;
    }
    info!(channel, "listening for change notifications");

    loop {
        let notification = match listener.recv().await {
            Ok(notification) => notification,
            Err(error) => return error,
        };
        match decode_notification(notification.payload()) {
            Some(batch) => {
                let delivered = feed.publish(batch);
                debug!(channel, delivered, "change batch published");
            }
            None => warn!(channel, "skipping malformed change notification"),
        }
    }
}

fn decode_notification(payload: &str) -> Option<ChangeBatch> {
    serde_json::from_str::<ChangeBatch>(payload).ok().filter(|batch| !batch.subject.is_empty())
}
