// The only task that writes to a connection's socket.

use std::{fmt::Display, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tandem_common::protocol::ws::{ServerEnvelope, ServerEvent};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::protocol::{encode_envelope, encode_outgoing};
use crate::hub::{ConnectionHandle, OutboundReceiver, Outgoing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    WriteFailed,
    QueueClosed,
    CloseSent,
    Shutdown,
}

/// Drains the outbound queue and keepalive ticks into `sink` until the
/// first failure, a close marker or shutdown. Leaves the connection in
/// `Disconnecting` with the sink and queue closed.
pub async fn run_writer<S>(
    mut sink: S,
    mut queue: OutboundReceiver,
    connection: Arc<ConnectionHandle>,
    keepalive_interval: Duration,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut keepalive = interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = connection.shutdown_token().clone();

    let exit = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break WriterExit::Shutdown,
            item = queue.recv() => {
                let Some(item) = item else {
                    break WriterExit::QueueClosed;
                };
                let is_close = matches!(item, Outgoing::Close { .. });
                let frame = match encode_outgoing(&item) {
                    Ok(frame) => frame,
                    Err(error) => {
                        warn!(connection_id = %connection.id(), error = %error, "failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(error) = sink.send(frame).await {
                    debug!(connection_id = %connection.id(), error = %error, "websocket write failed");
                    break WriterExit::WriteFailed;
                }
                if is_close {
                    break WriterExit::CloseSent;
                }
            }
            _ = keepalive.tick() => {
                if let Err(error) = write_keepalive(&mut sink, &connection).await {
                    debug!(connection_id = %connection.id(), error = %error, "keepalive write failed");
                    break WriterExit::WriteFailed;
                }
            }
        }
    };

    connection.begin_disconnect();
    if let Err(error) = sink.close().await {
        debug!(connection_id = %connection.id(), error = %error, "websocket close failed");
    }
    queue.close();
    exit
}

async fn write_keepalive<S>(sink: &mut S, connection: &ConnectionHandle) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    sink.send(Message::Ping(Default::default())).await.map_err(|error| error.to_string())?;
    let envelope = ServerEnvelope::new(connection.session_id(), ServerEvent::Keepalive);
    let frame = encode_envelope(&envelope).map_err(|error| error.to_string())?;
    sink.send(frame).await.map_err(|error| error.to_string())
}
