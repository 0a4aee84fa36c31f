// Per-connection inbound loop: decodes control frames and dispatches them.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{close_code, Message};
use futures::{Stream, StreamExt};
use tandem_common::protocol::ws::{ClientMessage, ServerEvent};
use tracing::{debug, warn};

use super::protocol::{decode_client_frame, is_frame_size_violation};
use crate::{feed::ChangeFeedBridge, hub::ConnectionHandle, metrics::MessageClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    CloseReceived,
    StreamEnded,
    ReadFailed,
    DeadlineExceeded,
    Shutdown,
}

/// Reads until close, error, deadline expiry or shutdown. Every received
/// frame (pongs included) refreshes the deadline. On exit the bridge is
/// stopped and the writer is woken to run cleanup.
pub async fn run_reader<S>(
    mut stream: S,
    connection: Arc<ConnectionHandle>,
    mut bridge: ChangeFeedBridge,
    read_timeout: Duration,
) -> ReaderExit
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let shutdown = connection.shutdown_token().clone();
    let mut close_queued = false;

    let exit = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break ReaderExit::Shutdown,
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(connection_id = %connection.id(), "read deadline exceeded");
                break ReaderExit::DeadlineExceeded;
            }
            Ok(None) => break ReaderExit::StreamEnded,
            Ok(Some(Err(error))) => {
                if is_frame_size_violation(&error) {
                    close_queued =
                        connection.outbound().request_close(close_code::SIZE, "frame too large");
                }
                debug!(connection_id = %connection.id(), error = %error, "websocket read failed");
                break ReaderExit::ReadFailed;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => dispatch(text.as_str(), &connection, &mut bridge).await,
            Message::Binary(_) => {
                warn!(connection_id = %connection.id(), "ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break ReaderExit::CloseReceived,
        }
    };

    bridge.stop().await;
    connection.begin_disconnect();
    // A queued close marker ends the writer on its own; cancelling now could
    // beat it to the socket.
    if !close_queued {
        shutdown.cancel();
    }
    exit
}

async fn dispatch(raw: &str, connection: &ConnectionHandle, bridge: &mut ChangeFeedBridge) {
    match decode_client_frame(raw) {
        Ok(ClientMessage::SetImageId { image_id }) => {
            bridge.switch_subject(image_id).await;
        }
        Ok(ClientMessage::Ping) => {
            connection.send(ServerEvent::Pong, MessageClass::Control);
        }
        Ok(ClientMessage::Unknown { kind }) => {
            warn!(connection_id = %connection.id(), kind = %kind, "ignoring unknown client message");
        }
        Err(error) => {
            warn!(connection_id = %connection.id(), error = %error, "ignoring malformed client frame");
        }
    }
}
