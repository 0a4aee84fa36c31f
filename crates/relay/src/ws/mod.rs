// WebSocket side of the hub: upgrade routes and per-connection task pair.

pub mod handler;
pub mod protocol;
pub mod reader;
pub mod writer;

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::{
    error::HubError,
    feed::ChangeFeedBridge,
    hub::{Attachment, Hub},
};

pub use handler::router;

/// Runs one attached connection to completion.
///
/// The reader runs as its own task; the writer runs here and owns the sink.
/// Whichever side stops first, cleanup converges below: cancel the
/// connection's token, join the reader, run departure, mark closed.
pub async fn run_connection(hub: Arc<Hub>, socket: WebSocket, attachment: Attachment) {
    let Attachment { connection, receiver, .. } = attachment;
    let config = hub.config().clone();
    connection.mark_connected();

    let (sink, stream) = socket.split();
    let bridge =
        ChangeFeedBridge::new(hub.feed().clone(), connection.clone(), config.data_send_timeout);
    let reader = tokio::spawn(reader::run_reader(
        stream,
        connection.clone(),
        bridge,
        config.read_timeout,
    ));

    let writer_exit =
        writer::run_writer(sink, receiver, connection.clone(), config.keepalive_interval).await;

    connection.shutdown_token().cancel();
    let reader_exit = match reader.await {
        Ok(exit) => Some(exit),
        Err(error) => {
            warn!(connection_id = %connection.id(), error = %error, "reader task panicked");
            None
        }
    };

    let outcome = hub.depart(&connection).await;
    connection.mark_closed();
    hub.connection_released(&connection);
    debug!(
        session_id = %connection.session_id(),
        connection_id = %connection.id(),
        user_id = %connection.user_id(),
        role = %connection.role(),
        writer_exit = ?writer_exit,
        reader_exit = ?reader_exit,
        outcome = outcome.as_str(),
        "connection closed"
    );
}

/// Closes an upgraded socket that failed to attach. No connection survives.
pub async fn reject_socket(mut socket: WebSocket, error: &HubError) {
    let code = error.close_code();
    if let Err(send_error) =
        socket.send(protocol::close_message(code, error.to_string())).await
    {
        debug!(error = %send_error, close_code = code, "failed to send rejection close frame");
    }
}
