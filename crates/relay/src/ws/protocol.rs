use axum::extract::ws::{CloseFrame, Message};
use tandem_common::protocol::ws::{ClientFrameError, ClientMessage, ServerEnvelope};

use crate::hub::Outgoing;

pub fn decode_client_frame(raw: &str) -> Result<ClientMessage, ClientFrameError> {
    ClientMessage::decode(raw)
}

pub fn encode_envelope(envelope: &ServerEnvelope) -> Result<Message, serde_json::Error> {
    let encoded = serde_json::to_string(envelope)?;
    Ok(Message::Text(encoded.into()))
}

pub fn close_message(code: u16, reason: impl Into<String>) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into().into() }))
}

/// Socket frame for a queued item.
pub fn encode_outgoing(item: &Outgoing) -> Result<Message, serde_json::Error> {
    match item {
        Outgoing::Message(envelope) => encode_envelope(envelope),
        Outgoing::Close { code, reason } => Ok(close_message(*code, reason.clone())),
    }
}

pub(crate) fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}
