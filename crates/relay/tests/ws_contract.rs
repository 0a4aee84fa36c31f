use tandem_common::types::ParticipantRole;
use tandem_relay::{
    config::{
        DEFAULT_DATA_SEND_TIMEOUT_MS, DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_MAX_FRAME_BYTES,
        DEFAULT_OUTBOUND_QUEUE_CAPACITY, DEFAULT_READ_TIMEOUT_MS,
    },
    error::{HubError, CLOSE_SESSION_CONFLICT, CLOSE_SESSION_NOT_FOUND},
    ws::handler::upgrade_path,
};
use uuid::Uuid;

const WRITER_SOURCE: &str = include_str!("../src/ws/writer.rs");
const READER_SOURCE: &str = include_str!("../src/ws/reader.rs");
const TEARDOWN_SOURCE: &str = include_str!("../src/hub/teardown.rs");

#[test]
fn keepalive_and_read_deadline_defaults_match_contract() {
    assert_eq!(DEFAULT_KEEPALIVE_INTERVAL_MS, 15_000);
    assert_eq!(DEFAULT_READ_TIMEOUT_MS, 40_000);
    assert!(
        DEFAULT_READ_TIMEOUT_MS > DEFAULT_KEEPALIVE_INTERVAL_MS * 2,
        "a silent peer must miss more than one keepalive before the deadline fires",
    );
    assert_eq!(DEFAULT_OUTBOUND_QUEUE_CAPACITY, 16);
    assert_eq!(DEFAULT_DATA_SEND_TIMEOUT_MS, 250);
    assert_eq!(DEFAULT_MAX_FRAME_BYTES, 65_536);
}

#[test]
fn close_codes_match_contract() {
    assert_eq!(CLOSE_SESSION_CONFLICT, 4409);
    assert_eq!(CLOSE_SESSION_NOT_FOUND, 4404);
    assert_eq!(HubError::Conflict.close_code(), 4409);
    assert_eq!(HubError::NotFound.close_code(), 4404);
    assert_eq!(HubError::ShuttingDown.close_code(), 1012);
    assert_eq!(HubError::Auth("expired".into()).close_code(), 1008);
}

#[test]
fn upgrade_paths_match_contract() {
    let session_id = Uuid::new_v4();
    assert_eq!(
        upgrade_path(session_id, ParticipantRole::Owner),
        format!("/v1/ws/sessions/{session_id}/create")
    );
    assert_eq!(
        upgrade_path(session_id, ParticipantRole::Member),
        format!("/v1/ws/sessions/{session_id}/join")
    );
}

#[test]
fn writer_is_the_only_socket_writer() {
    assert!(WRITER_SOURCE.contains("sink.send(frame)"));
    assert!(
        !READER_SOURCE.contains(".send(Message::"),
        "the reader must hand replies to the outbound queue, never the socket",
    );
    assert!(
        !TEARDOWN_SOURCE.contains("Message::Close"),
        "teardown must request closes through the queue",
    );
}

#[test]
fn end_of_session_closes_use_normal_and_restart_codes() {
    assert!(TEARDOWN_SOURCE.contains("SessionEndReason::ServerShutdown => (close_code::RESTART"));
    assert!(TEARDOWN_SOURCE.contains("SessionEndReason::OwnerLeft => (close_code::NORMAL"));
    assert!(TEARDOWN_SOURCE.contains("SessionEndReason::Deleted => (close_code::NORMAL"));
}
