use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tandem_common::{
    protocol::{
        rest::SessionTokenResponse,
        ws::{ClientMessage, ServerEnvelope, ServerEvent, SessionEndReason},
    },
    types::{ChangeEvent, ChangeOperation},
};
use tandem_relay::{
    auth::{
        join_token::JoinTokenAuthority, jwt::AccessTokenService,
        primary::PrimaryCredentialVerifier,
    },
    config::HubConfig,
    feed::{ChangeBatch, ChangeFeed},
    hub::Hub,
    metrics::RelayMetrics,
    server::{build_router, RouterOptions},
    store::SessionStore,
};
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest, http::HeaderValue, Error as WsError, Message as WsFrame,
    },
    MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;
use uuid::Uuid;

const ACCESS_SECRET: &str = "tandem_access_secret_that_is_definitely_long_enough";
const JOIN_SECRET: &str = "tandem_join_secret_that_is_definitely_long_enough";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct RelayHarness {
    app: Router,
    hub: Arc<Hub>,
    feed: ChangeFeed,
    access_tokens: Arc<AccessTokenService>,
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl RelayHarness {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");

        let access_tokens =
            Arc::new(AccessTokenService::new(ACCESS_SECRET).expect("access token service"));
        let join_tokens =
            Arc::new(JoinTokenAuthority::new(JOIN_SECRET).expect("join token authority"));
        let feed = ChangeFeed::in_memory(64);
        let hub = Hub::new(
            HubConfig {
                keepalive_interval: Duration::from_secs(30),
                read_timeout: Duration::from_secs(60),
                ws_base_url: format!("ws://{addr}"),
                ..HubConfig::default()
            },
            join_tokens,
            PrimaryCredentialVerifier::new(access_tokens.clone()),
            SessionStore::in_memory(),
            feed.clone(),
        );
        let app = build_router(
            hub.clone(),
            RouterOptions {
                access_tokens: access_tokens.clone(),
                metrics: Arc::new(RelayMetrics::default()),
                max_frame_bytes: 4_096,
                cors_origins: None,
            },
        );

        let served = app.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, served).await.expect("relay server should run for the test");
        });

        Self { app, hub, feed, access_tokens, addr, server }
    }

    fn credential(&self, user_id: Uuid) -> String {
        self.access_tokens.issue_access_token(user_id).expect("access token should be issued")
    }

    async fn rest(
        &self,
        method: Method,
        uri: &str,
        user_id: Uuid,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {}", self.credential(user_id)));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");

        self.app.clone().oneshot(request).await.expect("request should return a response")
    }

    async fn create_session(&self, owner: Uuid) -> SessionTokenResponse {
        let response = self
            .rest(
                Method::POST,
                "/v1/sessions",
                owner,
                Some(serde_json::json!({ "batchID": Uuid::new_v4() })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await
    }

    async fn join_token(&self, session_id: Uuid, member: Uuid) -> SessionTokenResponse {
        let response =
            self.rest(Method::POST, &format!("/v1/sessions/{session_id}/join"), member, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await
    }

    /// Connects with the primary credential in the `Authorization` header.
    async fn connect_with_header(
        &self,
        ws_url: &str,
        user_id: Uuid,
    ) -> Result<ClientSocket, WsError> {
        let mut request = ws_url.into_client_request().expect("client request should build");
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.credential(user_id)))
                .expect("header value"),
        );
        connect_async(request).await.map(|(socket, _)| socket)
    }

    /// Connects with the primary credential in the `access_token` query value.
    async fn connect_with_query(
        &self,
        ws_url: &str,
        user_id: Uuid,
    ) -> Result<ClientSocket, WsError> {
        let url = format!("{ws_url}&access_token={}", self.credential(user_id));
        connect_async(url.as_str()).await.map(|(socket, _)| socket)
    }
}

impl Drop for RelayHarness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
    serde_json::from_slice(&bytes).expect("body should be json")
}

async fn send(socket: &mut ClientSocket, message: ClientMessage) {
    let raw = message.encode().expect("client message should encode");
    socket.send(WsFrame::Text(raw.into())).await.expect("client frame should send");
}

/// Next server envelope, skipping transport-level ping/pong frames.
async fn recv_event(socket: &mut ClientSocket) -> ServerEvent {
    loop {
        let frame = timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a server frame")
            .expect("socket closed before a server frame")
            .expect("server frame should be readable");
        match frame {
            WsFrame::Text(raw) => {
                let envelope: ServerEnvelope =
                    serde_json::from_str(raw.as_str()).expect("server frame should be an envelope");
                return envelope.event;
            }
            WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Close code of the next close frame, skipping transport-level ping/pong frames.
async fn recv_close(socket: &mut ClientSocket) -> u16 {
    loop {
        let frame = timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a close frame")
            .expect("socket ended without a close frame")
            .expect("close frame should be readable");
        match frame {
            WsFrame::Close(Some(close)) => return u16::from(close.code),
            WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

fn assert_http_status(result: Result<ClientSocket, WsError>, expected: u16) {
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), expected),
        Err(other) => panic!("expected an HTTP {expected} refusal, got {other}"),
        Ok(_) => panic!("expected an HTTP {expected} refusal, but the upgrade succeeded"),
    }
}

async fn wait_for_session_count(hub: &Hub, expected: usize) {
    timeout(RECV_TIMEOUT, async {
        while hub.session_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for the session registry");
}

#[tokio::test]
async fn owner_and_members_follow_the_session_lifecycle() {
    let relay = RelayHarness::start().await;
    let owner = Uuid::new_v4();
    let created = relay.create_session(owner).await;
    let mut owner_socket =
        relay.connect_with_header(&created.ws_url, owner).await.expect("owner should connect");
    wait_for_session_count(&relay.hub, 1).await;

    let first_member = Uuid::new_v4();
    let joined = relay.join_token(created.session_id, first_member).await;
    let mut first_socket = relay
        .connect_with_query(&joined.ws_url, first_member)
        .await
        .expect("first member should connect");
    assert_eq!(
        recv_event(&mut owner_socket).await,
        ServerEvent::MemberJoined { member_id: first_member }
    );

    let second_member = Uuid::new_v4();
    let joined = relay.join_token(created.session_id, second_member).await;
    let mut second_socket = relay
        .connect_with_query(&joined.ws_url, second_member)
        .await
        .expect("second member should connect");
    assert_eq!(
        recv_event(&mut owner_socket).await,
        ServerEvent::MemberJoined { member_id: second_member }
    );
    assert_eq!(
        recv_event(&mut first_socket).await,
        ServerEvent::MemberJoined { member_id: second_member }
    );

    send(&mut first_socket, ClientMessage::Ping).await;
    assert_eq!(recv_event(&mut first_socket).await, ServerEvent::Pong);

    first_socket.close(None).await.expect("first member should close");
    assert_eq!(
        recv_event(&mut owner_socket).await,
        ServerEvent::MemberLeft { member_id: first_member }
    );
    assert_eq!(
        recv_event(&mut second_socket).await,
        ServerEvent::MemberLeft { member_id: first_member }
    );

    owner_socket.close(None).await.expect("owner should close");
    assert_eq!(
        recv_event(&mut second_socket).await,
        ServerEvent::SessionEnded { reason: SessionEndReason::OwnerLeft }
    );
    assert_eq!(recv_close(&mut second_socket).await, 1000);
    wait_for_session_count(&relay.hub, 0).await;

    // The record outlives the live session, so a join token is still issued,
    // but there is nothing left to join until the owner comes back.
    let late_member = Uuid::new_v4();
    let late = relay.join_token(created.session_id, late_member).await;
    assert_http_status(relay.connect_with_query(&late.ws_url, late_member).await, 404);
}

#[tokio::test]
async fn watched_subject_receives_only_its_change_batches() {
    let relay = RelayHarness::start().await;
    let owner = Uuid::new_v4();
    let created = relay.create_session(owner).await;
    let mut owner_socket =
        relay.connect_with_header(&created.ws_url, owner).await.expect("owner should connect");

    send(&mut owner_socket, ClientMessage::SetImageId { image_id: "img-1".into() }).await;
    assert_eq!(
        recv_event(&mut owner_socket).await,
        ServerEvent::Watching { image_id: "img-1".into() }
    );

    let change = ChangeEvent {
        operation: ChangeOperation::Insert,
        document_id: "label-1".into(),
        document: Some(serde_json::json!({ "x": 4 })),
    };
    relay.feed.publish(ChangeBatch { subject: "img-2".into(), changes: vec![change.clone()] });
    relay.feed.publish(ChangeBatch { subject: "img-1".into(), changes: vec![change.clone()] });
    assert_eq!(
        recv_event(&mut owner_socket).await,
        ServerEvent::ChangeBatch { image_id: "img-1".into(), changes: vec![change.clone()] }
    );

    send(&mut owner_socket, ClientMessage::SetImageId { image_id: "img-2".into() }).await;
    assert_eq!(
        recv_event(&mut owner_socket).await,
        ServerEvent::Watching { image_id: "img-2".into() }
    );
    relay.feed.publish(ChangeBatch { subject: "img-1".into(), changes: vec![change.clone()] });
    relay.feed.publish(ChangeBatch { subject: "img-2".into(), changes: vec![change.clone()] });
    assert_eq!(
        recv_event(&mut owner_socket).await,
        ServerEvent::ChangeBatch { image_id: "img-2".into(), changes: vec![change] }
    );
}

#[tokio::test]
async fn upgrades_are_refused_before_the_socket_opens() {
    let relay = RelayHarness::start().await;
    let owner = Uuid::new_v4();
    let first = relay.create_session(owner).await;
    let second = relay.create_session(owner).await;

    // A token minted for the first session is useless on the second.
    let foreign = first.ws_url.replace(
        &first.session_id.to_string(),
        &second.session_id.to_string(),
    );
    assert_http_status(relay.connect_with_header(&foreign, owner).await, 401);

    // Missing primary credential.
    assert_http_status(connect_async(first.ws_url.as_str()).await.map(|(socket, _)| socket), 401);

    // Members cannot join a session whose owner never connected.
    let member = Uuid::new_v4();
    let joined = relay.join_token(first.session_id, member).await;
    assert_http_status(relay.connect_with_query(&joined.ws_url, member).await, 404);

    let _owner_socket =
        relay.connect_with_header(&first.ws_url, owner).await.expect("owner should connect");
    wait_for_session_count(&relay.hub, 1).await;

    // The refused attempt did not spend the token; the first use after that does.
    let _member_socket =
        relay.connect_with_query(&joined.ws_url, member).await.expect("member should connect");
    assert_http_status(relay.connect_with_query(&joined.ws_url, member).await, 401);

    // A second owner connection conflicts with the live one.
    let again = relay
        .rest(Method::POST, &format!("/v1/sessions/{}/owner-token", first.session_id), owner, None)
        .await;
    let again: SessionTokenResponse = json_body(again).await;
    assert_http_status(relay.connect_with_header(&again.ws_url, owner).await, 409);

    let no_token = format!("ws://{}/v1/ws/sessions/{}/join", relay.addr, first.session_id);
    assert_http_status(connect_async(no_token.as_str()).await.map(|(socket, _)| socket), 401);
}

#[tokio::test]
async fn deleting_a_session_ends_it_for_everyone() {
    let relay = RelayHarness::start().await;
    let owner = Uuid::new_v4();
    let created = relay.create_session(owner).await;
    let mut owner_socket =
        relay.connect_with_header(&created.ws_url, owner).await.expect("owner should connect");
    wait_for_session_count(&relay.hub, 1).await;

    let member = Uuid::new_v4();
    let joined = relay.join_token(created.session_id, member).await;
    let mut member_socket =
        relay.connect_with_query(&joined.ws_url, member).await.expect("member should connect");
    assert_eq!(recv_event(&mut owner_socket).await, ServerEvent::MemberJoined { member_id: member });

    let response = relay
        .rest(Method::DELETE, &format!("/v1/sessions/{}", created.session_id), owner, None)
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let ended = ServerEvent::SessionEnded { reason: SessionEndReason::Deleted };
    assert_eq!(recv_event(&mut owner_socket).await, ended);
    assert_eq!(recv_event(&mut member_socket).await, ended);
    assert_eq!(recv_close(&mut owner_socket).await, 1000);
    assert_eq!(recv_close(&mut member_socket).await, 1000);
}

#[tokio::test]
async fn shutdown_ends_sessions_and_refuses_new_upgrades() {
    let relay = RelayHarness::start().await;
    let owner = Uuid::new_v4();
    let created = relay.create_session(owner).await;
    let mut owner_socket =
        relay.connect_with_header(&created.ws_url, owner).await.expect("owner should connect");
    wait_for_session_count(&relay.hub, 1).await;

    let other_owner = Uuid::new_v4();
    let pending = relay.create_session(other_owner).await;

    relay.hub.shutdown().await;

    assert_eq!(
        recv_event(&mut owner_socket).await,
        ServerEvent::SessionEnded { reason: SessionEndReason::ServerShutdown }
    );
    assert_eq!(recv_close(&mut owner_socket).await, 1012);
    assert_eq!(relay.hub.session_count().await, 0);
    assert_http_status(relay.connect_with_header(&pending.ws_url, other_owner).await, 503);
}

#[tokio::test]
async fn oversized_frames_close_the_connection() {
    let relay = RelayHarness::start().await;
    let owner = Uuid::new_v4();
    let created = relay.create_session(owner).await;
    let mut owner_socket =
        relay.connect_with_header(&created.ws_url, owner).await.expect("owner should connect");
    wait_for_session_count(&relay.hub, 1).await;

    let oversized = ClientMessage::SetImageId { image_id: "x".repeat(8_192) };
    send(&mut owner_socket, oversized).await;

    assert_eq!(recv_close(&mut owner_socket).await, 1009);
    wait_for_session_count(&relay.hub, 0).await;
}
