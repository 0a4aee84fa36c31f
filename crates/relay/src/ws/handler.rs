use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tandem_common::types::ParticipantRole;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    auth::primary::upgrade_credential,
    error::{current_request_id, with_request_id_scope, ErrorCode, HubError, RelayError},
    hub::{Admission, Hub},
    metrics,
};

#[derive(Clone)]
struct UpgradeState {
    hub: Arc<Hub>,
    max_frame_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct UpgradeQuery {
    token: Option<String>,
    access_token: Option<String>,
}

pub fn router(hub: Arc<Hub>, max_frame_bytes: usize) -> Router {
    Router::new()
        .route("/v1/ws/sessions/{session_id}/create", get(create_upgrade))
        .route("/v1/ws/sessions/{session_id}/join", get(join_upgrade))
        .with_state(UpgradeState { hub, max_frame_bytes })
}

/// Path of the upgrade endpoint a token of `role` is meant for.
pub fn upgrade_path(session_id: Uuid, role: ParticipantRole) -> String {
    let action = match role {
        ParticipantRole::Owner => "create",
        ParticipantRole::Member => "join",
    };
    format!("/v1/ws/sessions/{session_id}/{action}")
}

async fn create_upgrade(
    Path(session_id): Path<Uuid>,
    Query(query): Query<UpgradeQuery>,
    State(state): State<UpgradeState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ParticipantRole::Owner, session_id, query, state, headers, ws).await
}

async fn join_upgrade(
    Path(session_id): Path<Uuid>,
    Query(query): Query<UpgradeQuery>,
    State(state): State<UpgradeState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ParticipantRole::Member, session_id, query, state, headers, ws).await
}

async fn upgrade(
    role: ParticipantRole,
    session_id: Uuid,
    query: UpgradeQuery,
    state: UpgradeState,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token.as_deref().filter(|token| !token.is_empty()) else {
        metrics::record_upgrade_rejected("missing_token");
        return RelayError::new(ErrorCode::AuthInvalidToken, "missing join token").into_response();
    };
    let credential = upgrade_credential(&headers, query.access_token.as_deref());

    let authorized = match role {
        ParticipantRole::Owner => state.hub.authorize_owner(session_id, token, credential).await,
        ParticipantRole::Member => state.hub.authorize_member(session_id, token, credential).await,
    };
    let admission = match authorized {
        Ok(admission) => admission,
        Err(error) => {
            metrics::record_upgrade_rejected(rejection_reason(&error));
            debug!(session_id = %session_id, role = %role, error = %error, "upgrade refused");
            return RelayError::from(error).into_response();
        }
    };

    let hub = state.hub.clone();
    let request_id = current_request_id().unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.max_frame_size(state.max_frame_bytes)
        .max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| {
            with_request_id_scope(request_id, attach_socket(hub, admission, socket))
        })
}

async fn attach_socket(hub: Arc<Hub>, admission: Admission, socket: axum::extract::ws::WebSocket) {
    let attached = match admission.role() {
        ParticipantRole::Owner => hub.create_session(&admission).await,
        ParticipantRole::Member => hub.join_session(&admission).await,
    };
    match attached {
        Ok(attachment) => super::run_connection(hub, socket, attachment).await,
        Err(error) => {
            metrics::record_upgrade_rejected(rejection_reason(&error));
            warn!(
                session_id = %admission.session_id(),
                user_id = %admission.user_id(),
                role = %admission.role(),
                error = %error,
                "upgraded socket could not attach"
            );
            super::reject_socket(socket, &error).await;
        }
    }
}

fn rejection_reason(error: &HubError) -> &'static str {
    match error {
        HubError::Auth(_) => "auth",
        HubError::Conflict => "conflict",
        HubError::NotFound => "not_found",
        HubError::ShuttingDown => "shutting_down",
        HubError::Store(_) => "store",
    }
}

#[cfg(test)]
mod tests {
    use tandem_common::types::ParticipantRole;
    use uuid::Uuid;

    use super::upgrade_path;

    #[test]
    fn upgrade_paths_match_routes() {
        let id = Uuid::nil();
        assert_eq!(
            upgrade_path(id, ParticipantRole::Owner),
            "/v1/ws/sessions/00000000-0000-0000-0000-000000000000/create"
        );
        assert_eq!(
            upgrade_path(id, ParticipantRole::Member),
            "/v1/ws/sessions/00000000-0000-0000-0000-000000000000/join"
        );
    }
}
