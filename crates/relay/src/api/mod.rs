// REST surface for collaborative sessions.
//
// Every route sits behind `require_bearer_auth`; handlers receive the caller
// as `AuthenticatedUser` and hand out join tokens minted by the hub.

mod sessions;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tandem_common::types::ParticipantRole;
use url::Url;
use uuid::Uuid;

use crate::{
    auth::{jwt::AccessTokenService, middleware::require_bearer_auth},
    error::{ErrorCode, RelayError},
    hub::Hub,
    store::SessionRecord,
    ws::handler::upgrade_path,
};

#[derive(Clone)]
struct ApiState {
    hub: Arc<Hub>,
}

pub fn router(hub: Arc<Hub>, access_tokens: Arc<AccessTokenService>) -> Router {
    Router::new()
        .route("/v1/sessions", post(sessions::create_session))
        .route(
            "/v1/sessions/{session_id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/v1/sessions/{session_id}/owner-token", post(sessions::owner_token))
        .route("/v1/sessions/{session_id}/join", post(sessions::join_session))
        .with_state(ApiState { hub })
        .route_layer(middleware::from_fn_with_state(access_tokens, require_bearer_auth))
}

/// Absolute upgrade URL for `role`, with the join token in the query.
fn upgrade_url(
    ws_base_url: &str,
    session_id: Uuid,
    role: ParticipantRole,
    token: &str,
) -> Result<String, RelayError> {
    let mut url = Url::parse(ws_base_url)
        .and_then(|base| base.join(&upgrade_path(session_id, role)))
        .map_err(|error| {
            tracing::error!(ws_base_url, error = %error, "invalid websocket base url");
            RelayError::from_code(ErrorCode::InternalError)
        })?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

fn require_owner(record: &SessionRecord, user_id: Uuid) -> Result<(), RelayError> {
    if record.owner_id != user_id {
        return Err(RelayError::new(
            ErrorCode::AuthForbidden,
            "only the session owner may do this",
        ));
    }
    Ok(())
}
