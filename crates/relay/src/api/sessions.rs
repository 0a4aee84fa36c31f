use axum::{
    extract::{Extension, Json, Path, State},
    http::StatusCode,
};
use tandem_common::{
    protocol::{
        rest::{CreateSessionRequest, SessionStatusResponse, SessionTokenResponse},
        ws::SessionEndReason,
    },
    types::ParticipantRole,
};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::middleware::AuthenticatedUser,
    error::{ErrorCode, RelayError},
    store::StoreError,
};

use super::{require_owner, upgrade_url, ApiState};

pub(super) async fn create_session(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionTokenResponse>), RelayError> {
    let record = state.hub.store().create_session(user.user_id, payload.batch_id).await?;
    info!(
        session_id = %record.id,
        batch_id = %record.batch_id,
        user_id = %user.user_id,
        "session record created"
    );

    let response = token_response(&state, user.user_id, record.id, Some(record.batch_id))?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Fresh owner token for an existing record, used when the owner reconnects.
pub(super) async fn owner_token(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionTokenResponse>, RelayError> {
    let record = state.hub.store().fetch_session(session_id).await?;
    require_owner(&record, user.user_id)?;

    Ok(Json(token_response(&state, user.user_id, record.id, Some(record.batch_id))?))
}

pub(super) async fn join_session(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionTokenResponse>, RelayError> {
    let record = state.hub.store().fetch_session(session_id).await?;
    if record.owner_id == user.user_id {
        return Err(RelayError::new(
            ErrorCode::SessionConflict,
            "the owner reconnects with an owner token",
        ));
    }

    state.hub.store().add_member(session_id, user.user_id).await?;
    Ok(Json(token_response(&state, user.user_id, session_id, None)?))
}

pub(super) async fn get_session(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatusResponse>, RelayError> {
    let record = state.hub.store().fetch_session(session_id).await?;
    if !state.hub.store().is_member(session_id, user.user_id).await? {
        return Err(RelayError::new(ErrorCode::AuthForbidden, "caller is not a participant"));
    }

    let snapshot = state.hub.session_snapshot(session_id).await;
    Ok(Json(SessionStatusResponse {
        session_id,
        batch_id: record.batch_id,
        live: snapshot.is_some(),
        owner_connected: snapshot.as_ref().is_some_and(|snapshot| snapshot.owner_connected),
        member_count: snapshot.map(|snapshot| snapshot.member_count).unwrap_or_default(),
    }))
}

pub(super) async fn delete_session(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, RelayError> {
    let record = state.hub.store().fetch_session(session_id).await?;
    require_owner(&record, user.user_id)?;

    match state.hub.store().delete_session(session_id).await {
        Ok(()) | Err(StoreError::NotFound) => {}
        Err(error) => return Err(error.into()),
    }
    let was_live = state.hub.end_session(session_id, SessionEndReason::Deleted).await;
    info!(session_id = %session_id, user_id = %user.user_id, was_live, "session deleted");

    Ok(StatusCode::NO_CONTENT)
}

fn token_response(
    state: &ApiState,
    user_id: Uuid,
    session_id: Uuid,
    batch_id: Option<Uuid>,
) -> Result<SessionTokenResponse, RelayError> {
    let role = if batch_id.is_some() { ParticipantRole::Owner } else { ParticipantRole::Member };
    let issued = state
        .hub
        .issue_join_token(user_id, session_id, batch_id)
        .map_err(|error| {
            tracing::error!(session_id = %session_id, error = %error, "failed to issue join token");
            RelayError::from_code(ErrorCode::InternalError)
        })?;
    let ws_url = upgrade_url(&state.hub.config().ws_base_url, session_id, role, &issued.token)?;

    Ok(SessionTokenResponse {
        session_id,
        token: issued.token,
        expires_in: issued.expires_in,
        ws_url,
    })
}
