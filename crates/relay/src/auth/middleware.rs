use crate::{
    auth::jwt::AccessTokenService,
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Injected into request extensions by [`require_bearer_auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
}

pub async fn require_bearer_auth(
    State(access_tokens): State<Arc<AccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let user_id = match access_tokens.validate_access_token(token) {
        Ok(user_id) => user_id,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser { user_id });

    next.run(request).await
}

pub(crate) fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
