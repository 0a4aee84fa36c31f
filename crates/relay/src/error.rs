use std::future::Future;

use axum::{
    extract::ws::close_code,
    http::{header, header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::{auth::join_token::JoinTokenError, store::StoreError};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application close code sent when an owner slot is already taken.
pub const CLOSE_SESSION_CONFLICT: u16 = 4409;
/// Application close code sent when the session no longer exists.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4404;

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    SessionConflict,
    BatchInUse,
    ShuttingDown,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::SessionConflict => "SESSION_CONFLICT",
            Self::BatchInUse => "BATCH_IN_USE",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::SessionConflict | Self::BatchInUse => StatusCode::CONFLICT,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::SessionConflict => "session already has an owner",
            Self::BatchInUse => "batch already has a session",
            Self::ShuttingDown => "server is shutting down",
            Self::InternalError => "internal server error",
        }
    }
}

/// HTTP-facing error. Rendered as a plain-text body `"<CODE>: <message>"`.
#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(default_code_for_status(status), message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.clone().or_else(current_request_id);

        let mut response = (
            self.code.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub fn default_code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => ErrorCode::ValidationFailed,
        StatusCode::UNAUTHORIZED => ErrorCode::AuthInvalidToken,
        StatusCode::FORBIDDEN => ErrorCode::AuthForbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::SessionConflict,
        StatusCode::SERVICE_UNAVAILABLE => ErrorCode::ShuttingDown,
        _ => ErrorCode::InternalError,
    }
}

/// Failures from hub admission. Refuses the upgrade before it happens, or
/// closes the socket with [`HubError::close_code`] when detected after.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("session already has an owner")]
    Conflict,
    #[error("session not found")]
    NotFound,
    #[error("hub is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HubError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Auth(_) => ErrorCode::AuthInvalidToken,
            Self::Conflict => ErrorCode::SessionConflict,
            Self::NotFound => ErrorCode::NotFound,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::Store(StoreError::NotFound) => ErrorCode::NotFound,
            Self::Store(StoreError::BatchInUse) => ErrorCode::BatchInUse,
            Self::Store(StoreError::Backend(_)) => ErrorCode::InternalError,
        }
    }

    pub fn close_code(&self) -> u16 {
        match self {
            Self::Auth(_) => close_code::POLICY,
            Self::Conflict => CLOSE_SESSION_CONFLICT,
            Self::NotFound | Self::Store(StoreError::NotFound) => CLOSE_SESSION_NOT_FOUND,
            Self::ShuttingDown => close_code::RESTART,
            Self::Store(_) => close_code::ERROR,
        }
    }
}

impl From<JoinTokenError> for HubError {
    fn from(error: JoinTokenError) -> Self {
        Self::Auth(error.to_string())
    }
}

impl From<HubError> for RelayError {
    fn from(error: HubError) -> Self {
        let code = error.error_code();
        match error {
            // Backend details stay in the logs.
            HubError::Store(StoreError::Backend(ref detail)) => {
                tracing::error!(error = %detail, "session store failure");
                RelayError::from_code(code)
            }
            other => RelayError::new(code, other.to_string()),
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(error: StoreError) -> Self {
        HubError::Store(error).into()
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
