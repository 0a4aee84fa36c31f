// CORS policy for the REST surface.
//
// Origins come from `RelayConfig::cors_origins` (comma-separated, or `*`).
// Unset falls back to the usual local development origins.

use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::REQUEST_ID_HEADER;

const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(3600);

/// Builds the relay's [`CorsLayer`].
///
/// `"*"` allows any origin and drops credentials, as browsers refuse the
/// combination. Credentials are otherwise allowed so the bearer header
/// survives cross-origin calls.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([header::HeaderName::from_static(REQUEST_ID_HEADER)])
        .allow_credentials(true)
        .max_age(PREFLIGHT_MAX_AGE);

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(list) => base.allow_origin(parse_origins(list)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}
