use std::sync::Arc;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use uuid::Uuid;

use crate::auth::{jwt::AccessTokenService, middleware::extract_bearer_token};

/// Opaque pass/fail check of the long-lived primary credential.
#[derive(Clone)]
pub struct PrimaryCredentialVerifier {
    access_tokens: Arc<AccessTokenService>,
}

impl PrimaryCredentialVerifier {
    pub fn new(access_tokens: Arc<AccessTokenService>) -> Self {
        Self { access_tokens }
    }

    /// Passes only when `credential` validates and was issued to `user_id`.
    pub fn verify(&self, user_id: Uuid, credential: &str) -> bool {
        match self.access_tokens.validate_access_token(credential) {
            Ok(subject) => subject == user_id,
            Err(error) => {
                tracing::debug!(%user_id, error = %error, "primary credential rejected");
                false
            }
        }
    }
}

/// Reads the primary credential from `Authorization: Bearer` or, since
/// browsers cannot set headers on upgrades, the `access_token` query value.
pub fn upgrade_credential<'a>(
    headers: &'a HeaderMap,
    query_access_token: Option<&'a str>,
) -> Option<&'a str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .or_else(|| query_access_token.map(str::trim).filter(|token| !token.is_empty()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue};
    use uuid::Uuid;

    use super::{upgrade_credential, PrimaryCredentialVerifier};
    use crate::auth::jwt::AccessTokenService;

    const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

    fn verifier() -> (Arc<AccessTokenService>, PrimaryCredentialVerifier) {
        let service = Arc::new(AccessTokenService::new(TEST_SECRET).expect("service"));
        (service.clone(), PrimaryCredentialVerifier::new(service))
    }

    #[test]
    fn passes_only_for_the_token_subject() {
        let (service, verifier) = verifier();
        let alice = Uuid::new_v4();
        let token = service.issue_access_token(alice).expect("token");

        assert!(verifier.verify(alice, &token));
        assert!(!verifier.verify(Uuid::new_v4(), &token));
        assert!(!verifier.verify(alice, "garbage"));
    }

    #[test]
    fn header_credential_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        assert_eq!(upgrade_credential(&headers, Some("from-query")), Some("from-header"));
        assert_eq!(upgrade_credential(&HeaderMap::new(), Some("from-query")), Some("from-query"));
        assert_eq!(upgrade_credential(&HeaderMap::new(), Some("  ")), None);
        assert_eq!(upgrade_credential(&HeaderMap::new(), None), None);
    }
}
