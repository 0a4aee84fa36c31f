use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifetime of the long-lived primary credential.
pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Issues and validates primary access tokens (HS256, `sub` = user id).
#[derive(Clone)]
pub struct AccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("access token secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_access_token(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.issue_access_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_access_token_at(&self, user_id: Uuid, issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Returns the user id the token was issued to.
    pub fn validate_access_token(&self, token: &str) -> anyhow::Result<Uuid> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        Uuid::parse_str(&claims.sub)
            .with_context(|| format!("access token subject '{}' is not a UUID", claims.sub))
    }
}

pub(crate) fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, AccessTokenService, ACCESS_TOKEN_TTL_SECONDS};
    use crate::auth::primary::PrimaryCredentialVerifier;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;
    use uuid::Uuid;

    const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

    #[test]
    fn issues_and_validates_access_tokens() {
        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let user_id = Uuid::new_v4();

        let token = service.issue_access_token(user_id).expect("token should be issued");
        let validated = service.validate_access_token(&token).expect("token should validate");

        assert_eq!(validated, user_id);
    }

    #[test]
    fn credential_for_one_user_does_not_vouch_for_another() {
        let service =
            std::sync::Arc::new(AccessTokenService::new(TEST_SECRET).expect("service should initialize"));
        let verifier = PrimaryCredentialVerifier::new(service.clone());
        let (owner, member) = (Uuid::new_v4(), Uuid::new_v4());
        let owner_credential = service.issue_access_token(owner).expect("token should be issued");

        assert!(verifier.verify(owner, &owner_credential));
        assert!(!verifier.verify(member, &owner_credential));

        let other_deployment = AccessTokenService::new("another_secret_that_is_also_long_enough_x")
            .expect("service should initialize");
        let foreign = other_deployment.issue_access_token(member).expect("token should be issued");
        assert!(!verifier.verify(member, &foreign));
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(AccessTokenService::new("too-short").is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let token = service.issue_access_token(Uuid::new_v4()).expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(service.validate_access_token(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token = service
            .issue_access_token_at(Uuid::new_v4(), issued_at)
            .expect("token should be issued");

        assert!(service.validate_access_token(&token).is_err());
    }

    #[test]
    fn rejects_tokens_with_invalid_subject_claim() {
        #[derive(Serialize)]
        struct InvalidSubjectClaims {
            sub: &'static str,
            iat: i64,
            exp: i64,
        }

        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let claims =
            InvalidSubjectClaims { sub: "not-a-uuid", iat: now, exp: now + ACCESS_TOKEN_TTL_SECONDS };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(service.validate_access_token(&token).is_err());
    }
}
