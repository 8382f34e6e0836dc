//! Session Tokens
//!
//! The signed credential a browser carries in its session cookie. It is a
//! three-part HS256 JWT: header, payload (subject, display fields, issued
//! and expiry times, passthrough provider credentials) and a keyed-hash
//! signature. Only this module and the gateway look inside.
//!
//! Verification never panics on malformed input; every failure is an
//! explicit `AuthError`.

use std::collections::HashSet;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;
use crate::game::state::UserId;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No signing secret configured on the server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Token could not be signed.
    #[error("token encoding failed: {0}")]
    Encode(String),
    /// The identity provider refused or failed.
    #[error("identity provider error: {0}")]
    Provider(String),
}

/// Who the user is, as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable subject id.
    pub subject: String,
    /// Display name.
    pub display_name: String,
    /// Email, if shared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Avatar URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// Upstream token material, carried only so the session can be refreshed
/// or logged out at the provider. Game logic never reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredentials {
    /// Provider access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Provider refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Provider id token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Provider access token expiry (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Session token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokenPayload {
    /// Subject (user id).
    pub sub: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Issued at (Unix seconds).
    pub iat: u64,
    /// Expiry (Unix seconds).
    pub exp: u64,
    /// Issuer.
    pub iss: String,
    /// Passthrough provider credentials.
    #[serde(default)]
    pub provider: ProviderCredentials,
}

impl SessionTokenPayload {
    /// The user this token identifies.
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub.clone())
    }

    /// Identity fields.
    pub fn identity(&self) -> Identity {
        Identity {
            subject: self.sub.clone(),
            display_name: if self.name.is_empty() { self.sub.clone() } else { self.name.clone() },
            email: self.email.clone(),
            picture: self.picture.clone(),
        }
    }
}

/// Issues and verifies session tokens with the server secret.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl_secs: u64,
    skip_expiry: bool,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("issuer", &self.issuer)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Build from config; fails without a secret.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let secret = config.secret.as_deref().ok_or(AuthError::NotConfigured)?;
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: config.issuer.clone(),
            ttl_secs: config.token_ttl.as_secs(),
            skip_expiry: config.skip_expiry,
        })
    }

    /// Token lifetime in seconds.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Issue a token for `identity`.
    pub fn issue(&self, identity: &Identity, provider: ProviderCredentials) -> Result<String, AuthError> {
        let now = now_secs();
        self.sign(&SessionTokenPayload {
            sub: identity.subject.clone(),
            name: identity.display_name.clone(),
            email: identity.email.clone(),
            picture: identity.picture.clone(),
            iat: now,
            exp: now + self.ttl_secs,
            iss: self.issuer.clone(),
            provider,
        })
    }

    /// Sign an arbitrary payload.
    pub fn sign(&self, payload: &SessionTokenPayload) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), payload, &self.encoding).map_err(|e| AuthError::Encode(e.to_string()))
    }

    /// Verify signature, issuer and expiry.
    pub fn verify(&self, token: &str) -> Result<SessionTokenPayload, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::from(["exp".to_string(), "sub".to_string()]);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;
        validation.validate_exp = !self.skip_expiry;
        validation.leeway = 0;

        let payload = decode::<SessionTokenPayload>(token, &self.decoding, &validation)
            .map_err(map_jwt_error)?
            .claims;

        if payload.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub".into()));
        }
        if !self.skip_expiry && now_secs() > payload.exp {
            return Err(AuthError::Expired);
        }

        Ok(payload)
    }

    /// Re-issue with a fresh lifetime, optionally swapping in refreshed
    /// provider credentials.
    pub fn refresh(&self, payload: &SessionTokenPayload, provider: Option<ProviderCredentials>) -> Result<String, AuthError> {
        let now = now_secs();
        self.sign(&SessionTokenPayload {
            iat: now,
            exp: now + self.ttl_secs,
            provider: provider.unwrap_or_else(|| payload.provider.clone()),
            ..payload.clone()
        })
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Map JWT library errors to ours.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
        _ => AuthError::InvalidFormat,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(secret: &str) -> AuthConfig {
        AuthConfig {
            secret: Some(secret.into()),
            issuer: "test-issuer".into(),
            token_ttl: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn identity() -> Identity {
        Identity {
            subject: "user123".into(),
            display_name: "Ada".into(),
            email: None,
            picture: None,
        }
    }

    fn credentials() -> ProviderCredentials {
        ProviderCredentials {
            access_token: Some("at".into()),
            refresh_token: Some("rt".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let signer = TokenSigner::from_config(&config("test-secret-key-256-bits-long!!")).unwrap();
        let token = signer.issue(&identity(), credentials()).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let payload = signer.verify(&token).unwrap();
        assert_eq!(payload.user_id(), UserId::from("user123"));
        assert_eq!(payload.identity().display_name, "Ada");
        assert_eq!(payload.provider, credentials());
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = TokenSigner::from_config(&config("test-secret-key-256-bits-long!!")).unwrap();
        let token = signer
            .sign(&SessionTokenPayload {
                sub: "user123".into(),
                name: "Ada".into(),
                email: None,
                picture: None,
                iat: 0,
                exp: 1,
                iss: "test-issuer".into(),
                provider: ProviderCredentials::default(),
            })
            .unwrap();

        assert!(matches!(signer.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let issuer = TokenSigner::from_config(&config("correct-secret-key-here!!!!!")).unwrap();
        let verifier = TokenSigner::from_config(&config("wrong-secret-key-here!!!!!!")).unwrap();
        let token = issuer.issue(&identity(), ProviderCredentials::default()).unwrap();

        assert!(matches!(verifier.verify(&token), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signer = TokenSigner::from_config(&config("test-secret-key-256-bits-long!!")).unwrap();
        let token = signer.issue(&identity(), ProviderCredentials::default()).unwrap();
        let other = signer
            .issue(&Identity { subject: "mallory".into(), ..identity() }, ProviderCredentials::default())
            .unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        let other_parts: Vec<&str> = other.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], other_parts[1], parts[2]);

        assert!(matches!(signer.verify(&forged), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_malformed_input_is_error() {
        let signer = TokenSigner::from_config(&config("test-secret-key-256-bits-long!!")).unwrap();
        for junk in ["", "abc", "a.b", "a.b.c.d", "!!.??.##"] {
            assert!(signer.verify(junk).is_err(), "accepted {:?}", junk);
        }
    }

    #[test]
    fn test_issuer_validation() {
        let signer = TokenSigner::from_config(&config("test-secret-key-256-bits-long!!")).unwrap();
        let other = TokenSigner::from_config(&AuthConfig {
            issuer: "someone-else".into(),
            ..config("test-secret-key-256-bits-long!!")
        })
        .unwrap();

        let token = other.issue(&identity(), ProviderCredentials::default()).unwrap();
        assert!(matches!(signer.verify(&token), Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_refresh_swaps_credentials() {
        let signer = TokenSigner::from_config(&config("test-secret-key-256-bits-long!!")).unwrap();
        let payload = signer.verify(&signer.issue(&identity(), credentials()).unwrap()).unwrap();

        let fresh = ProviderCredentials { access_token: Some("at2".into()), ..credentials() };
        let refreshed = signer.verify(&signer.refresh(&payload, Some(fresh.clone())).unwrap()).unwrap();

        assert_eq!(refreshed.sub, payload.sub);
        assert_eq!(refreshed.provider, fresh);
        assert!(refreshed.exp >= payload.exp);
    }

    #[test]
    fn test_not_configured_error() {
        let result = TokenSigner::from_config(&AuthConfig::default());
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_skip_expiry_for_testing() {
        let signer = TokenSigner::from_config(&AuthConfig {
            skip_expiry: true,
            ..config("test-secret-key-256-bits-long!!")
        })
        .unwrap();
        let mut payload = signer.verify(&signer.issue(&identity(), ProviderCredentials::default()).unwrap()).unwrap();
        payload.exp = 1;

        assert!(signer.verify(&signer.sign(&payload).unwrap()).is_ok());
    }
}
