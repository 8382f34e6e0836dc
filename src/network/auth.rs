//! Auth Surface
//!
//! Everything around the session token that is not the token itself:
//! pulling it out of a WebSocket handshake, the login/callback/status/
//! refresh/logout operations, and the HTTP-only cookie strings that carry
//! it. The identity provider is an external collaborator behind
//! [`IdentityProvider`]; its login flow is not implemented here.

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::network::token::{AuthError, Identity, ProviderCredentials, SessionTokenPayload, TokenSigner};

// =============================================================================
// HANDSHAKE EXTRACTION
// =============================================================================

/// Find the session token in a handshake request: the session cookie
/// first, then `Authorization: Bearer`, then a `token` query parameter.
pub fn extract_token(request: &Request, cookie_name: &str) -> Option<String> {
    let headers = request.headers();

    headers
        .get_all("cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| token_from_cookie_header(v, cookie_name))
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(token_from_authorization)
        })
        .or_else(|| request.uri().query().and_then(token_from_query))
}

/// `name=value` from a `Cookie` header.
pub fn token_from_cookie_header(header: &str, cookie_name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == cookie_name && !value.is_empty()).then(|| value.to_string())
    })
}

/// Bearer token from an `Authorization` header.
pub fn token_from_authorization(header: &str) -> Option<String> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// `token=` query parameter.
pub fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

// =============================================================================
// IDENTITY PROVIDER
// =============================================================================

/// External identity provider (OAuth/OIDC or similar).
pub trait IdentityProvider: Send + Sync {
    /// Where to send the browser to log in.
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> String;

    /// Exchange the callback code for an identity and credentials.
    fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<(Identity, ProviderCredentials), AuthError>;

    /// Refresh upstream credentials.
    fn refresh(&self, credentials: &ProviderCredentials) -> Result<ProviderCredentials, AuthError>;

    /// Provider-wide logout URL, if the provider supports it.
    fn logout_url(&self, credentials: &ProviderCredentials, return_to: &str) -> Option<String>;
}

// =============================================================================
// SERVICE
// =============================================================================

/// Answer to a status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    /// Login is possible at all (provider present).
    pub auth_enabled: bool,
    /// Tokens can be issued and verified.
    pub configured: bool,
    /// The presented token is valid.
    pub authenticated: bool,
    /// Who, if authenticated.
    pub user: Option<Identity>,
}

/// A freshly issued session.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    /// Signed token.
    pub token: String,
    /// `Set-Cookie` value carrying it.
    pub set_cookie: String,
    /// Its claims.
    pub payload: SessionTokenPayload,
}

/// Result of a logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedOut {
    /// `Set-Cookie` value clearing the session cookie.
    pub clear_cookie: String,
    /// Provider logout URL when logging out everywhere.
    pub provider_logout_url: Option<String>,
}

/// Login, status, refresh and logout.
pub struct AuthService {
    config: AuthConfig,
    signer: Option<TokenSigner>,
    provider: Option<Arc<dyn IdentityProvider>>,
}

impl AuthService {
    /// Build the service. Without a secret nothing verifies.
    pub fn new(config: AuthConfig, provider: Option<Arc<dyn IdentityProvider>>) -> Self {
        let signer = match TokenSigner::from_config(&config) {
            Ok(signer) => Some(signer),
            Err(e) => {
                warn!("Session tokens disabled: {}", e);
                None
            }
        };
        Self { config, signer, provider }
    }

    /// Token signer, if configured.
    pub fn signer(&self) -> Result<&TokenSigner, AuthError> {
        self.signer.as_ref().ok_or(AuthError::NotConfigured)
    }

    /// Cookie name the gateway reads.
    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    /// Verify a presented token.
    pub fn verify(&self, token: &str) -> Result<SessionTokenPayload, AuthError> {
        self.signer()?.verify(token)
    }

    /// Provider login URL.
    pub fn login_redirect(&self, state: &str, redirect_uri: &str) -> Result<String, AuthError> {
        let provider = self.provider.as_ref().ok_or(AuthError::NotConfigured)?;
        Ok(provider.authorization_url(state, redirect_uri))
    }

    /// Complete a login: exchange the code and issue a session token.
    pub fn callback(&self, code: &str, redirect_uri: &str) -> Result<IssuedSession, AuthError> {
        let signer = self.signer()?;
        let provider = self.provider.as_ref().ok_or(AuthError::NotConfigured)?;

        let (identity, credentials) = provider.exchange_code(code, redirect_uri)?;
        let token = signer.issue(&identity, credentials)?;
        let payload = signer.verify(&token)?;
        info!(user = %identity.subject, "Login completed");

        Ok(IssuedSession { set_cookie: self.session_cookie(&token), token, payload })
    }

    /// Who does `token` belong to, if anyone.
    pub fn status(&self, token: Option<&str>) -> AuthStatus {
        let user = token.and_then(|t| self.verify(t).ok()).map(|p| p.identity());
        AuthStatus {
            auth_enabled: self.provider.is_some() && self.signer.is_some(),
            configured: self.signer.is_some(),
            authenticated: user.is_some(),
            user,
        }
    }

    /// Extend a valid session, refreshing provider credentials when a
    /// provider is present.
    pub fn refresh(&self, token: &str) -> Result<IssuedSession, AuthError> {
        let signer = self.signer()?;
        let payload = signer.verify(token)?;

        let credentials = match &self.provider {
            Some(provider) if payload.provider.refresh_token.is_some() => Some(provider.refresh(&payload.provider)?),
            _ => None,
        };

        let token = signer.refresh(&payload, credentials)?;
        let payload = signer.verify(&token)?;
        Ok(IssuedSession { set_cookie: self.session_cookie(&token), token, payload })
    }

    /// End the local session, and optionally the provider session.
    pub fn logout(&self, token: Option<&str>, everywhere: bool, return_to: &str) -> LoggedOut {
        let provider_logout_url = if everywhere {
            let payload = token.and_then(|t| self.verify(t).ok());
            match (&self.provider, payload) {
                (Some(provider), Some(payload)) => provider.logout_url(&payload.provider, return_to),
                _ => None,
            }
        } else {
            None
        };

        LoggedOut { clear_cookie: self.clear_cookie(), provider_logout_url }
    }

    /// `Set-Cookie` value carrying a session token. HTTP-only so page
    /// scripts never see it.
    pub fn session_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.config.cookie_name,
            token,
            self.config.token_ttl.as_secs()
        );
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value removing the session cookie.
    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", self.config.cookie_name);
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}
