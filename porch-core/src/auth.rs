//! Authentication
//!
//! Supports two modes:
//! - Static token: set `PORCH_AUTH_TOKEN` for a single long-lived token
//! - Open: when no token is configured, every caller is accepted
//!
//! Authenticated callers act as the user named by `PORCH_AUTH_USER`
//! (default `owner`); that id is attached to the context of their
//! service calls. Open mode calls carry no user.

const DEFAULT_USER_ID: &str = "owner";

/// Auth configuration, initialized once at startup.
pub struct AuthConfig {
    token: Option<String>,
    user_id: String,
}

impl AuthConfig {
    pub fn from_env() -> Self {
        let token = std::env::var("PORCH_AUTH_TOKEN").ok().filter(|t| !t.is_empty());
        let user_id = std::env::var("PORCH_AUTH_USER").unwrap_or_else(|_| DEFAULT_USER_ID.to_string());
        if token.is_some() {
            tracing::info!(user = %user_id, "Auth enabled (static token)");
        } else {
            tracing::info!("Auth disabled (no PORCH_AUTH_TOKEN set)");
        }
        Self { token, user_id }
    }

    /// Open mode, for tests and local development.
    pub fn disabled() -> Self {
        Self {
            token: None,
            user_id: DEFAULT_USER_ID.to_string(),
        }
    }

    pub fn with_token(token: &str, user_id: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            user_id: user_id.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Validate a token. Always true in open mode.
    pub fn validate(&self, token: &str) -> bool {
        match &self.token {
            Some(expected) => {
                // Constant-time comparison
                if expected.len() != token.len() {
                    return false;
                }
                expected
                    .bytes()
                    .zip(token.bytes())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
            }
            None => true,
        }
    }

    /// Validate a Bearer token from an Authorization header value.
    pub fn validate_header(&self, auth_header: Option<&str>) -> bool {
        if !self.is_enabled() {
            return true;
        }
        match auth_header {
            Some(header) => self.validate(header.strip_prefix("Bearer ").unwrap_or(header)),
            None => false,
        }
    }

    /// User id for contexts created by an authenticated caller.
    pub fn user_id(&self) -> Option<&str> {
        self.token.as_ref().map(|_| self.user_id.as_str())
    }
}
