//! Bearer token and API key verification.

use crate::error::AuthError;
use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims the broker consumes from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Subject (user id).
    pub sub: String,
    /// Expiration time (Unix timestamp).
    pub exp: usize,
    /// Granted permission strings.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A registered API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// Human-readable key name, used as the client's identity.
    pub name: String,
    /// Granted permission strings.
    pub permissions: Vec<String>,
}

impl ApiKeyConfig {
    /// Create a new API key record.
    #[must_use]
    pub fn new(name: impl Into<String>, permissions: Vec<String>) -> Self {
        Self {
            name: name.into(),
            permissions,
        }
    }
}

/// Verifies bearer tokens issued by an external identity service.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a token and return its claims.
    async fn verify(&self, token: &str) -> Result<AuthClaims, AuthError>;
}

/// HS256 JWT verifier backed by a shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for the given shared secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish()
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        decode::<AuthClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidToken("bad signature".into()),
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }
}
