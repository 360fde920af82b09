//! Connection authentication.
//!
//! Tokens are verified before the WebSocket upgrade; a failure refuses the
//! upgrade and creates no socket or channel state. The default
//! implementation verifies HS256 JWTs whose `sub` claim carries the user id,
//! with token age bounded by a configurable window over `iat`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::socket::SocketIdentity;
use crate::topic::UserId;

/// Authentication failures. All of them refuse the connection upgrade.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied with the connection request.
    #[error("Missing token")]
    MissingToken,

    /// Signature or structure was invalid.
    #[error("Invalid token")]
    InvalidToken,

    /// The token is past its expiry or older than the max-age window.
    #[error("Token expired")]
    TokenExpired,

    /// The subject claim did not resolve to a user id.
    #[error("Invalid token subject")]
    InvalidSubject,
}

/// Claims carried by a Confab token.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id, as a string per JWT convention.
    sub: String,
    /// Issued-at, seconds since the epoch.
    iat: u64,
    /// Expiry, seconds since the epoch.
    exp: u64,
}

/// Verifies identity tokens.
///
/// Verification is a bounded cryptographic check, so the trait is
/// synchronous; implementations must not block on I/O.
pub trait AuthService: Send + Sync {
    /// Verify a token and resolve the user it identifies.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] for bad signatures, expired or over-age
    /// tokens, and malformed subjects.
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// HS256 JWT verification with a max-age window.
pub struct JwtAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    max_age: Duration,
}

impl JwtAuth {
    /// Build a verifier from a shared secret.
    #[must_use]
    pub fn new(secret: &str, max_age: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            max_age,
        }
    }

    /// Issue a token for a user, valid for the max-age window.
    ///
    /// Token issuance proper lives outside this system; this exists for
    /// local runs and load tooling.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if encoding fails.
    pub fn sign(&self, user_id: UserId) -> Result<String, AuthError> {
        let iat = now_secs();
        let claims = Claims {
            sub: user_id.to_string(),
            iat,
            exp: iat + self.max_age.as_secs(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| AuthError::InvalidToken)
    }
}

impl AuthService for JwtAuth {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            }
        })?;

        let age = now_secs().saturating_sub(data.claims.iat);
        if age > self.max_age.as_secs() {
            return Err(AuthError::TokenExpired);
        }

        data.claims
            .sub
            .parse()
            .map_err(|_| AuthError::InvalidSubject)
    }
}

/// Authenticates raw connections before the upgrade.
pub struct AuthGate {
    service: Arc<dyn AuthService>,
}

impl AuthGate {
    /// Create a gate over a verification service.
    #[must_use]
    pub fn new(service: Arc<dyn AuthService>) -> Self {
        Self { service }
    }

    /// Authenticate a connection attempt.
    ///
    /// On success a fresh [`SocketIdentity`] is minted; the caller binds it
    /// to the connection once the upgrade completes.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the token is missing or fails
    /// verification. No state is created on failure.
    pub fn connect(&self, token: Option<&str>) -> Result<SocketIdentity, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let user_id = self.service.verify(token)?;
        let identity = SocketIdentity::new(user_id);
        debug!(user = user_id, conn = %identity.connection_id, "Authenticated connection");
        Ok(identity)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> JwtAuth {
        JwtAuth::new("test-secret", Duration::from_secs(3600))
    }

    fn token_with_claims(secret: &str, claims: &Claims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let auth = auth();
        let token = auth.sign(42).unwrap();
        assert_eq!(auth.verify(&token), Ok(42));
    }

    #[test]
    fn test_rejects_garbage_and_wrong_secret() {
        let auth = auth();
        assert_eq!(auth.verify("not-a-token"), Err(AuthError::InvalidToken));

        let other = JwtAuth::new("other-secret", Duration::from_secs(3600));
        let token = other.sign(42).unwrap();
        assert_eq!(auth.verify(&token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_rejects_expired_token() {
        let auth = auth();
        let stale = now_secs() - 7200;
        let token = token_with_claims(
            "test-secret",
            &Claims {
                sub: "42".to_string(),
                iat: stale,
                exp: stale + 60,
            },
        );
        assert_eq!(auth.verify(&token), Err(AuthError::TokenExpired));
    }

    #[test]
    fn test_rejects_over_age_token() {
        // exp still in the future, but iat is past the max-age window
        let auth = auth();
        let iat = now_secs() - 7200;
        let token = token_with_claims(
            "test-secret",
            &Claims {
                sub: "42".to_string(),
                iat,
                exp: now_secs() + 600,
            },
        );
        assert_eq!(auth.verify(&token), Err(AuthError::TokenExpired));
    }

    #[test]
    fn test_rejects_non_numeric_subject() {
        let auth = auth();
        let iat = now_secs();
        let token = token_with_claims(
            "test-secret",
            &Claims {
                sub: "alice".to_string(),
                iat,
                exp: iat + 600,
            },
        );
        assert_eq!(auth.verify(&token), Err(AuthError::InvalidSubject));
    }

    #[test]
    fn test_gate_connect() {
        let auth = Arc::new(auth());
        let gate = AuthGate::new(auth.clone());

        assert_eq!(gate.connect(None), Err(AuthError::MissingToken));

        let token = auth.sign(9).unwrap();
        let identity = gate.connect(Some(&token)).unwrap();
        assert_eq!(identity.user_id, 9);
    }
}
