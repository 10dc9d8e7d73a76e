//! Minting and verifying HMAC-SHA256 signed bearer tokens.
//!
//! Tokens are self-contained: the subject (username) and expiry are baked
//! into the signature, so no server-side session table is needed to
//! validate a request. This mirrors the original PyJWT-based tokens, just
//! minted with `jsonwebtoken` instead.

use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long a freshly minted bearer token remains valid.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The authenticated username.
    pub sub: String,
    /// Unix timestamp (seconds) at which the token expires.
    pub exp: i64,
    /// Unix timestamp (seconds) at which the token was issued.
    pub iat: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token has expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

/// Signs and verifies bearer tokens under a single shared secret.
///
/// Cloning is cheap: the secret is wrapped once into `jsonwebtoken`'s
/// key types, which are themselves cheap to clone-by-reference internally.
#[derive(Clone)]
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // We encode `exp`/`iat` ourselves and want `jsonwebtoken` to enforce
        // expiry using them; it does this by default when `exp` is present.
        validation.validate_exp = true;
        validation.required_spec_claims = ["exp"].into_iter().map(String::from).collect();

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Mint a bearer token for `subject` that expires after [`TOKEN_LIFETIME`].
    pub fn mint(&self, subject: &str, now: common::time::TimestampSecs) -> String {
        let claims = Claims {
            sub: subject.to_owned(),
            iat: now.as_secs(),
            exp: now.plus(TOKEN_LIFETIME).as_secs(),
        };
        // `jsonwebtoken::encode` only fails if the key or header are
        // malformed, neither of which can happen with a fixed HS256 secret.
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .expect("HS256 token encoding is infallible for well-formed claims")
    }

    /// Verify a bearer token, distinguishing an expired-but-otherwise-valid
    /// token from one that fails signature or structural validation, as the
    /// two map to different HTTP responses.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        match jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => Err(AuthError::Invalid),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use common::time::TimestampSecs;

    #[test]
    fn mint_then_verify_roundtrips_subject() {
        let signer = TokenSigner::new(b"test-secret");
        let now = TimestampSecs::now();
        let token = signer.mint("alice", now);
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn expired_token_is_rejected_as_expired() {
        let signer = TokenSigner::new(b"test-secret");
        let past = TimestampSecs::from_secs(0);
        let token = signer.mint("alice", past);
        let err = signer.verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn tampered_token_is_rejected_as_invalid() {
        let signer = TokenSigner::new(b"test-secret");
        let other = TokenSigner::new(b"different-secret");
        let now = TimestampSecs::now();
        let token = signer.mint("alice", now);
        let err = other.verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::Invalid));
    }
}
