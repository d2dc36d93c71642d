use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use shared::{domain::UserId, error::AuthError};

/// Claims a connection credential must carry. `sub` is the identity the
/// connection stays bound to for its whole lifetime; `exp` is enforced by
/// the validator and never deserialized here.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// HS256 verifier shared by the socket admission gate and the HTTP surface.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verifies a credential and yields the identity it is bound to.
    ///
    /// Absent, blank, or structurally broken tokens are invalid; an expired
    /// signature is reported distinctly so clients can refresh instead of
    /// re-login. Everything else collapses into a generic verification
    /// failure.
    pub fn verify(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::InvalidCredential)?;

        let data =
            decode::<Claims>(token, &self.decoding, &self.validation).map_err(|error| {
                match error.kind() {
                    ErrorKind::ExpiredSignature => AuthError::ExpiredCredential,
                    ErrorKind::InvalidToken
                    | ErrorKind::InvalidSignature
                    | ErrorKind::MissingRequiredClaim(_)
                    | ErrorKind::Base64(_)
                    | ErrorKind::Json(_)
                    | ErrorKind::Utf8(_) => AuthError::InvalidCredential,
                    _ => AuthError::VerificationFailed,
                }
            })?;

        Ok(UserId(data.claims.sub))
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
