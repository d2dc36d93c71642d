use thiserror::Error;

/// Admission-time credential failures. All three refuse the connection
/// attempt outright; a refused connection never reaches the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token missing from the handshake or structurally unusable.
    #[error("invalid credential")]
    InvalidCredential,
    /// Token verified but its validity window has passed.
    #[error("credential expired")]
    ExpiredCredential,
    /// Any other verification failure.
    #[error("credential verification failed")]
    VerificationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    Validation,
    Internal,
}

/// Error surfaced at the HTTP edge. Rendered as a `{"message": ...}` body
/// with the status derived from `code`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        Self::new(ErrorCode::Unauthorized, value.to_string())
    }
}
