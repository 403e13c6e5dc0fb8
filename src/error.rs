use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Bad credentials, unavailable method, missing required input,
    /// invalid resume token, or a transport that died before success.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The helper verified the credentials but refused access.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Unparseable helper output or a malformed resume token.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Admission throttle rejection. Deliberately indistinguishable from a
    /// network failure on the wire.
    #[error("Connection closed by host")]
    Throttled,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// The message safe to hand back to an unauthenticated client. Richer
    /// detail stays in the local debug log.
    pub fn public_message(&self) -> &'static str {
        match self {
            Error::AuthenticationFailed(_) | Error::InvalidData(_) => "Authentication failed",
            Error::PermissionDenied(_) => "Permission denied",
            Error::Throttled => "Connection closed by host",
            Error::Internal(_) | Error::Io(_) => "Internal error",
        }
    }
}

pub type Result<T> = StdResult<T, Error>;
