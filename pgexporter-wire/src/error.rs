use thiserror::Error;

/// Errors produced while talking to a PostgreSQL server.
///
/// Authentication failures are distinguished from protocol failures by kind:
/// a [`WireError::AuthBadPassword`] means the server rejected the credentials
/// and the server should be skipped until the next reload, while
/// [`WireError::Protocol`] poisons the handle for the current scrape only.
#[derive(Debug, Error)]
pub enum WireError {
    /// The underlying socket failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS negotiation or handshake failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// The server sent a frame we did not expect in the current state.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server requested an authentication scheme we do not speak, or the
    /// credentials cannot be used with the negotiated scheme.
    #[error("unsupported authentication: {0}")]
    AuthUnsupported(String),

    /// The server rejected the supplied credentials.
    #[error("authentication failed for user {user}: {message}")]
    AuthBadPassword {
        /// User the authentication attempt was made for.
        user: String,
        /// Server-supplied failure message.
        message: String,
    },

    /// The server answered a query with an ErrorResponse.
    #[error("server error {sqlstate}: {message}")]
    Postgres {
        /// SQLSTATE code from the ErrorResponse (`C` field).
        sqlstate: String,
        /// Human readable message (`M` field).
        message: String,
    },

    /// The handle is closed or was poisoned by an earlier failure.
    #[error("connection is closed")]
    Closed,
}

impl WireError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        WireError::Protocol(msg.into())
    }
}
