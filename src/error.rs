use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthError>;

/// Failure kinds of the credential negotiation layer.
///
/// `Clone` so one in-flight negotiation can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Malformed server registration. Only the offending registration fails.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    /// The request targets a server that was never registered.
    #[error("no server registered for {0}")]
    UnknownServer(String),

    /// The user dismissed the login UI or the caller's cancellation token fired.
    #[error("login canceled")]
    Canceled,

    /// An intermediary (reverse proxy, firewall) answered instead of the
    /// authorization server. Handled inside the coordinator, never returned
    /// from `resolve`.
    #[error("authorization flow intercepted: {0}")]
    Intercepted(String),

    /// Terminal negotiation failure.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The protected request itself could not be sent.
    #[error("request failed: {0}")]
    Transport(String),
}

impl AuthError {
    /// Cancellation is routine control flow; callers should simply not proceed.
    pub fn is_canceled(&self) -> bool {
        matches!(self, AuthError::Canceled)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        AuthError::AuthFailed(message.into())
    }

    /// Label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidConfig(_) => "invalid_config",
            AuthError::UnknownServer(_) => "unknown_server",
            AuthError::Canceled => "canceled",
            AuthError::Intercepted(_) => "intercepted",
            AuthError::AuthFailed(_) => "auth_failed",
            AuthError::Transport(_) => "transport",
        }
    }
}
