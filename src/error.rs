use thiserror::Error;

/// Error taxonomy shared by both protocol sessions, matching the error-kind
/// table: each variant carries exactly the information needed to pick a
/// wire-level reply and a log level, without the call site having to know
/// either.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed for {user}")]
    Auth { user: String },

    #[error("dial to {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unsupported feature: {0}")]
    Unsupported(String),
}

impl SessionError {
    /// Log level policy from the error-handling design table: protocol
    /// violations are not worth more than `debug`, auth failures are `warn`,
    /// dial failures are `debug`.
    pub fn log_level(&self) -> tracing::Level {
        match self {
            SessionError::Protocol(_) => tracing::Level::DEBUG,
            SessionError::Auth { .. } => tracing::Level::WARN,
            SessionError::Dial { .. } => tracing::Level::DEBUG,
            SessionError::Unsupported(_) => tracing::Level::DEBUG,
        }
    }
}
