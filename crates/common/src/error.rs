use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Retries exhausted creating a protective order after an entry fill.
    /// The position is left open on the exchange; operator intervention is
    /// required. Surfacing this shuts the bot down with exit code 1.
    #[error("Protective order failure ({side} {kind}): {reason}")]
    ProtectiveOrder {
        side: String,
        kind: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the error kinds that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ProtectiveOrder { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
