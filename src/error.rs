use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum RelayError {
    #[error("Upstream sensor link unavailable: {0}")]
    LinkUnavailable(String),

    #[error("Malformed sensor message: {0}")]
    MalformedMessage(String),

    #[error("Failed to deliver state to subscriber {0}")]
    SubscriberSendFailure(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    ViewerError(#[from] axum::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
