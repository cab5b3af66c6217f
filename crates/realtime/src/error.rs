use thiserror::Error;

/// エラー型
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("WebSocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid realtime URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Malformed frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// The socket task is gone or was never started
    #[error("Not connected")]
    NotConnected,

    #[error("No postgres_changes bindings registered for {0}")]
    NoBindings(String),

    #[error("Topic {0} is already subscribed")]
    DuplicateTopic(String),

    #[error("Join rejected for {topic}: {reason}")]
    JoinRejected { topic: String, reason: String },

    /// The server never answered the join, or the channel went away first
    #[error("Timed out joining {0}")]
    JoinTimeout(String),
}
