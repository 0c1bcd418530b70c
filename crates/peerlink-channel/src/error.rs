use peerlink_transfer::ReassemblyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("heartbeat timeout after {0} missed pongs")]
    HeartbeatTimeout(u8),

    #[error("channel is closed")]
    Closed,

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
}
