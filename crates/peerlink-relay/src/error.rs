use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("unknown message kind {0:?}")]
    UnknownKind(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("connection closed mid-message ({0} bytes buffered)")]
    UnexpectedEof(usize),
}
