use thiserror::Error;

/// Failure of one reassembled download. Never fatal to the channel.
#[derive(Debug, Error)]
pub enum ReassemblyError {
    #[error("no active transfer for {0}")]
    NoActiveTransfer(String),

    #[error("no data accumulated for {0}")]
    NoDataAccumulated(String),

    #[error("invalid filename {0:?}")]
    InvalidFilename(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
