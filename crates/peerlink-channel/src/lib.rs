pub mod channel;
pub mod config;
pub mod error;
pub mod sessions;

pub use channel::{ChannelCommand, ChannelHandle, ChannelState, TransferChannel};
pub use config::ChannelConfig;
pub use error::ChannelError;
pub use sessions::SessionTable;
