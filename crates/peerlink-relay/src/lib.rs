//! Raw-socket protocol spoken with the PeerLink relay: whole-file responses
//! and device deletion requests, in the legacy sentinel framing or the
//! length-prefixed framing.

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;

pub use client::RelayClient;
pub use codec::{write_message, MessageReader, WireFormat};
pub use error::RelayError;
pub use protocol::FramedMessage;
