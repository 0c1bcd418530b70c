//! PeerLink transfer core.
//!
//! Everything here is independent of the socket: the channel crate drives
//! these services from its receive loop.

pub mod collaborators;
pub mod error;
pub mod progress;
pub mod reassembler;
pub mod stabilizer;

pub use collaborators::{
    DeviceResolver, FolderProvider, NullTaskSink, PassthroughResolver, StaticFolders, TaskEvent,
    TaskSink, TracingTaskSink,
};
pub use error::ReassemblyError;
pub use progress::{Direction, ProgressMap, ProgressRegistry};
pub use reassembler::{Reassembler, TransferKey};
pub use stabilizer::{ConnectionStabilizer, StabilizerConfig};
