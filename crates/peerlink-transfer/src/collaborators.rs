/// Narrow contracts for the pieces of the application the transfer code needs
/// but does not own: device naming, the set of folders a device serves, and
/// the task/notification surface.
///
/// Each trait ships with a plain implementation so the agent can run without
/// the rest of the application.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use peerlink_types::models::TransferFailure;

use crate::progress::Direction;

/// Maps a `(username, device_id)` pair to a display name.
pub trait DeviceResolver: Send + Sync {
    fn resolve(&self, username: &str, device_id: &str) -> String;
}

/// Returns the device id unchanged.
pub struct PassthroughResolver;

impl DeviceResolver for PassthroughResolver {
    fn resolve(&self, _username: &str, device_id: &str) -> String {
        device_id.to_string()
    }
}

/// The folders this device is willing to serve files from.
pub trait FolderProvider: Send + Sync {
    fn scanned_folders(&self) -> Vec<PathBuf>;

    /// Whether `path` lies inside one of the scanned folders. The check is
    /// lexical: relative paths and paths containing `..` never qualify.
    fn owns(&self, path: &Path) -> bool {
        if !path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir)) {
            return false;
        }
        self.scanned_folders()
            .iter()
            .any(|folder| path.starts_with(folder))
    }
}

/// Fixed list of folders, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticFolders(pub Vec<PathBuf>);

impl FolderProvider for StaticFolders {
    fn scanned_folders(&self) -> Vec<PathBuf> {
        self.0.clone()
    }
}

/// Outcome of a transfer, reported once per transfer.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Completed {
        direction: Direction,
        filename: String,
        path: Option<PathBuf>,
        bytes: u64,
    },
    Failed {
        direction: Direction,
        filename: String,
        failure: TransferFailure,
        detail: Option<String>,
    },
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { direction, filename, path, bytes } => match path {
                Some(p) => write!(
                    f,
                    "{} complete file={} bytes={} path={}",
                    direction,
                    filename,
                    bytes,
                    p.display()
                ),
                None => write!(f, "{} complete file={} bytes={}", direction, filename, bytes),
            },
            Self::Failed { direction, filename, failure, detail } => match detail {
                Some(d) => write!(
                    f,
                    "{} failed file={} reason={} ({})",
                    direction, filename, failure, d
                ),
                None => write!(f, "{} failed file={} reason={}", direction, filename, failure),
            },
        }
    }
}

/// Fire-and-forget receiver of transfer outcomes. Implementations must not
/// block the caller.
pub trait TaskSink: Send + Sync {
    fn notify(&self, event: TaskEvent);
}

/// Sink that writes outcomes to `tracing`.
pub struct TracingTaskSink;

impl TaskSink for TracingTaskSink {
    fn notify(&self, event: TaskEvent) {
        match &event {
            TaskEvent::Completed { .. } => {
                tracing::info!(target: "peerlink_transfer::tasks", "{}", event)
            }
            TaskEvent::Failed { .. } => {
                tracing::warn!(target: "peerlink_transfer::tasks", "{}", event)
            }
        }
    }
}

/// Sink that discards everything.
pub struct NullTaskSink;

impl TaskSink for NullTaskSink {
    fn notify(&self, _event: TaskEvent) {}
}
