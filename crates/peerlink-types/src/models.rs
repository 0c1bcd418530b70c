use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Filename used by peers that report progress before they know the real name.
pub const UNKNOWN_FILENAME: &str = "Unknown";

/// Lifecycle of one upload or download as seen by the progress registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    #[serde(alias = "downloading", alias = "uploading")]
    Transferring,
    Completed,
    Failed,
    Skipped,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Named failure reported by a peer or detected locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFailure {
    FileNotFound,
    DeviceOffline,
    PermissionDenied,
    TransferFailed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::FileNotFound => "File not found",
            Self::DeviceOffline => "Device offline",
            Self::PermissionDenied => "Permission denied",
            Self::TransferFailed => "Transfer failed",
            Self::TimedOut => "Transfer stalled",
            Self::Cancelled => "Transfer cancelled",
        };
        f.write_str(text)
    }
}

/// Tracked state for one in-flight upload or download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub filename: String,
    #[serde(default)]
    pub file_type: String,
    pub total_size: u64,
    pub transferred_size: u64,
    #[serde(default)]
    pub progress_percent: f64,
    pub status: TransferStatus,
    #[serde(default, with = "duration_secs")]
    pub time_remaining: Option<Duration>,
    #[serde(default = "Utc::now")]
    pub last_update_timestamp: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(
        filename: impl Into<String>,
        file_type: impl Into<String>,
        total_size: u64,
        transferred_size: u64,
        status: TransferStatus,
    ) -> Self {
        Self {
            filename: filename.into(),
            file_type: file_type.into(),
            total_size,
            transferred_size,
            progress_percent: percent_of(transferred_size, total_size),
            status,
            time_remaining: None,
            last_update_timestamp: Utc::now(),
        }
    }
}

/// `transferred / total * 100`, clamped to `[0, 100]`. A zero total reads as 0%.
pub fn percent_of(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (transferred as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// One entry in a `file_sync_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedFile {
    pub path: String,
    pub size: u64,
}

/// Connection state of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    Active,
    Invalidated,
}

/// One device pairing routed through a transfer room.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub device_id: String,
    pub username: String,
    pub transfer_room: String,
    /// Identifies the channel connection that owns this session. A session is
    /// stale once its handle no longer matches the live connection.
    pub channel_handle: u64,
    pub state: SessionState,
}

/// Deterministic room id for a `(sending, requesting)` device pair.
///
/// Both ends compute the same id independently, so the pair is ordered:
/// swapping the devices yields a different room.
pub fn transfer_room_id(sending_device_id: &str, requesting_device_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sending_device_id.as_bytes());
    hasher.update(b":");
    hasher.update(requesting_device_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("room-{}", &digest[..32])
}

/// Serializes `Option<Duration>` as whole seconds (or `null`).
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_is_deterministic_and_directional() {
        let a = transfer_room_id("laptop-1", "phone-7");
        let b = transfer_room_id("laptop-1", "phone-7");
        let swapped = transfer_room_id("phone-7", "laptop-1");
        assert_eq!(a, b);
        assert_ne!(a, swapped);
        assert!(a.starts_with("room-"));
        assert_eq!(a.len(), "room-".len() + 32);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_of(0, 0), 0.0);
        assert_eq!(percent_of(500, 1000), 50.0);
        assert_eq!(percent_of(2000, 1000), 100.0);
    }

    #[test]
    fn downloading_status_alias() {
        let raw = r#"{
            "filename": "a.txt",
            "total_size": 1000,
            "transferred_size": 0,
            "progress_percent": 0,
            "status": "downloading"
        }"#;
        let record: ProgressRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.status, TransferStatus::Transferring);
        assert_eq!(record.time_remaining, None);
    }

    #[test]
    fn time_remaining_serializes_as_seconds() {
        let mut record = ProgressRecord::new("b.bin", "", 10, 5, TransferStatus::Transferring);
        record.time_remaining = Some(Duration::from_millis(4_900));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["time_remaining"], 4);
        assert_eq!(value["status"], "transferring");
    }
}
