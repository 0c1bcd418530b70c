use serde::{Deserialize, Serialize};

use crate::models::{SyncedFile, TransferFailure};

/// Control messages carried in text frames on the transfer channel.
///
/// Every message is a flat JSON object whose `message_type` field selects the
/// variant. Lifecycle notices keep the human-readable names the relay already
/// uses on the wire ("Start file transfer", "File not found", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum ControlMessage {
    /// First message after the socket opens.
    #[serde(rename = "initiate_live_data_connection")]
    InitiateLiveDataConnection {
        username: String,
        device_name: String,
        run_device_info_loop: bool,
        run_device_predictions_loop: bool,
    },

    /// Both ends must join a room before chunks flow through it.
    #[serde(rename = "join_transfer_room")]
    JoinTransferRoom {
        transfer_room: String,
        #[serde(default)]
        device_id: String,
    },

    /// Ask a device to describe itself.
    #[serde(rename = "device_info")]
    DeviceInfoRequest {
        target_device_id: String,
        #[serde(default)]
        requesting_device_id: Option<String>,
    },

    #[serde(rename = "device_info_response")]
    DeviceInfoResponse {
        device_id: String,
        device_name: String,
        username: String,
        os: String,
        #[serde(default)]
        scanned_folders: usize,
    },

    /// Ask a device for the files it is willing to serve.
    #[serde(rename = "file_sync_request")]
    FileSyncRequest {
        target_device_id: String,
        #[serde(default)]
        requesting_device_id: Option<String>,
    },

    #[serde(rename = "file_sync_response")]
    FileSyncResponse {
        device_id: String,
        files: Vec<SyncedFile>,
    },

    /// Relay asks us to stream one of our files into a room.
    #[serde(rename = "file_request")]
    FileRequest {
        file_path: String,
        transfer_room: String,
        #[serde(default)]
        requesting_device_id: Option<String>,
    },

    /// We ask a peer (through the relay) to send us one of its files.
    #[serde(rename = "download_request")]
    DownloadRequest {
        file_path: String,
        sending_device_id: String,
        requesting_device_id: String,
        transfer_room: String,
    },

    #[serde(rename = "Start file transfer")]
    StartFileTransfer {
        #[serde(default)]
        transfer_room: String,
        filename: String,
        #[serde(default)]
        file_type: String,
        file_size: u64,
    },

    #[serde(rename = "File sent successfully")]
    FileSentSuccessfully {
        #[serde(default)]
        transfer_room: String,
        #[serde(default)]
        filename: String,
    },

    #[serde(rename = "File transfer complete")]
    FileTransferComplete {
        #[serde(default)]
        transfer_room: String,
        #[serde(default)]
        filename: String,
    },

    #[serde(rename = "File transaction complete")]
    FileTransactionComplete {
        #[serde(default)]
        transfer_room: String,
        #[serde(default)]
        filename: String,
    },

    #[serde(rename = "File not found")]
    FileNotFound {
        #[serde(default)]
        transfer_room: String,
        #[serde(default)]
        filename: String,
    },

    #[serde(rename = "Device offline")]
    DeviceOffline {
        #[serde(default)]
        transfer_room: String,
        #[serde(default)]
        filename: String,
    },

    #[serde(rename = "Permission denied")]
    PermissionDenied {
        #[serde(default)]
        transfer_room: String,
        #[serde(default)]
        filename: String,
    },

    #[serde(rename = "Transfer failed")]
    TransferFailed {
        #[serde(default)]
        transfer_room: String,
        #[serde(default)]
        filename: String,
        #[serde(default)]
        reason: Option<String>,
    },

    /// Sent back to the sender once a reassembled file is on disk.
    #[serde(rename = "transfer_acknowledged")]
    TransferAcknowledged {
        transfer_room: String,
        filename: String,
        received_bytes: u64,
    },
}

impl ControlMessage {
    /// Wire name of this message, as found in `message_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitiateLiveDataConnection { .. } => "initiate_live_data_connection",
            Self::JoinTransferRoom { .. } => "join_transfer_room",
            Self::DeviceInfoRequest { .. } => "device_info",
            Self::DeviceInfoResponse { .. } => "device_info_response",
            Self::FileSyncRequest { .. } => "file_sync_request",
            Self::FileSyncResponse { .. } => "file_sync_response",
            Self::FileRequest { .. } => "file_request",
            Self::DownloadRequest { .. } => "download_request",
            Self::StartFileTransfer { .. } => "Start file transfer",
            Self::FileSentSuccessfully { .. } => "File sent successfully",
            Self::FileTransferComplete { .. } => "File transfer complete",
            Self::FileTransactionComplete { .. } => "File transaction complete",
            Self::FileNotFound { .. } => "File not found",
            Self::DeviceOffline { .. } => "Device offline",
            Self::PermissionDenied { .. } => "Permission denied",
            Self::TransferFailed { .. } => "Transfer failed",
            Self::TransferAcknowledged { .. } => "transfer_acknowledged",
        }
    }

    /// For the four failure notices, the failure they report plus the
    /// `(transfer_room, filename)` they refer to.
    pub fn failure(&self) -> Option<(TransferFailure, &str, &str)> {
        match self {
            Self::FileNotFound { transfer_room, filename } => {
                Some((TransferFailure::FileNotFound, transfer_room.as_str(), filename.as_str()))
            }
            Self::DeviceOffline { transfer_room, filename } => {
                Some((TransferFailure::DeviceOffline, transfer_room.as_str(), filename.as_str()))
            }
            Self::PermissionDenied { transfer_room, filename } => {
                Some((TransferFailure::PermissionDenied, transfer_room.as_str(), filename.as_str()))
            }
            Self::TransferFailed { transfer_room, filename, .. } => {
                Some((TransferFailure::TransferFailed, transfer_room.as_str(), filename.as_str()))
            }
            _ => None,
        }
    }

    /// `File transfer complete` and `File transaction complete` both close a
    /// download on the receiving side.
    pub fn completion(&self) -> Option<(&str, &str)> {
        match self {
            Self::FileTransferComplete { transfer_room, filename }
            | Self::FileTransactionComplete { transfer_room, filename } => {
                Some((transfer_room.as_str(), filename.as_str()))
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_payload_shape() {
        let msg = ControlMessage::InitiateLiveDataConnection {
            username: "ana".into(),
            device_name: "laptop".into(),
            run_device_info_loop: true,
            run_device_predictions_loop: false,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["message_type"], "initiate_live_data_connection");
        assert_eq!(value["username"], "ana");
        assert_eq!(value["device_name"], "laptop");
        assert_eq!(value["run_device_info_loop"], true);
        assert_eq!(value["run_device_predictions_loop"], false);
    }

    #[test]
    fn lifecycle_notice_uses_spaced_name() {
        let raw = r#"{
            "message_type": "Start file transfer",
            "transfer_room": "room-1",
            "filename": "a.txt",
            "file_type": "text/plain",
            "file_size": 12
        }"#;
        let msg: ControlMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ControlMessage::StartFileTransfer {
                transfer_room: "room-1".into(),
                filename: "a.txt".into(),
                file_type: "text/plain".into(),
                file_size: 12,
            }
        );
        assert_eq!(msg.kind(), "Start file transfer");
    }

    #[test]
    fn bare_notice_parses_with_defaults() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"message_type":"Device offline"}"#).unwrap();
        let (failure, room, filename) = msg.failure().unwrap();
        assert_eq!(failure, TransferFailure::DeviceOffline);
        assert_eq!(room, "");
        assert_eq!(filename, "");
    }

    #[test]
    fn both_completion_notices_complete() {
        for kind in ["File transfer complete", "File transaction complete"] {
            let raw = format!(
                r#"{{"message_type":"{}","transfer_room":"r","filename":"f"}}"#,
                kind
            );
            let msg: ControlMessage = serde_json::from_str(&raw).unwrap();
            assert_eq!(msg.completion(), Some(("r", "f")));
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let res = serde_json::from_str::<ControlMessage>(r#"{"message_type":"reboot_device"}"#);
        assert!(res.is_err());
    }
}
