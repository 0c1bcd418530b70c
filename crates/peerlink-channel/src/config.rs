use std::path::PathBuf;
use std::time::Duration;

use peerlink_transfer::Reassembler;

use crate::error::ChannelError;

pub const DEFAULT_CHANNEL_URL: &str = "ws://127.0.0.1:8000/ws/transfer";
pub const DEFAULT_DEVICE_NAME: &str = "peerlink-device";
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Ping every 15 seconds; two missed pongs drop the connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base URL; the device id is appended as a path segment.
    pub base_url: String,
    pub username: String,
    pub device_id: String,
    pub device_name: String,
    pub run_device_info_loop: bool,
    pub run_device_predictions_loop: bool,
    pub download_dir: PathBuf,
    pub scanned_folders: Vec<PathBuf>,
    pub chunk_size: usize,
    pub heartbeat_interval: Duration,
    pub transfer_idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            device_id: device_id.into(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            run_device_info_loop: true,
            run_device_predictions_loop: false,
            download_dir: Reassembler::default_download_dir().unwrap_or_else(|| {
                PathBuf::from(peerlink_transfer::reassembler::DOWNLOAD_SUBFOLDER)
            }),
            scanned_folders: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            transfer_idle_timeout: TRANSFER_IDLE_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Read `PEERLINK_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ChannelError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset optional keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ChannelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ChannelError::Config(format!("{} is not set", key)))
        };

        let base_url = lookup("PEERLINK_CHANNEL_URL").unwrap_or_else(|| DEFAULT_CHANNEL_URL.into());
        let mut config = Self::new(
            base_url,
            required("PEERLINK_USERNAME")?,
            required("PEERLINK_DEVICE_ID")?,
        );

        if let Some(name) = lookup("PEERLINK_DEVICE_NAME").filter(|v| !v.is_empty()) {
            config.device_name = name;
        }
        if let Some(dir) = lookup("PEERLINK_DOWNLOAD_DIR").filter(|v| !v.is_empty()) {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(folders) = lookup("PEERLINK_SCANNED_FOLDERS") {
            config.scanned_folders = std::env::split_paths(&folders)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Some(v) = lookup("PEERLINK_CHUNK_SIZE") {
            config.chunk_size = parse(&v, "PEERLINK_CHUNK_SIZE")?;
            if config.chunk_size == 0 {
                return Err(ChannelError::Config("PEERLINK_CHUNK_SIZE must be positive".into()));
            }
        }
        if let Some(v) = lookup("PEERLINK_TRANSFER_IDLE_SECS") {
            config.transfer_idle_timeout =
                Duration::from_secs(parse(&v, "PEERLINK_TRANSFER_IDLE_SECS")?);
        }
        if let Some(v) = lookup("PEERLINK_DEVICE_INFO_LOOP") {
            config.run_device_info_loop = parse_bool(&v, "PEERLINK_DEVICE_INFO_LOOP")?;
        }
        if let Some(v) = lookup("PEERLINK_PREDICTIONS_LOOP") {
            config.run_device_predictions_loop = parse_bool(&v, "PEERLINK_PREDICTIONS_LOOP")?;
        }
        Ok(config)
    }

    /// `<base>/<device_id>/`
    pub fn endpoint(&self) -> String {
        format!("{}/{}/", self.base_url.trim_end_matches('/'), self.device_id)
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ChannelError> {
    value
        .trim()
        .parse()
        .map_err(|_| ChannelError::Config(format!("{}: invalid value {:?}", key, value)))
}

fn parse_bool(value: &str, key: &str) -> Result<bool, ChannelError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ChannelError::Config(format!("{}: invalid value {:?}", key, value))),
    }
}
