//! Chunk reassembly for incoming downloads.
//!
//! Binary frames carry no sequence numbers: chunks are appended in arrival
//! order and the channel's transport is trusted to preserve that order. Each
//! `(transfer_room, filename)` pair owns at most one buffer. When the sender
//! signals completion the buffer is concatenated and written to the download
//! directory in a single temp-file-then-rename step.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::ReassemblyError;

/// Folder created under the user's home directory for received files.
pub const DOWNLOAD_SUBFOLDER: &str = "PeerLink Downloads";

/// Identifies one download: the room it arrives through plus the filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub transfer_room: String,
    pub filename: String,
}

impl TransferKey {
    pub fn new(transfer_room: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            transfer_room: transfer_room.into(),
            filename: filename.into(),
        }
    }
}

impl std::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.transfer_room, self.filename)
    }
}

/// Accumulated chunks for one download.
struct ChunkBuffer {
    file_type: String,
    total_size: u64,
    ordered_chunks: Vec<Bytes>,
    received_bytes: u64,
    last_activity: Instant,
    cancel: CancellationToken,
}

/// Read-only view of a live buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    pub file_type: String,
    pub total_size: u64,
    pub received_bytes: u64,
    pub chunk_count: usize,
}

pub struct Reassembler {
    download_dir: PathBuf,
    buffers: DashMap<TransferKey, ChunkBuffer>,
}

impl Reassembler {
    pub fn new(download_dir: PathBuf) -> Self {
        info!("Download directory: {}", download_dir.display());
        Self {
            download_dir,
            buffers: DashMap::new(),
        }
    }

    /// `~/PeerLink Downloads`, if a home directory can be found.
    pub fn default_download_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DOWNLOAD_SUBFOLDER))
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Create the buffer for `key`, replacing (and cancelling) any previous
    /// buffer under the same key. Returns the transfer's cancellation token.
    pub fn start_transfer(
        &self,
        key: TransferKey,
        file_type: &str,
        total_size: u64,
    ) -> Result<CancellationToken, ReassemblyError> {
        sanitize_filename(&key.filename)?;

        let cancel = CancellationToken::new();
        let buffer = ChunkBuffer {
            file_type: file_type.to_string(),
            total_size,
            ordered_chunks: Vec::new(),
            received_bytes: 0,
            last_activity: Instant::now(),
            cancel: cancel.clone(),
        };

        if let Some(previous) = self.buffers.insert(key.clone(), buffer) {
            warn!(
                "Restarting transfer {} ({} bytes discarded)",
                key, previous.received_bytes
            );
            previous.cancel.cancel();
        } else {
            debug!("Started transfer {} ({} bytes expected)", key, total_size);
        }
        Ok(cancel)
    }

    /// Append a chunk in arrival order. Empty chunks are ignored. Returns the
    /// byte count received so far.
    pub fn append_chunk(&self, key: &TransferKey, chunk: Bytes) -> Result<u64, ReassemblyError> {
        let mut buffer = self
            .buffers
            .get_mut(key)
            .ok_or_else(|| ReassemblyError::NoActiveTransfer(key.to_string()))?;

        if chunk.is_empty() {
            trace!("Ignoring empty chunk for {}", key);
            return Ok(buffer.received_bytes);
        }

        buffer.received_bytes += chunk.len() as u64;
        buffer.ordered_chunks.push(chunk);
        buffer.last_activity = Instant::now();
        trace!(
            "{}: chunk #{} -> {}/{} bytes",
            key,
            buffer.ordered_chunks.len(),
            buffer.received_bytes,
            buffer.total_size
        );
        Ok(buffer.received_bytes)
    }

    /// Write the accumulated file to the download directory and return its
    /// path. The buffer is removed whether or not the write succeeds.
    pub async fn flush(&self, key: &TransferKey) -> Result<PathBuf, ReassemblyError> {
        let (_, buffer) = self
            .buffers
            .remove(key)
            .ok_or_else(|| ReassemblyError::NoActiveTransfer(key.to_string()))?;
        buffer.cancel.cancel();

        if buffer.received_bytes == 0 {
            return Err(ReassemblyError::NoDataAccumulated(key.to_string()));
        }

        let name = sanitize_filename(&key.filename)?;
        let mut data = Vec::with_capacity(buffer.received_bytes as usize);
        for chunk in &buffer.ordered_chunks {
            data.extend_from_slice(chunk);
        }

        if buffer.total_size != 0 && buffer.received_bytes != buffer.total_size {
            warn!(
                "{}: expected {} bytes, writing {}",
                key, buffer.total_size, buffer.received_bytes
            );
        }

        let path = self.write_atomic(&name, &data).await?;
        info!(
            "Saved {} ({} bytes, {} chunks) to {}",
            key,
            data.len(),
            buffer.ordered_chunks.len(),
            path.display()
        );
        Ok(path)
    }

    async fn write_atomic(&self, name: &str, data: &[u8]) -> Result<PathBuf, ReassemblyError> {
        fs::create_dir_all(&self.download_dir).await?;

        let final_path = self.download_dir.join(name);
        let temp_path = self.download_dir.join(format!(".{}.part", name));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            fs::remove_file(&temp_path).await.ok();
            return Err(e.into());
        }
        Ok(final_path)
    }

    /// Drop the buffer for `key` without writing. Returns the bytes discarded.
    pub fn abort(&self, key: &TransferKey) -> Option<u64> {
        self.buffers.remove(key).map(|(_, buffer)| {
            buffer.cancel.cancel();
            debug!("Aborted {} ({} bytes dropped)", key, buffer.received_bytes);
            buffer.received_bytes
        })
    }

    /// Drop every buffer, e.g. when the channel connection is lost.
    pub fn discard_all(&self) -> Vec<TransferKey> {
        let keys: Vec<TransferKey> = self.buffers.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.abort(key);
        }
        keys
    }

    /// Signal cancellation for one transfer. The owner of the token is
    /// expected to call `abort`.
    pub fn cancel(&self, key: &TransferKey) -> bool {
        match self.buffers.get(key) {
            Some(buffer) => {
                buffer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancellation_token(&self, key: &TransferKey) -> Option<CancellationToken> {
        self.buffers.get(key).map(|b| b.cancel.clone())
    }

    /// Time since the last chunk (or since start) for a live transfer.
    pub fn idle_for(&self, key: &TransferKey) -> Option<Duration> {
        self.buffers.get(key).map(|b| b.last_activity.elapsed())
    }

    pub fn info(&self, key: &TransferKey) -> Option<BufferInfo> {
        self.buffers.get(key).map(|b| BufferInfo {
            file_type: b.file_type.clone(),
            total_size: b.total_size,
            received_bytes: b.received_bytes,
            chunk_count: b.ordered_chunks.len(),
        })
    }

    pub fn contains(&self, key: &TransferKey) -> bool {
        self.buffers.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.buffers.len()
    }
}

/// Reduce a peer-supplied filename to a single safe path component.
pub fn sanitize_filename(filename: &str) -> Result<String, ReassemblyError> {
    if filename.contains('\0') {
        return Err(ReassemblyError::InvalidFilename(filename.to_string()));
    }
    // Peers on other platforms may send either separator.
    let last = filename.rsplit(['/', '\\']).next().unwrap_or("");
    match last {
        "" | "." | ".." => Err(ReassemblyError::InvalidFilename(filename.to_string())),
        name => Ok(name.to_string()),
    }
}
