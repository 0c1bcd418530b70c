use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::codec::{write_message, MessageReader, WireFormat};
use crate::error::RelayError;
use crate::protocol::FramedMessage;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw-socket connection to the relay.
pub struct RelayClient {
    reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    format: WireFormat,
    peer: String,
}

impl RelayClient {
    pub async fn connect(
        host: &str,
        port: u16,
        format: WireFormat,
        connect_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let peer = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RelayError::ConnectTimeout(peer.clone()))??;

        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_nodelay(true)?;

        info!("Connected to relay {} ({:?} framing)", peer, format);
        Ok(Self::from_stream(stream, format, peer))
    }

    pub fn from_stream(stream: TcpStream, format: WireFormat, peer: String) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: MessageReader::new(reader, format),
            writer,
            format,
            peer,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub async fn send(&mut self, msg: &FramedMessage) -> Result<(), RelayError> {
        debug!("-> {} {} ({} payload bytes)", self.peer, msg.kind(), msg.payload().len());
        write_message(&mut self.writer, self.format, msg).await
    }

    /// Send the file at `path` as one `FILE_REQUEST_RESPONSE`. Returns the
    /// byte count sent.
    pub async fn serve_file(&mut self, path: &Path) -> Result<u64, RelayError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RelayError::InvalidField {
                field: "filename",
                value: path.display().to_string(),
            })?
            .to_string();

        let data = tokio::fs::read(path).await?;
        let size = data.len() as u64;
        self.send(&FramedMessage::file_response(filename, Bytes::from(data)))
            .await?;
        info!("Served {} ({} bytes) to {}", path.display(), size, self.peer);
        Ok(size)
    }

    pub async fn request_device_delete(
        &mut self,
        device_names: &[String],
        username: &str,
    ) -> Result<(), RelayError> {
        if device_names.is_empty() {
            return Err(RelayError::InvalidField {
                field: "device names",
                value: String::new(),
            });
        }
        self.send(&FramedMessage::device_delete(device_names.to_vec(), username))
            .await
    }

    /// Next message from the relay, or `None` once it closes the socket.
    pub async fn next_message(&mut self) -> Result<Option<FramedMessage>, RelayError> {
        self.reader.read_message().await
    }
}
