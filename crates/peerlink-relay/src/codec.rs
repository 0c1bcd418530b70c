//! Reading and writing [`FramedMessage`]s over a byte stream in either wire
//! format.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::RelayError;
use crate::protocol::{decode_frame, parse_legacy, FramedMessage, MAX_FRAME_SIZE};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// `KIND:...:END_OF_HEADER` followed by the payload. Only for relays
    /// that predate length-prefixed framing.
    Legacy,
    /// `[u32 BE frame length][u16 BE header length][header][payload]`.
    #[default]
    LengthPrefixed,
}

impl WireFormat {
    pub fn encode(self, msg: &FramedMessage) -> Result<bytes::Bytes, RelayError> {
        match self {
            WireFormat::Legacy => Ok(msg.encode_legacy()),
            WireFormat::LengthPrefixed => msg.encode_length_prefixed(),
        }
    }
}

/// Pulls whole messages off a reader, buffering partial reads.
pub struct MessageReader<R> {
    inner: R,
    format: WireFormat,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, format: WireFormat) -> Self {
        Self {
            inner,
            format,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Next message, or `None` on a clean close between messages.
    pub async fn read_message(&mut self) -> Result<Option<FramedMessage>, RelayError> {
        match self.format {
            WireFormat::Legacy => self.read_legacy().await,
            WireFormat::LengthPrefixed => self.read_length_prefixed().await,
        }
    }

    async fn read_legacy(&mut self) -> Result<Option<FramedMessage>, RelayError> {
        loop {
            if let Some((msg, consumed)) = parse_legacy(&self.buf)? {
                self.buf.advance(consumed);
                trace!("legacy {} ({} bytes)", msg.kind(), consumed);
                return Ok(Some(msg));
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RelayError::UnexpectedEof(self.buf.len()));
            }
        }
    }

    async fn read_length_prefixed(&mut self) -> Result<Option<FramedMessage>, RelayError> {
        let frame_len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if frame_len < 2 || frame_len > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge(frame_len));
        }

        let mut frame = BytesMut::zeroed(frame_len);
        self.inner.read_exact(&mut frame).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                RelayError::UnexpectedEof(frame_len)
            } else {
                e.into()
            }
        })?;

        let msg = decode_frame(frame.freeze())?;
        trace!("framed {} ({} bytes)", msg.kind(), frame_len);
        Ok(Some(msg))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encode and write one message, then flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    format: WireFormat,
    msg: &FramedMessage,
) -> Result<(), RelayError> {
    let wire = format.encode(msg)?;
    writer.write_all(&wire).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    async fn pipe(format: WireFormat, messages: &[FramedMessage]) -> Vec<FramedMessage> {
        let (mut client, server) = tokio::io::duplex(1024);
        let to_send = messages.to_vec();
        let writer = tokio::spawn(async move {
            for msg in &to_send {
                write_message(&mut client, format, msg).await.unwrap();
            }
        });

        let mut reader = MessageReader::new(server, format);
        let mut out = Vec::new();
        while let Some(msg) = reader.read_message().await.unwrap() {
            out.push(msg);
        }
        writer.await.unwrap();
        out
    }

    fn sample() -> Vec<FramedMessage> {
        vec![
            FramedMessage::file_response("photo.jpg", Bytes::from(vec![7u8; 5000])),
            FramedMessage::device_delete(vec!["old-phone".into(), "tablet".into()], "ana"),
            FramedMessage::file_response("empty.txt", Bytes::new()),
        ]
    }

    #[tokio::test]
    async fn legacy_stream_splits_messages() {
        assert_eq!(pipe(WireFormat::Legacy, &sample()).await, sample());
    }

    #[tokio::test]
    async fn length_prefixed_stream_splits_messages() {
        assert_eq!(pipe(WireFormat::LengthPrefixed, &sample()).await, sample());
    }

    #[tokio::test]
    async fn truncated_legacy_payload_is_an_error() {
        let (mut client, server) = tokio::io::duplex(256);
        client
            .write_all(b"FILE_REQUEST_RESPONSE:a.bin:100::END_OF_HEADERonly-some")
            .await
            .unwrap();
        drop(client);

        let mut reader = MessageReader::new(server, WireFormat::Legacy);
        assert!(matches!(reader.read_message().await, Err(RelayError::UnexpectedEof(_))));
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let mut reader = MessageReader::new(server, WireFormat::LengthPrefixed);
        assert!(matches!(reader.read_message().await, Err(RelayError::FrameTooLarge(_))));
    }
}
