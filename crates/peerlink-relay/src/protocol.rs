/// Relay socket messages and their two wire encodings.
///
/// Legacy (sentinel) framing, still spoken by older relay peers:
///
/// ```text
/// FILE_REQUEST_RESPONSE:<filename>:<fileSize>:<reserved>:END_OF_HEADER<fileSize bytes>
/// DEVICE_DELETE_REQUEST:<deviceNames>:<reserved>:<username>:END_OF_HEADER
/// ```
///
/// Length-prefixed framing:
///
/// ```text
/// [frame_len (u32 BE)][header_len (u16 BE)][header fields joined by ':'][payload]
/// ```
///
/// `frame_len` counts everything after itself. Filenames may contain `:`, so
/// header fields are always taken from the right.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RelayError;

pub const END_OF_HEADER: &[u8] = b"END_OF_HEADER";

pub const FILE_REQUEST_RESPONSE: &str = "FILE_REQUEST_RESPONSE";
pub const DEVICE_DELETE_REQUEST: &str = "DEVICE_DELETE_REQUEST";

/// Longest legacy header accepted before the sentinel must have appeared.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Largest single message (header plus payload). A file response carries the
/// whole file.
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Length-prefix overhead: frame length plus header length.
pub const PREFIX_LEN: usize = 4 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedMessage {
    FileRequestResponse {
        filename: String,
        file_size: u64,
        reserved: String,
        payload: Bytes,
    },
    DeviceDeleteRequest {
        device_names: Vec<String>,
        reserved: String,
        username: String,
    },
}

impl FramedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileRequestResponse { .. } => FILE_REQUEST_RESPONSE,
            Self::DeviceDeleteRequest { .. } => DEVICE_DELETE_REQUEST,
        }
    }

    pub fn file_response(filename: impl Into<String>, payload: Bytes) -> Self {
        Self::FileRequestResponse {
            filename: filename.into(),
            file_size: payload.len() as u64,
            reserved: String::new(),
            payload,
        }
    }

    pub fn device_delete(device_names: Vec<String>, username: impl Into<String>) -> Self {
        Self::DeviceDeleteRequest {
            device_names,
            reserved: String::new(),
            username: username.into(),
        }
    }

    /// Header fields after the kind, in wire order.
    fn fields(&self) -> Vec<String> {
        match self {
            Self::FileRequestResponse { filename, file_size, reserved, .. } => {
                vec![filename.clone(), file_size.to_string(), reserved.clone()]
            }
            Self::DeviceDeleteRequest { device_names, reserved, username } => {
                vec![device_names.join(","), reserved.clone(), username.clone()]
            }
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::FileRequestResponse { payload, .. } => payload,
            Self::DeviceDeleteRequest { .. } => &[],
        }
    }

    /// `KIND:field:field:...` without any terminator.
    fn header_text(&self) -> String {
        let mut parts = vec![self.kind().to_string()];
        parts.extend(self.fields());
        parts.join(":")
    }

    pub fn encode_legacy(&self) -> Bytes {
        let header = self.header_text();
        let payload = self.payload();
        let mut buf =
            BytesMut::with_capacity(header.len() + 1 + END_OF_HEADER.len() + payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_u8(b':');
        buf.put_slice(END_OF_HEADER);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn encode_length_prefixed(&self) -> Result<Bytes, RelayError> {
        let header = self.header_text();
        let payload = self.payload();
        let header_len = u16::try_from(header.len())
            .map_err(|_| RelayError::MalformedHeader(format!("{} byte header", header.len())))?;
        let frame_len = 2 + header.len() + payload.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge(frame_len));
        }

        let mut buf = BytesMut::with_capacity(4 + frame_len);
        buf.put_u32(frame_len as u32);
        buf.put_u16(header_len);
        buf.put_slice(header.as_bytes());
        buf.put_slice(payload);
        Ok(buf.freeze())
    }
}

/// Header as read off the wire, before the payload is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Header {
    FileRequestResponse { filename: String, file_size: u64, reserved: String },
    DeviceDeleteRequest { device_names: Vec<String>, reserved: String, username: String },
}

impl Header {
    fn parse(text: &str) -> Result<Self, RelayError> {
        let (kind, rest) = text
            .split_once(':')
            .ok_or_else(|| RelayError::MalformedHeader(text.to_string()))?;

        match kind {
            FILE_REQUEST_RESPONSE => {
                let mut it = rest.rsplitn(3, ':');
                let (reserved, size, filename) = match (it.next(), it.next(), it.next()) {
                    (Some(r), Some(s), Some(f)) => (r, s, f),
                    _ => return Err(RelayError::MalformedHeader(text.to_string())),
                };
                if filename.is_empty() {
                    return Err(RelayError::InvalidField {
                        field: "filename",
                        value: filename.to_string(),
                    });
                }
                let file_size = size.trim().parse::<u64>().map_err(|_| RelayError::InvalidField {
                    field: "file size",
                    value: size.to_string(),
                })?;
                Ok(Header::FileRequestResponse {
                    filename: filename.to_string(),
                    file_size,
                    reserved: reserved.to_string(),
                })
            }
            DEVICE_DELETE_REQUEST => {
                let mut it = rest.rsplitn(3, ':');
                let (username, reserved, names) = match (it.next(), it.next(), it.next()) {
                    (Some(u), Some(r), Some(n)) => (u, r, n),
                    _ => return Err(RelayError::MalformedHeader(text.to_string())),
                };
                let device_names = names
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(String::from)
                    .collect();
                Ok(Header::DeviceDeleteRequest {
                    device_names,
                    reserved: reserved.to_string(),
                    username: username.to_string(),
                })
            }
            other => Err(RelayError::UnknownKind(other.to_string())),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Header::FileRequestResponse { file_size, .. } => *file_size as usize,
            Header::DeviceDeleteRequest { .. } => 0,
        }
    }

    fn with_payload(self, payload: Bytes) -> FramedMessage {
        match self {
            Header::FileRequestResponse { filename, file_size, reserved } => {
                FramedMessage::FileRequestResponse { filename, file_size, reserved, payload }
            }
            Header::DeviceDeleteRequest { device_names, reserved, username } => {
                FramedMessage::DeviceDeleteRequest { device_names, reserved, username }
            }
        }
    }
}

fn header_str(bytes: &[u8]) -> Result<&str, RelayError> {
    std::str::from_utf8(bytes)
        .map_err(|_| RelayError::MalformedHeader(String::from_utf8_lossy(bytes).into_owned()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Try to take one legacy message off the front of `buf`.
///
/// Returns `Ok(None)` until the sentinel and the full payload have arrived.
/// On success, also returns how many bytes of `buf` the message used.
pub fn parse_legacy(buf: &[u8]) -> Result<Option<(FramedMessage, usize)>, RelayError> {
    let Some(sentinel_at) = find(buf, END_OF_HEADER) else {
        if buf.len() > MAX_HEADER_LEN {
            return Err(RelayError::FrameTooLarge(buf.len()));
        }
        return Ok(None);
    };

    let raw = &buf[..sentinel_at];
    let raw = raw.strip_suffix(b":").unwrap_or(raw);
    let header = Header::parse(header_str(raw)?)?;

    let payload_start = sentinel_at + END_OF_HEADER.len();
    let payload_len = header.payload_len();
    if payload_len > MAX_FRAME_SIZE {
        return Err(RelayError::FrameTooLarge(payload_len));
    }
    let end = payload_start + payload_len;
    if buf.len() < end {
        return Ok(None);
    }

    let payload = Bytes::copy_from_slice(&buf[payload_start..end]);
    Ok(Some((header.with_payload(payload), end)))
}

/// Decode the body of a length-prefixed frame (everything after `frame_len`).
pub fn decode_frame(frame: Bytes) -> Result<FramedMessage, RelayError> {
    if frame.len() < 2 {
        return Err(RelayError::MalformedHeader(format!("{} byte frame", frame.len())));
    }
    let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let header_end = 2 + header_len;
    if frame.len() < header_end {
        return Err(RelayError::MalformedHeader(format!(
            "header length {} exceeds frame of {}",
            header_len,
            frame.len()
        )));
    }

    let header = Header::parse(header_str(&frame[2..header_end])?)?;
    let payload = frame.slice(header_end..);
    if let Header::FileRequestResponse { file_size, .. } = &header {
        if *file_size != payload.len() as u64 {
            return Err(RelayError::InvalidField {
                field: "file size",
                value: format!("{} (payload is {})", file_size, payload.len()),
            });
        }
    }
    Ok(header.with_payload(payload))
}
