//! Binary protocol for persistent-socket clients.
//!
//! All integers are big-endian. Every message is a 13-byte header followed by
//! exactly `payload_length` bytes:
//!
//! ```text
//! ┌──────────────┬──────────┬────────────────┬──────────────┬───────────┐
//! │  message_id  │   type   │ payload_length │  timestamp   │  payload  │
//! │   (4 bytes)  │ (1 byte) │   (4 bytes)    │  (4 bytes)   │   (var)   │
//! └──────────────┴──────────┴────────────────┴──────────────┴───────────┘
//! ```
//!
//! A `CAPTURE_RESPONSE` payload is a 264-byte `CaptureResponse` followed by
//! `image_size` bytes of JPEG data.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

pub const HEADER_LEN: usize = 13;
pub const FILENAME_LEN: usize = 256;
pub const CAPTURE_RESPONSE_LEN: usize = 4 + 4 + FILENAME_LEN;

/// Largest inbound payload accepted from a client before the framing is
/// considered lost.
pub const MAX_COMMAND_PAYLOAD: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MessageType {
    #[default]
    Unknown,
    VideoFrame,
    CaptureCommand,
    CaptureResponse,
    Heartbeat,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Unknown => 0x00,
            MessageType::VideoFrame => 0x01,
            MessageType::CaptureCommand => 0x02,
            MessageType::CaptureResponse => 0x03,
            MessageType::Heartbeat => 0x04,
        }
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => MessageType::VideoFrame,
            0x02 => MessageType::CaptureCommand,
            0x03 => MessageType::CaptureResponse,
            0x04 => MessageType::Heartbeat,
            _ => MessageType::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: u32,
    pub message_type: MessageType,
    /// Exact number of bytes following the header on the wire.
    pub payload_length: u32,
    /// Epoch seconds.
    pub timestamp: u32,
}

impl MessageHeader {
    pub fn new(message_id: u32, message_type: MessageType, payload_length: u32) -> Self {
        Self {
            message_id,
            message_type,
            payload_length,
            timestamp: epoch_secs(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.message_id.to_be_bytes());
        out[4] = self.message_type.as_u8();
        out[5..9].copy_from_slice(&self.payload_length.to_be_bytes());
        out[9..13].copy_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    /// Decode the first `HEADER_LEN` bytes; trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(anyhow!(
                "message header needs {} bytes, got {}",
                HEADER_LEN,
                bytes.len()
            ));
        }
        Ok(Self {
            message_id: be_u32(&bytes[0..4]),
            message_type: MessageType::from(bytes[4]),
            payload_length: be_u32(&bytes[5..9]),
            timestamp: be_u32(&bytes[9..13]),
        })
    }
}

/// Payload prefix of a `CAPTURE_RESPONSE` message.
#[derive(Clone, PartialEq, Eq)]
pub struct CaptureResponse {
    /// `message_id` of the originating capture command.
    pub capture_id: u32,
    /// Length of the JPEG data following this structure.
    pub image_size: u32,
    filename: [u8; FILENAME_LEN],
}

impl CaptureResponse {
    /// Response for command `capture_id`, named `capture_<capture_id>.jpg`.
    pub fn new(capture_id: u32, image_size: u32) -> Self {
        Self::with_filename(capture_id, image_size, &format!("capture_{}.jpg", capture_id))
    }

    /// Longer names are truncated so the field stays NUL-terminated.
    pub fn with_filename(capture_id: u32, image_size: u32, filename: &str) -> Self {
        let mut field = [0u8; FILENAME_LEN];
        let bytes = filename.as_bytes();
        let len = bytes.len().min(FILENAME_LEN - 1);
        field[..len].copy_from_slice(&bytes[..len]);
        Self {
            capture_id,
            image_size,
            filename: field,
        }
    }

    /// Filename text up to the first NUL.
    pub fn filename(&self) -> String {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_LEN);
        String::from_utf8_lossy(&self.filename[..end]).into_owned()
    }

    pub fn encode(&self) -> [u8; CAPTURE_RESPONSE_LEN] {
        let mut out = [0u8; CAPTURE_RESPONSE_LEN];
        out[0..4].copy_from_slice(&self.capture_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.image_size.to_be_bytes());
        out[8..].copy_from_slice(&self.filename);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CAPTURE_RESPONSE_LEN {
            return Err(anyhow!(
                "capture response needs {} bytes, got {}",
                CAPTURE_RESPONSE_LEN,
                bytes.len()
            ));
        }
        let mut filename = [0u8; FILENAME_LEN];
        filename.copy_from_slice(&bytes[8..CAPTURE_RESPONSE_LEN]);
        Ok(Self {
            capture_id: be_u32(&bytes[0..4]),
            image_size: be_u32(&bytes[4..8]),
            filename,
        })
    }
}

impl std::fmt::Debug for CaptureResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureResponse")
            .field("capture_id", &self.capture_id)
            .field("image_size", &self.image_size)
            .field("filename", &self.filename())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Message writers
// ----------------------------------------------------------------------------

/// Write a `VIDEO_FRAME` message. `write_all` retries partial writes and fails
/// on a zero-length write.
pub fn write_video_frame<W: Write>(out: &mut W, message_id: u32, jpeg: &[u8]) -> Result<()> {
    let header = MessageHeader::new(message_id, MessageType::VideoFrame, wire_len(jpeg.len())?);
    out.write_all(&header.encode()).context("send frame header")?;
    out.write_all(jpeg).context("send frame payload")?;
    out.flush().context("flush frame")?;
    Ok(())
}

/// Write a `CAPTURE_RESPONSE` message answering command `capture_id`.
pub fn write_capture_response<W: Write>(
    out: &mut W,
    message_id: u32,
    capture_id: u32,
    jpeg: &[u8],
) -> Result<CaptureResponse> {
    let image_size = wire_len(jpeg.len())?;
    let payload_length = wire_len(CAPTURE_RESPONSE_LEN + jpeg.len())?;
    let header = MessageHeader::new(message_id, MessageType::CaptureResponse, payload_length);
    let response = CaptureResponse::new(capture_id, image_size);
    out.write_all(&header.encode())
        .context("send capture header")?;
    out.write_all(&response.encode())
        .context("send capture response")?;
    out.write_all(jpeg).context("send capture image")?;
    out.flush().context("flush capture")?;
    Ok(response)
}

/// Write a payload-less message (commands and heartbeats).
pub fn write_command<W: Write>(
    out: &mut W,
    message_id: u32,
    message_type: MessageType,
) -> Result<()> {
    let header = MessageHeader::new(message_id, message_type, 0);
    out.write_all(&header.encode()).context("send command")?;
    out.flush().context("flush command")?;
    Ok(())
}

/// Read one whole message (header and payload).
pub fn read_message<R: Read>(input: &mut R) -> Result<(MessageHeader, Vec<u8>)> {
    let mut raw = [0u8; HEADER_LEN];
    input.read_exact(&mut raw).context("read message header")?;
    let header = MessageHeader::decode(&raw)?;
    let mut payload = vec![0u8; header.payload_length as usize];
    input
        .read_exact(&mut payload)
        .with_context(|| format!("read {} byte payload", header.payload_length))?;
    Ok((header, payload))
}

// ----------------------------------------------------------------------------
// CommandDecoder: inbound framing
// ----------------------------------------------------------------------------

/// Splits the inbound byte stream of a client into messages.
///
/// Payload bytes of inbound messages are skipped; only headers are returned.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buffer: Vec<u8>,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes; returns every header whose message is now complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<MessageHeader> {
        self.buffer.extend_from_slice(bytes);
        let mut headers = Vec::new();
        while self.buffer.len() >= HEADER_LEN {
            let header = match MessageHeader::decode(&self.buffer) {
                Ok(header) => header,
                Err(_) => break,
            };
            let payload_len = header.payload_length as usize;
            if payload_len > MAX_COMMAND_PAYLOAD {
                log::warn!(
                    "client message {} announces {} byte payload; discarding {} buffered bytes",
                    header.message_id,
                    payload_len,
                    self.buffer.len()
                );
                self.buffer.clear();
                break;
            }
            let total = HEADER_LEN + payload_len;
            if self.buffer.len() < total {
                break;
            }
            self.buffer.drain(..total);
            headers.push(header);
        }
        headers
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn wire_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| anyhow!("payload of {} bytes exceeds u32 length", len))
}

/// Current time as epoch seconds, truncated to the 32-bit wire field.
pub fn epoch_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: u32, kind: MessageType, len: u32, ts: u32) -> MessageHeader {
        MessageHeader {
            message_id: id,
            message_type: kind,
            payload_length: len,
            timestamp: ts,
        }
    }

    #[test]
    fn header_round_trip() {
        let h = header(0xDEAD_BEEF, MessageType::CaptureResponse, 4096, 1_700_000_000);
        assert_eq!(MessageHeader::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn header_fields_are_big_endian() {
        let h = header(0x0102_0304, MessageType::VideoFrame, 0x0A0B_0C0D, 0x1122_3344);
        assert_eq!(
            h.encode(),
            [
                0x01, 0x02, 0x03, 0x04, 0x01, 0x0A, 0x0B, 0x0C, 0x0D, 0x11, 0x22, 0x33, 0x44
            ]
        );
    }

    #[test]
    fn short_header_is_rejected() {
        for len in 0..HEADER_LEN {
            assert!(MessageHeader::decode(&vec![0u8; len]).is_err());
        }
    }

    #[test]
    fn unknown_type_byte_decodes_as_unknown() {
        let mut raw = header(1, MessageType::Heartbeat, 0, 0).encode();
        raw[4] = 0x7F;
        assert_eq!(
            MessageHeader::decode(&raw).unwrap().message_type,
            MessageType::Unknown
        );
    }

    #[test]
    fn capture_response_layout() {
        let response = CaptureResponse::new(42, 1000);
        let raw = response.encode();
        assert_eq!(raw.len(), 264);
        assert_eq!(&raw[0..4], &[0, 0, 0, 42]);
        assert_eq!(&raw[4..8], &1000u32.to_be_bytes());
        assert_eq!(&raw[8..22], b"capture_42.jpg");
        assert!(raw[22..].iter().all(|&b| b == 0));
        assert_eq!(response.filename(), "capture_42.jpg");
    }

    #[test]
    fn long_filename_is_truncated_and_terminated() {
        let name = "x".repeat(400);
        let response = CaptureResponse::with_filename(1, 0, &name);
        let raw = response.encode();
        assert_eq!(raw[CAPTURE_RESPONSE_LEN - 1], 0);
        assert_eq!(response.filename().len(), FILENAME_LEN - 1);
        let decoded = CaptureResponse::decode(&raw).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn short_capture_response_is_rejected() {
        assert!(CaptureResponse::decode(&[0u8; CAPTURE_RESPONSE_LEN - 1]).is_err());
    }

    #[test]
    fn capture_message_layout() {
        let jpeg = [0xFF, 0xD8, 0x00, 0xFF, 0xD9];
        let mut wire = Vec::new();
        write_capture_response(&mut wire, 3, 42, &jpeg).unwrap();

        let mut cursor = wire.as_slice();
        let (h, payload) = read_message(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(h.message_id, 3);
        assert_eq!(h.message_type, MessageType::CaptureResponse);
        assert_eq!(h.payload_length as usize, CAPTURE_RESPONSE_LEN + jpeg.len());

        let response = CaptureResponse::decode(&payload).unwrap();
        assert_eq!(response.capture_id, 42);
        assert_eq!(response.image_size as usize, jpeg.len());
        assert_eq!(response.filename(), "capture_42.jpg");
        assert_eq!(&payload[CAPTURE_RESPONSE_LEN..], &jpeg);
    }

    #[test]
    fn video_message_layout() {
        let mut wire = Vec::new();
        write_video_frame(&mut wire, 9, b"jpeg").unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 4);
        let h = MessageHeader::decode(&wire).unwrap();
        assert_eq!(h.message_type, MessageType::VideoFrame);
        assert_eq!(h.payload_length, 4);
        assert_eq!(&wire[HEADER_LEN..], b"jpeg");
    }

    #[test]
    fn writer_that_accepts_nothing_fails() {
        struct Stuck;
        impl Write for Stuck {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        assert!(write_video_frame(&mut Stuck, 0, b"abc").is_err());
    }

    #[test]
    fn decoder_handles_split_and_batched_commands() {
        let a = header(1, MessageType::CaptureCommand, 0, 0).encode();
        let b = header(2, MessageType::Heartbeat, 3, 0).encode();
        let mut stream = a.to_vec();
        stream.extend_from_slice(&b);
        stream.extend_from_slice(b"xyz");

        let mut decoder = CommandDecoder::new();
        assert!(decoder.feed(&stream[..5]).is_empty());
        let got = decoder.feed(&stream[5..HEADER_LEN + 14]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_id, 1);
        let got = decoder.feed(&stream[HEADER_LEN + 14..]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_type, MessageType::Heartbeat);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_discards_oversized_payload() {
        let bogus = header(1, MessageType::CaptureCommand, u32::MAX, 0).encode();
        let mut decoder = CommandDecoder::new();
        assert!(decoder.feed(&bogus).is_empty());
        assert_eq!(decoder.pending(), 0);

        let good = header(2, MessageType::CaptureCommand, 0, 0).encode();
        assert_eq!(decoder.feed(&good)[0].message_id, 2);
    }
}
