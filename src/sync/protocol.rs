//! Binary WebSocket protocol for document synchronization.
//!
//! Every frame is `[version u8][frame type u8][payload len u24][bincode payload]`.
//! The payload of the sync frames is a [`SyncUpdate`]: session, file, the
//! sender's state vector and a batch of raw Automerge changes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::document::SyncUpdate;
use super::SessionId;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 2;

/// Maximum frame size (the u24 length field caps payloads just under 16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Frame type identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Error = 0x04,

    // State-vector exchange
    SyncRequest = 0x10,
    SyncReply = 0x11,

    // Incremental changes
    Update = 0x12,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::SyncRequest),
            0x11 => Ok(MessageType::SyncReply),
            0x12 => Ok(MessageType::Update),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Frames exchanged on the sync socket, in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncFrame {
    /// State-vector-only request; the operation batch is always empty
    SyncRequest(SyncUpdate),

    /// Answer to a request: what the requester lacks plus the responder's state vector
    SyncReply(SyncUpdate),

    /// Incremental changes from a local edit or a relay
    Update(SyncUpdate),

    /// Server-side rejection, informational only
    Error {
        session_id: SessionId,
        message: String,
    },
}

impl SyncFrame {
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncFrame::SyncRequest(_) => MessageType::SyncRequest,
            SyncFrame::SyncReply(_) => MessageType::SyncReply,
            SyncFrame::Update(_) => MessageType::Update,
            SyncFrame::Error { .. } => MessageType::Error,
        }
    }

    /// The update carried by this frame, if any
    pub fn update(&self) -> Option<&SyncUpdate> {
        match self {
            SyncFrame::SyncRequest(update)
            | SyncFrame::SyncReply(update)
            | SyncFrame::Update(update) => Some(update),
            SyncFrame::Error { .. } => None,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SyncFrame::Error { session_id, .. } => session_id,
            other => other
                .update()
                .map(|update| update.session_id.as_str())
                .unwrap_or_default(),
        }
    }
}

/// Protocol codec for encoding/decoding frames
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a frame to bytes
    pub fn encode(frame: &SyncFrame) -> Result<Bytes, ProtocolError> {
        if let SyncFrame::SyncRequest(update) = frame {
            if !update.is_empty() {
                return Err(ProtocolError::InvalidFormat(
                    "SyncRequest must not carry operations".to_string(),
                ));
            }
        }

        let payload = bincode::serialize(frame)?;

        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(frame.message_type() as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a frame from bytes
    pub fn decode(data: &[u8]) -> Result<SyncFrame, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
        let frame: SyncFrame = bincode::deserialize(payload)?;

        if frame.message_type() != msg_type {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header says {:?} but payload is {:?}",
                msg_type,
                frame.message_type()
            )));
        }
        if let SyncFrame::SyncRequest(update) = &frame {
            if !update.is_empty() {
                return Err(ProtocolError::InvalidFormat(
                    "SyncRequest must not carry operations".to_string(),
                ));
            }
        }

        Ok(frame)
    }

    /// Create an error frame
    pub fn error_frame(session_id: impl Into<String>, message: impl Into<String>) -> SyncFrame {
        SyncFrame::Error {
            session_id: session_id.into(),
            message: message.into(),
        }
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::document::StateVector;

    fn update(ops: Vec<Vec<u8>>) -> SyncUpdate {
        SyncUpdate::new("demo", "app.tsx", StateVector::default(), ops)
    }

    #[test]
    fn test_encode_decode_update() {
        let frame = SyncFrame::Update(update(vec![vec![1, 2, 3], vec![0, 255]]));

        let encoded = SyncProtocol::encode(&frame).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::Update as u8);

        let decoded = SyncProtocol::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.session_id(), "demo");
    }

    #[test]
    fn test_sync_request_must_be_state_only() {
        let frame = SyncFrame::SyncRequest(update(vec![vec![9]]));
        assert!(matches!(
            SyncProtocol::encode(&frame),
            Err(ProtocolError::InvalidFormat(_))
        ));

        let ok = SyncFrame::SyncRequest(update(Vec::new()));
        let decoded = SyncProtocol::decode(&SyncProtocol::encode(&ok).unwrap()).unwrap();
        assert_eq!(decoded.message_type(), MessageType::SyncRequest);
    }

    #[test]
    fn test_version_mismatch() {
        let data = SyncProtocol::encode(&SyncProtocol::error_frame("demo", "nope")).unwrap();
        let mut bytes = data.to_vec();
        bytes[0] = 0xFF;

        let result = SyncProtocol::decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_truncated_frame() {
        let data = SyncProtocol::encode(&SyncFrame::Update(update(vec![vec![7; 64]]))).unwrap();
        let result = SyncProtocol::decode(&data[..data.len() - 10]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
        assert!(SyncProtocol::decode(&[PROTOCOL_VERSION, 0x12]).is_err());
    }

    #[test]
    fn test_header_payload_mismatch() {
        let data = SyncProtocol::encode(&SyncFrame::Update(update(Vec::new()))).unwrap();
        let mut bytes = data.to_vec();
        bytes[1] = MessageType::SyncReply as u8;
        assert!(matches!(
            SyncProtocol::decode(&bytes),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x10).unwrap(), MessageType::SyncRequest);
        assert_eq!(MessageType::try_from(0x12).unwrap(), MessageType::Update);
        assert!(MessageType::try_from(0xFF).is_err());
    }
}
