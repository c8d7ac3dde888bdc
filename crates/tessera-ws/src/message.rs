//! Message and event metadata.
//!
//! [`FrameInfo`] and [`MessageInfo`] describe what the engine received and
//! accompany every handler callback. [`Message`] is an owned convenience
//! view for applications that prefer matching on a decoded value over raw
//! payload bytes.

use std::borrow::Cow;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CloseCode, WsError, WsResult};
use crate::frame::OpCode;

/// Kind of a message delivered to the application or sent by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Text payload.
    Text,
    /// Binary payload.
    Binary,
    /// A Ping surfaced because `emit_ping_messages` is enabled.
    Ping,
}

impl MessageKind {
    /// Opcode of the first frame carrying a message of this kind.
    pub fn opcode(self) -> OpCode {
        match self {
            Self::Text => OpCode::Text,
            Self::Binary => OpCode::Binary,
            Self::Ping => OpCode::Ping,
        }
    }

    /// Kind of a data message that started with `opcode`.
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::Text => Some(Self::Text),
            OpCode::Binary => Some(Self::Binary),
            OpCode::Ping => Some(Self::Ping),
            _ => None,
        }
    }

    /// Lowercase name, used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Ping => "ping",
        }
    }
}

/// Metadata of a single received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame opcode.
    pub opcode: OpCode,
    /// FIN bit.
    pub fin: bool,
    /// RSV1 (compressed) bit.
    pub compressed: bool,
    /// Whether the peer masked the frame.
    pub masked: bool,
    /// Payload length on the wire.
    pub payload_len: usize,
}

/// Metadata of a completed, reassembled and decompressed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    /// Message kind.
    pub kind: MessageKind,
    /// Whether it arrived compressed.
    pub compressed: bool,
    /// Number of frames it arrived in.
    pub fragments: usize,
    /// Length of the delivered payload.
    pub len: usize,
}

/// Character encoding of Text payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    /// UTF-8, as RFC 6455 requires.
    #[default]
    Utf8,
    /// ISO-8859-1, one byte per character.
    Latin1,
}

impl TextEncoding {
    /// Decode a Text payload.
    pub fn decode(self, data: &[u8]) -> WsResult<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(data)
                .map(str::to_string)
                .map_err(|e| WsError::DecodeFailed(e.to_string())),
            Self::Latin1 => Ok(data.iter().map(|&b| char::from(b)).collect()),
        }
    }

    /// Encode text for a Text payload.
    pub fn encode(self, text: &str) -> WsResult<Bytes> {
        match self {
            Self::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Self::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        WsError::EncodeFailed(format!("{c:?} is not representable in Latin-1"))
                    })
                })
                .collect::<WsResult<Vec<u8>>>()
                .map(Bytes::from),
        }
    }
}

/// A decoded WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
    /// A ping with its payload.
    Ping(Bytes),
    /// A pong with its payload.
    Pong(Bytes),
    /// A close frame with optional code and reason.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Create a new text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create a new binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Create a close message with a code and reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame::new(code, reason)))
    }

    /// Build a message from a delivered payload.
    pub fn from_parts(kind: MessageKind, payload: Bytes, encoding: TextEncoding) -> WsResult<Self> {
        Ok(match kind {
            MessageKind::Text => Self::Text(encoding.decode(&payload)?),
            MessageKind::Binary => Self::Binary(payload),
            MessageKind::Ping => Self::Ping(payload),
        })
    }

    /// Check if this is a text message.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Check if this is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Check if this is a close message.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    /// Get the message payload as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the message payload as bytes. `None` for close messages.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(s) => Some(s.as_bytes()),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => Some(b),
            Self::Close(_) => None,
        }
    }

    /// Parse a text message as JSON.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> WsResult<T> {
        let text = self
            .as_text()
            .ok_or_else(|| WsError::DecodeFailed("not a text message".to_string()))?;
        serde_json::from_str(text).map_err(|e| WsError::DecodeFailed(e.to_string()))
    }

    /// Create a text message from a JSON-serializable value.
    pub fn from_json<T: Serialize>(value: &T) -> WsResult<Self> {
        let text =
            serde_json::to_string(value).map_err(|e| WsError::EncodeFailed(e.to_string()))?;
        Ok(Self::Text(text))
    }

    /// Length of the message payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => b.len(),
            Self::Close(Some(frame)) => 2 + frame.reason.len(),
            Self::Close(None) => 0,
        }
    }

    /// Check if the message payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b.into())
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<tungstenite::Message> for Message {
    fn from(msg: tungstenite::Message) -> Self {
        match msg {
            tungstenite::Message::Text(s) => Self::Text(s.as_str().to_string()),
            tungstenite::Message::Binary(b) => Self::Binary(b),
            tungstenite::Message::Ping(b) => Self::Ping(b),
            tungstenite::Message::Pong(b) => Self::Pong(b),
            tungstenite::Message::Close(frame) => Self::Close(frame.map(CloseFrame::from)),
            tungstenite::Message::Frame(frame) => {
                Self::Binary(Bytes::copy_from_slice(frame.payload()))
            }
        }
    }
}

impl From<Message> for tungstenite::Message {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(s) => Self::Text(s.into()),
            Message::Binary(b) => Self::Binary(b),
            Message::Ping(b) => Self::Ping(b),
            Message::Pong(b) => Self::Pong(b),
            Message::Close(frame) => {
                Self::Close(frame.map(tungstenite::protocol::CloseFrame::from))
            }
        }
    }
}

/// Code and reason of a Close message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// The close code.
    pub code: u16,
    /// The close reason.
    pub reason: Cow<'static, str>,
}

impl CloseFrame {
    /// Create a new close frame.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            reason: Cow::Owned(reason.into()),
        }
    }

    /// The close code as a known [`CloseCode`], if it is one.
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_u16(self.code)
    }
}

impl From<tungstenite::protocol::CloseFrame> for CloseFrame {
    fn from(frame: tungstenite::protocol::CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: Cow::Owned(frame.reason.as_str().to_string()),
        }
    }
}

impl From<CloseFrame> for tungstenite::protocol::CloseFrame {
    fn from(frame: CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: frame.reason.into_owned().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_opcode() {
        assert_eq!(MessageKind::Text.opcode(), OpCode::Text);
        assert_eq!(MessageKind::from_opcode(OpCode::Binary), Some(MessageKind::Binary));
        assert_eq!(MessageKind::from_opcode(OpCode::Close), None);
    }

    #[test]
    fn test_utf8_decode_rejects_invalid() {
        assert_eq!(TextEncoding::Utf8.decode(b"hola").unwrap(), "hola");
        assert!(TextEncoding::Utf8.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_latin1_round_trip() {
        let encoded = TextEncoding::Latin1.encode("café").unwrap();
        assert_eq!(&encoded[..], &[b'c', b'a', b'f', 0xe9]);
        assert_eq!(TextEncoding::Latin1.decode(&encoded).unwrap(), "café");
        assert!(TextEncoding::Latin1.encode("€").is_err());
    }

    #[test]
    fn test_from_parts() {
        let msg = Message::from_parts(
            MessageKind::Text,
            Bytes::from_static(b"HOLA"),
            TextEncoding::Utf8,
        )
        .unwrap();
        assert_eq!(msg.as_text(), Some("HOLA"));

        let msg = Message::from_parts(
            MessageKind::Binary,
            Bytes::from_static(&[1, 2]),
            TextEncoding::Utf8,
        )
        .unwrap();
        assert!(msg.is_binary());
        assert_eq!(msg.len(), 2);
    }

    #[test]
    fn test_message_json() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Data {
            value: i32,
        }

        let data = Data { value: 42 };
        let msg = Message::from_json(&data).unwrap();
        assert!(msg.is_text());

        let parsed: Data = msg.json().unwrap();
        assert_eq!(parsed, data);
        assert!(Message::binary(vec![1u8]).json::<Data>().is_err());
    }

    #[test]
    fn test_close_frame_close_code() {
        let msg = Message::close(CloseCode::Normal, "bye");
        assert!(msg.is_close());
        assert_eq!(msg.len(), 5);

        let frame = CloseFrame {
            code: 4999,
            reason: Cow::Borrowed(""),
        };
        assert_eq!(frame.close_code(), None);
    }

    #[test]
    fn test_tungstenite_conversion() {
        let msg: tungstenite::Message = Message::text("hi").into();
        assert_eq!(Message::from(msg), Message::text("hi"));

        let close: tungstenite::Message = Message::close(CloseCode::GoingAway, "later").into();
        match Message::from(close) {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1001);
                assert_eq!(frame.reason, "later");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
