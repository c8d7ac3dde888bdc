//! RFC 6455 §5.2 frame codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               | Masking-key, if MASK set to 1 |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! Decoding reads from any [`AsyncRead`] and tolerates arbitrary chunking:
//! every field is filled with `read_exact`, so a short read surfaces as
//! [`FrameError::Io`] rather than a decode error.

use std::fmt;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{FrameError, WsError, WsResult};
use crate::payload::{apply_mask, PayloadData};

/// Largest payload length a single frame may declare (2^63 - 1).
pub const MAX_FRAME_PAYLOAD: u64 = i64::MAX as u64;

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const READ_CHUNK: usize = 64 * 1024;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation of a fragmented message (0x0).
    Continuation,
    /// UTF-8 text (0x1).
    Text,
    /// Binary data (0x2).
    Binary,
    /// Connection close (0x8).
    Close,
    /// Ping (0x9).
    Ping,
    /// Pong (0xA).
    Pong,
}

impl OpCode {
    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Text and Binary. Continuation is neither data nor control.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> Self {
        match opcode {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Continuation => "continuation",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// The fixed and variable-length header fields of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment of a message.
    pub fin: bool,
    /// Compressed payload when permessage-deflate is negotiated.
    pub rsv1: bool,
    /// Reserved.
    pub rsv2: bool,
    /// Reserved.
    pub rsv3: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Masking key, present iff the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    /// Effective payload length.
    pub payload_len: u64,
}

impl FrameHeader {
    /// Bytes used by the extended length field for a payload of `len` bytes.
    pub fn extended_length_size(len: u64) -> usize {
        match len {
            0..=125 => 0,
            126..=0xFFFF => 2,
            _ => 8,
        }
    }

    /// Total encoded header size.
    pub fn encoded_len(&self) -> usize {
        2 + Self::extended_length_size(self.payload_len) + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Append the wire form of this header to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());

        let mut first = u8::from(self.opcode);
        if self.fin {
            first |= 0x80;
        }
        if self.rsv1 {
            first |= 0x40;
        }
        if self.rsv2 {
            first |= 0x20;
        }
        if self.rsv3 {
            first |= 0x10;
        }
        dst.put_u8(first);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        match Self::extended_length_size(self.payload_len) {
            0 => dst.put_u8(mask_bit | self.payload_len as u8),
            2 => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(self.payload_len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(self.payload_len);
            }
        }

        if let Some(key) = self.mask {
            dst.put_slice(&key);
        }
    }

    /// Read a header from `reader`.
    ///
    /// `max_payload` limits data frames; zero means only the protocol bound
    /// applies. Control frames are held to 125 bytes whatever the limit. A
    /// length above its bound is rejected before any payload byte is consumed.
    pub async fn read_from<R>(reader: &mut R, max_payload: u64) -> Result<Self, FrameError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        let opcode = OpCode::try_from(head[0] & 0x0F)?;
        let masked = head[1] & 0x80 != 0;

        let payload_len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                reader.read_exact(&mut ext).await?;
                u64::from(u16::from_be_bytes(ext))
            }
            127 => {
                let mut ext = [0u8; 8];
                reader.read_exact(&mut ext).await?;
                let len = u64::from_be_bytes(ext);
                if len > MAX_FRAME_PAYLOAD {
                    return Err(FrameError::LengthOverflow(len));
                }
                len
            }
            len => u64::from(len),
        };

        // Control frames are not messages; only their protocol bound applies.
        if opcode.is_control() {
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::ControlTooLarge(payload_len));
            }
        } else {
            let max = if max_payload == 0 {
                MAX_FRAME_PAYLOAD
            } else {
                max_payload
            };
            if payload_len > max {
                return Err(FrameError::PayloadTooLarge {
                    declared: payload_len,
                    max,
                });
            }
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            reader.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        Ok(Self {
            fin: head[0] & 0x80 != 0,
            rsv1: head[0] & 0x40 != 0,
            rsv2: head[0] & 0x20 != 0,
            rsv3: head[0] & 0x10 != 0,
            opcode,
            mask,
            payload_len,
        })
    }
}

/// One wire unit: header bits plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Compressed payload.
    pub rsv1: bool,
    /// Reserved.
    pub rsv2: bool,
    /// Reserved.
    pub rsv3: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Masking key. Decoded frames keep it so masking stays observable.
    pub mask: Option<[u8; 4]>,
    /// Unmasked application data.
    pub payload: PayloadData,
}

impl Frame {
    /// A final, unmasked frame.
    pub fn new(opcode: OpCode, payload: impl Into<PayloadData>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// A text frame.
    pub fn text(payload: impl Into<PayloadData>) -> Self {
        Self::new(OpCode::Text, payload)
    }

    /// A binary frame.
    pub fn binary(payload: impl Into<PayloadData>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    /// A ping frame.
    pub fn ping(payload: impl Into<PayloadData>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    /// A pong frame.
    pub fn pong(payload: impl Into<PayloadData>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// A close frame carrying `code` and `reason`.
    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(OpCode::Close, PayloadData::from_close(code, reason))
    }

    /// A close frame with no status.
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, PayloadData::empty())
    }

    /// A continuation fragment.
    pub fn continuation(payload: impl Into<PayloadData>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, payload).with_fin(fin)
    }

    /// Set the FIN bit.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Set the compressed (RSV1) bit.
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.rsv1 = compressed;
        self
    }

    /// Mask the frame with `key` when encoded.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Whether the frame carried a masking key.
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Whether RSV1 marks the payload as compressed.
    pub fn is_compressed(&self) -> bool {
        self.rsv1
    }

    /// Whether this is a Close, Ping or Pong frame.
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Control frames must be final and carry at most 125 bytes.
    pub fn validate_control(&self) -> WsResult<()> {
        if !self.is_control() {
            return Ok(());
        }
        if !self.fin {
            return Err(WsError::protocol_error(format!(
                "fragmented {} frame",
                self.opcode
            )));
        }
        if self.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::protocol_error(format!(
                "{} frame payload of {} bytes exceeds {MAX_CONTROL_PAYLOAD}",
                self.opcode,
                self.payload.len()
            )));
        }
        Ok(())
    }

    /// The header describing this frame.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            fin: self.fin,
            rsv1: self.rsv1,
            rsv2: self.rsv2,
            rsv3: self.rsv3,
            opcode: self.opcode,
            mask: self.mask,
            payload_len: self.payload.len() as u64,
        }
    }

    /// Encode header and payload; the payload is masked on the way out if a key is set.
    pub fn encode(&self) -> BytesMut {
        let header = self.header();
        let mut dst = BytesMut::with_capacity(header.encoded_len() + self.payload.len());
        self.encode_into(&mut dst);
        dst
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        self.header().encode_into(dst);
        let start = dst.len();
        dst.extend_from_slice(self.payload.as_bytes());
        if let Some(key) = self.mask {
            apply_mask(&mut dst[start..], key);
        }
    }

    /// Decode one frame from `reader`, unmasking the payload.
    pub async fn read_from<R>(reader: &mut R, max_payload: u64) -> Result<Self, FrameError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let header = FrameHeader::read_from(reader, max_payload).await?;

        let len = usize::try_from(header.payload_len).map_err(|_| FrameError::PayloadTooLarge {
            declared: header.payload_len,
            max: usize::MAX as u64,
        })?;
        // Grow with the bytes actually received rather than trusting the header.
        let mut data = BytesMut::with_capacity(len.min(READ_CHUNK));
        while data.len() < len {
            data.reserve((len - data.len()).min(READ_CHUNK));
            let remaining = (len - data.len()) as u64;
            let read = (&mut *reader).take(remaining).read_buf(&mut data).await?;
            if read == 0 {
                return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }

        let mut payload = PayloadData::new(data);
        if let Some(key) = header.mask {
            payload.mask(key);
        }

        Ok(Self {
            fin: header.fin,
            rsv1: header.rsv1,
            rsv2: header.rsv2,
            rsv3: header.rsv3,
            opcode: header.opcode,
            mask: header.mask,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloseCode;

    async fn decode_header(bytes: &[u8]) -> Result<FrameHeader, FrameError> {
        let mut reader = bytes;
        FrameHeader::read_from(&mut reader, 0).await
    }

    #[tokio::test]
    async fn test_length_encoding_boundaries() {
        let cases: [(u64, usize); 6] = [
            (0, 0),
            (125, 0),
            (126, 2),
            (65_535, 2),
            (65_536, 8),
            (1 << 32, 8),
        ];

        for (len, ext) in cases {
            assert_eq!(FrameHeader::extended_length_size(len), ext, "len {len}");

            let header = FrameHeader {
                fin: true,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode: OpCode::Binary,
                mask: None,
                payload_len: len,
            };
            let mut buf = BytesMut::new();
            header.encode_into(&mut buf);
            assert_eq!(buf.len(), 2 + ext, "len {len}");

            let decoded = decode_header(&buf).await.unwrap();
            assert_eq!(decoded.payload_len, len);
            assert_eq!(decoded, header);
        }
    }

    #[tokio::test]
    async fn test_masked_frame_round_trip() {
        let frame = Frame::text("Hello").with_mask([0x37, 0xfa, 0x21, 0x3d]);
        let encoded = frame.encode();
        assert_eq!(
            &encoded[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );

        let mut reader = &encoded[..];
        let decoded = Frame::read_from(&mut reader, 0).await.unwrap();
        assert!(decoded.is_masked());
        assert_eq!(decoded.payload.as_bytes(), b"Hello");
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_unmasked_server_frame() {
        let encoded = Frame::text("Hello").encode();
        assert_eq!(&encoded[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn test_decode_across_chunked_reads() {
        let frame = Frame::binary(vec![7u8; 300])
            .with_fin(false)
            .with_compressed(true)
            .with_mask([1, 2, 3, 4]);
        let encoded = frame.encode();

        let mut mock = tokio_test::io::Builder::new()
            .read(&encoded[..1])
            .read(&encoded[1..3])
            .read(&encoded[3..5])
            .read(&encoded[5..9])
            .read(&encoded[9..200])
            .read(&encoded[200..])
            .build();

        let decoded = Frame::read_from(&mut mock, 0).await.unwrap();
        assert!(!decoded.fin);
        assert!(decoded.is_compressed());
        assert_eq!(decoded.payload.as_bytes(), &[7u8; 300][..]);
    }

    #[tokio::test]
    async fn test_short_read_is_io_error() {
        let encoded = Frame::text("truncated").with_mask([9, 9, 9, 9]).encode();
        let mut reader = &encoded[..encoded.len() - 3];
        let err = Frame::read_from(&mut reader, 0).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let err = decode_header(&[0x83, 0x80]).await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownOpcode(0x3)));
    }

    #[tokio::test]
    async fn test_length_overflow() {
        let mut bytes = vec![0x82, 0x7F];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        let err = decode_header(&bytes).await.unwrap_err();
        assert!(matches!(err, FrameError::LengthOverflow(_)));
    }

    #[tokio::test]
    async fn test_payload_over_limit_rejected_before_read() {
        let mut bytes = vec![0x82, 0xFE];
        bytes.extend_from_slice(&1000u16.to_be_bytes());
        let mut reader = &bytes[..];
        let err = FrameHeader::read_from(&mut reader, 512).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge {
                declared: 1000,
                max: 512
            }
        ));
    }

    #[tokio::test]
    async fn test_control_frame_ignores_message_limit() {
        let ping = Frame::ping(vec![b'p'; 100]).with_mask([1, 2, 3, 4]).encode();
        let mut reader = &ping[..];
        let frame = Frame::read_from(&mut reader, 64).await.unwrap();
        assert_eq!(frame.opcode, OpCode::Ping);
        assert_eq!(frame.payload.len(), 100);
        assert!(frame.validate_control().is_ok());

        let mut bytes = vec![0x89, 0xFE];
        bytes.extend_from_slice(&126u16.to_be_bytes());
        let mut reader = &bytes[..];
        let err = FrameHeader::read_from(&mut reader, 0).await.unwrap_err();
        assert!(matches!(err, FrameError::ControlTooLarge(126)));
        assert_eq!(err.as_close_code(), CloseCode::ProtocolError);
    }

    #[test]
    fn test_opcode_conversions() {
        for byte in [0x0, 0x1, 0x2, 0x8, 0x9, 0xA] {
            let opcode = OpCode::try_from(byte).unwrap();
            assert_eq!(u8::from(opcode), byte);
        }
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Text.is_data());
        assert!(!OpCode::Continuation.is_data());
        assert!(!OpCode::Continuation.is_control());
    }

    #[test]
    fn test_close_frame_payload() {
        let frame = Frame::close(1000, "bye");
        assert_eq!(frame.payload.close_code(), 1000);
        assert_eq!(frame.payload.close_reason(), Some("bye"));
        assert!(frame.is_control());
    }

    #[test]
    fn test_validate_control() {
        assert!(Frame::ping("p").validate_control().is_ok());
        assert!(Frame::text("x").with_fin(false).validate_control().is_ok());
        assert!(Frame::ping("p").with_fin(false).validate_control().is_err());
        assert!(Frame::pong(vec![0u8; 126]).validate_control().is_err());
        assert!(Frame::pong(vec![0u8; 125]).validate_control().is_ok());
    }
}
