//! Client-side frame codec.
//!
//! Deliberately independent of the server's codec so tests can write
//! frames the server must reject: unmasked, unknown opcodes, reserved bits.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::TestError;

/// Continuation opcode.
pub const OP_CONTINUATION: u8 = 0x0;
/// Text opcode.
pub const OP_TEXT: u8 = 0x1;
/// Binary opcode.
pub const OP_BINARY: u8 = 0x2;
/// Close opcode.
pub const OP_CLOSE: u8 = 0x8;
/// Ping opcode.
pub const OP_PING: u8 = 0x9;
/// Pong opcode.
pub const OP_PONG: u8 = 0xA;

/// Mask key used unless a frame sets its own.
pub const DEFAULT_MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// A frame as a client would write it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ClientFrame {
    /// FIN bit.
    pub fin: bool,
    /// RSV1 bit.
    pub rsv1: bool,
    /// RSV2 bit.
    pub rsv2: bool,
    /// Raw opcode, unchecked.
    pub opcode: u8,
    /// Mask key; `None` writes an unmasked frame.
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
    /// Overrides the encoded length, for lying about the payload size.
    pub declared_len: Option<u64>,
}

impl ClientFrame {
    /// A final, masked frame.
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            opcode,
            mask: Some(DEFAULT_MASK),
            payload: payload.into(),
            declared_len: None,
        }
    }

    /// Text frame.
    pub fn text(text: &str) -> Self {
        Self::new(OP_TEXT, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Binary frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OP_BINARY, data)
    }

    /// Continuation frame.
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(OP_CONTINUATION, data).fin(fin)
    }

    /// Ping frame.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OP_PING, data)
    }

    /// Pong frame.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OP_PONG, data)
    }

    /// Close frame with a status code and reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OP_CLOSE, payload.freeze())
    }

    /// Close frame without a status.
    pub fn close_empty() -> Self {
        Self::new(OP_CLOSE, Bytes::new())
    }

    /// Set FIN.
    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Set RSV1.
    pub fn rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Set RSV2.
    pub fn rsv2(mut self, rsv2: bool) -> Self {
        self.rsv2 = rsv2;
        self
    }

    /// Write without a mask.
    pub fn unmasked(mut self) -> Self {
        self.mask = None;
        self
    }

    /// Encode a different length than the payload's.
    pub fn declare_len(mut self, len: u64) -> Self {
        self.declared_len = Some(len);
        self
    }

    /// Wire bytes.
    pub fn encode(&self) -> Bytes {
        let len = self.declared_len.unwrap_or(self.payload.len() as u64);
        let mut out = BytesMut::with_capacity(14 + self.payload.len());

        let mut b0 = self.opcode & 0x0f;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        out.put_u8(b0);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        match len {
            0..=125 => out.put_u8(mask_bit | len as u8),
            126..=0xffff => {
                out.put_u8(mask_bit | 126);
                out.put_u16(len as u16);
            }
            _ => {
                out.put_u8(mask_bit | 127);
                out.put_u64(len);
            }
        }

        match self.mask {
            Some(key) => {
                out.put_slice(&key);
                out.extend(
                    self.payload
                        .iter()
                        .enumerate()
                        .map(|(i, byte)| byte ^ key[i % 4]),
                );
            }
            None => out.put_slice(&self.payload),
        }
        out.freeze()
    }
}

/// A frame as the server wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFrame {
    /// FIN bit.
    pub fin: bool,
    /// RSV1 bit.
    pub rsv1: bool,
    /// Raw opcode.
    pub opcode: u8,
    /// Whether the server set the mask bit. Servers must not.
    pub masked: bool,
    /// Payload, unmasked.
    pub payload: Bytes,
}

impl ServerFrame {
    /// Read one frame.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, TestError>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        let len = match head[1] & 0x7f {
            126 => u64::from(reader.read_u16().await?),
            127 => reader.read_u64().await?,
            n => u64::from(n),
        };
        let masked = head[1] & 0x80 != 0;
        let mut key = [0u8; 4];
        if masked {
            reader.read_exact(&mut key).await?;
        }

        let len = usize::try_from(len)
            .map_err(|_| TestError::Malformed(format!("frame length {len} too large")))?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        if masked {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Self {
            fin: head[0] & 0x80 != 0,
            rsv1: head[0] & 0x40 != 0,
            opcode: head[0] & 0x0f,
            masked,
            payload: Bytes::from(payload),
        })
    }

    /// Whether this is a Close frame.
    pub fn is_close(&self) -> bool {
        self.opcode == OP_CLOSE
    }

    /// Close status code, `None` for an empty close payload.
    pub fn close_code(&self) -> Option<u16> {
        (self.payload.len() >= 2).then(|| u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Close reason.
    pub fn close_reason(&self) -> String {
        self.payload
            .get(2..)
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .unwrap_or_default()
    }

    /// Payload as UTF-8 text.
    pub fn text(&self) -> Result<String, TestError> {
        String::from_utf8(self.payload.to_vec()).map_err(|e| TestError::Malformed(e.to_string()))
    }
}
