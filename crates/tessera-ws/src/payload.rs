//! Frame payload container.
//!
//! [`PayloadData`] owns the application bytes of one frame. It can mask
//! itself in place and, for Close frames, lazily interpret its first two
//! bytes as a status code followed by a UTF-8 reason.

use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};

use crate::error::CloseCode;

/// Maximum reason length that fits a control frame next to the 2-byte code.
pub const MAX_CLOSE_REASON: usize = 123;

/// XOR `buf` in place with a repeating 4-byte key.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        chunk[0] ^= key[0];
        chunk[1] ^= key[1];
        chunk[2] ^= key[2];
        chunk[3] ^= key[3];
    }
    for (byte, k) in chunks.into_remainder().iter_mut().zip(key) {
        *byte ^= k;
    }
}

#[derive(Debug, Clone)]
struct CloseInfo {
    code: u16,
    reason: Option<String>,
}

/// The application data carried by a frame.
#[derive(Debug, Clone, Default)]
pub struct PayloadData {
    data: BytesMut,
    close: OnceLock<CloseInfo>,
}

impl PayloadData {
    /// Create a payload from raw bytes.
    pub fn new(data: impl Into<BytesMut>) -> Self {
        Self {
            data: data.into(),
            close: OnceLock::new(),
        }
    }

    /// An empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a Close frame payload: big-endian code followed by the reason.
    ///
    /// The reason is cut to [`MAX_CLOSE_REASON`] bytes on a character boundary.
    pub fn from_close(code: u16, reason: &str) -> Self {
        let reason = truncate_reason(reason);
        let mut data = BytesMut::with_capacity(2 + reason.len());
        data.extend_from_slice(&code.to_be_bytes());
        data.extend_from_slice(reason.as_bytes());
        Self::new(data)
    }

    /// XOR the payload in place with `key`.
    pub fn mask(&mut self, key: [u8; 4]) {
        apply_mask(&mut self.data, key);
        self.close = OnceLock::new();
    }

    /// Status code of a Close payload, or 1005 (no status) if shorter than 2 bytes.
    pub fn close_code(&self) -> u16 {
        self.close_info().code
    }

    /// Reason of a Close payload, if present and valid UTF-8.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_info().reason.as_deref()
    }

    fn close_info(&self) -> &CloseInfo {
        self.close.get_or_init(|| {
            if self.data.len() < 2 {
                return CloseInfo {
                    code: CloseCode::NoStatus.as_u16(),
                    reason: None,
                };
            }
            let code = u16::from_be_bytes([self.data[0], self.data[1]]);
            let reason = std::str::from_utf8(&self.data[2..])
                .ok()
                .filter(|r| !r.is_empty())
                .map(str::to_string);
            CloseInfo { code, reason }
        })
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes to the payload.
    pub fn extend_from_slice(&mut self, extra: &[u8]) {
        self.data.extend_from_slice(extra);
        self.close = OnceLock::new();
    }

    /// Freeze into immutable [`Bytes`].
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }

    /// Take the underlying buffer.
    pub fn into_inner(self) -> BytesMut {
        self.data
    }
}

impl PartialEq for PayloadData {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for PayloadData {}

impl From<Vec<u8>> for PayloadData {
    fn from(data: Vec<u8>) -> Self {
        Self::new(BytesMut::from(&data[..]))
    }
}

impl From<&[u8]> for PayloadData {
    fn from(data: &[u8]) -> Self {
        Self::new(BytesMut::from(data))
    }
}

impl From<&str> for PayloadData {
    fn from(data: &str) -> Self {
        Self::from(data.as_bytes())
    }
}

impl From<Bytes> for PayloadData {
    fn from(data: Bytes) -> Self {
        Self::from(&data[..])
    }
}

impl From<BytesMut> for PayloadData {
    fn from(data: BytesMut) -> Self {
        Self::new(data)
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
