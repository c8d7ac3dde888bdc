//! Per-message compression (RFC 7692 permessage-deflate).
//!
//! Only a single method can be toggled per endpoint. Every message uses a
//! fresh compressor, which is what `server_no_context_takeover` and
//! `client_no_context_takeover` promise the peer.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{WsError, WsResult};

/// Extension token offered in `Sec-WebSocket-Extensions`.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Extension parameters the server answers with.
pub const PERMESSAGE_DEFLATE_RESPONSE: &str =
    "permessage-deflate; server_no_context_takeover; client_no_context_takeover";

/// Trailer a sync flush leaves behind; stripped on the wire (RFC 7692 §7.2.1).
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const DECOMPRESS_CHUNK: usize = 4096;

/// Compression applied to message payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Payloads are sent as-is.
    #[default]
    None,
    /// Raw DEFLATE with a sync flush per message.
    Deflate,
}

impl CompressionMethod {
    /// Whether this method actually transforms payloads.
    pub fn is_enabled(self) -> bool {
        self != Self::None
    }
}

/// Compress a whole message payload.
pub fn compress(method: CompressionMethod, data: &[u8]) -> WsResult<Bytes> {
    match method {
        CompressionMethod::None => Ok(Bytes::copy_from_slice(data)),
        CompressionMethod::Deflate => {
            let mut encoder = DeflateEncoder::new(
                Vec::with_capacity(data.len() / 2 + 16),
                Compression::default(),
            );
            encoder
                .write_all(data)
                .and_then(|()| encoder.flush())
                .map_err(|e| WsError::compression(e.to_string()))?;

            let mut out = std::mem::take(encoder.get_mut());
            if out.ends_with(&DEFLATE_TAIL) {
                out.truncate(out.len() - DEFLATE_TAIL.len());
            }
            Ok(Bytes::from(out))
        }
    }
}

/// Decompress a whole message payload.
///
/// `limit` of zero means unbounded; otherwise output past `limit` bytes is
/// reported as [`WsError::MessageTooBig`].
pub fn decompress(method: CompressionMethod, data: &[u8], limit: usize) -> WsResult<Bytes> {
    match method {
        CompressionMethod::None => Ok(Bytes::copy_from_slice(data)),
        CompressionMethod::Deflate => {
            let mut decoder = DeflateDecoder::new(Vec::with_capacity(data.len() * 2));
            let too_big = |size: usize| limit != 0 && size > limit;

            for chunk in data.chunks(DECOMPRESS_CHUNK).chain(std::iter::once(&DEFLATE_TAIL[..])) {
                decoder
                    .write_all(chunk)
                    .map_err(|e| WsError::compression(e.to_string()))?;
                let size = decoder.get_ref().len();
                if too_big(size) {
                    return Err(WsError::MessageTooBig { size, max: limit });
                }
            }

            decoder
                .flush()
                .map_err(|e| WsError::compression(e.to_string()))?;
            let out = std::mem::take(decoder.get_mut());
            if too_big(out.len()) {
                return Err(WsError::MessageTooBig {
                    size: out.len(),
                    max: limit,
                });
            }
            Ok(Bytes::from(out))
        }
    }
}

/// Whether a `Sec-WebSocket-Extensions` entry offers permessage-deflate.
pub fn offers_deflate(extension: &str) -> bool {
    extension
        .split(';')
        .next()
        .is_some_and(|name| name.trim().eq_ignore_ascii_case(PERMESSAGE_DEFLATE))
}
