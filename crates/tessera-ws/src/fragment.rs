//! Fragmented message reassembly and splitting.
//!
//! Control frames may be interleaved between the fragments of a data
//! message; they never touch the reassembly buffer.

use bytes::{Bytes, BytesMut};

use crate::error::FragmentError;
use crate::frame::{Frame, OpCode};

/// A complete data message rebuilt from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    /// Text or Binary, taken from the first fragment.
    pub opcode: OpCode,
    /// RSV1 of the first fragment.
    pub compressed: bool,
    /// Concatenated payload, still compressed if `compressed` is set.
    pub payload: Bytes,
    /// Number of frames the message arrived in.
    pub fragments: usize,
}

#[derive(Debug)]
struct Partial {
    opcode: OpCode,
    compressed: bool,
    buffer: BytesMut,
    fragments: usize,
}

/// Accumulates data frames until a FIN bit completes the message.
#[derive(Debug)]
pub struct Reassembler {
    max_size: usize,
    partial: Option<Partial>,
}

impl Reassembler {
    /// `max_size` of zero disables the size check.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            partial: None,
        }
    }

    /// Whether a fragmented message is open.
    pub fn is_in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Drop any partially received message.
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feed one frame.
    ///
    /// Returns the finished message once a final fragment arrives. Control
    /// frames are ignored and yield `Ok(None)`.
    pub fn feed(&mut self, frame: &Frame) -> Result<Option<AssembledMessage>, FragmentError> {
        if frame.is_control() {
            return Ok(None);
        }

        let chunk = frame.payload.as_bytes();
        match (frame.opcode, self.partial.as_mut()) {
            (OpCode::Continuation, None) => Err(FragmentError::NotInProgress),
            (OpCode::Continuation, Some(partial)) => {
                let size = partial.buffer.len() + chunk.len();
                if self.max_size != 0 && size > self.max_size {
                    self.partial = None;
                    return Err(FragmentError::TooBig {
                        size,
                        max: self.max_size,
                    });
                }
                partial.buffer.extend_from_slice(chunk);
                partial.fragments += 1;

                if !frame.fin {
                    return Ok(None);
                }
                Ok(self.partial.take().map(|partial| AssembledMessage {
                    opcode: partial.opcode,
                    compressed: partial.compressed,
                    payload: partial.buffer.freeze(),
                    fragments: partial.fragments,
                }))
            }
            (_, Some(_)) => Err(FragmentError::AlreadyInProgress),
            (opcode, None) => {
                if self.max_size != 0 && chunk.len() > self.max_size {
                    return Err(FragmentError::TooBig {
                        size: chunk.len(),
                        max: self.max_size,
                    });
                }
                if frame.fin {
                    return Ok(Some(AssembledMessage {
                        opcode,
                        compressed: frame.rsv1,
                        payload: Bytes::copy_from_slice(chunk),
                        fragments: 1,
                    }));
                }
                self.partial = Some(Partial {
                    opcode,
                    compressed: frame.rsv1,
                    buffer: BytesMut::from(chunk),
                    fragments: 1,
                });
                Ok(None)
            }
        }
    }
}

/// Split a payload into frames of at most `fragment_size` bytes.
///
/// The first frame carries `opcode` and the compression bit, the rest are
/// Continuation frames, and only the last has FIN set. A `fragment_size`
/// of zero sends everything in one frame.
pub fn split_message(
    opcode: OpCode,
    payload: Bytes,
    fragment_size: usize,
    compressed: bool,
) -> Vec<Frame> {
    if fragment_size == 0 || payload.len() <= fragment_size {
        return vec![Frame::new(opcode, payload).with_compressed(compressed)];
    }

    let count = payload.len().div_ceil(fragment_size);
    payload
        .chunks(fragment_size)
        .enumerate()
        .map(|(index, chunk)| {
            let fin = index + 1 == count;
            if index == 0 {
                Frame::new(opcode, chunk)
                    .with_fin(fin)
                    .with_compressed(compressed)
            } else {
                Frame::continuation(chunk, fin)
            }
        })
        .collect()
}
