//! Test error types.

use thiserror::Error;

/// Errors raised by the client emulator.
#[derive(Debug, Error)]
pub enum TestError {
    /// The stream failed or ended early.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server wrote something that is not a valid frame or response.
    #[error("Malformed server output: {0}")]
    Malformed(String),

    /// A frame of another kind arrived.
    #[error("Unexpected frame: expected {expected}, got opcode {opcode:#x}")]
    UnexpectedFrame {
        /// What the test waited for.
        expected: &'static str,
        /// Opcode received.
        opcode: u8,
    },

    /// Nothing arrived in time.
    #[error("Timed out waiting for the server")]
    Timeout,

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
