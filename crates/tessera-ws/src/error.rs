//! Error types for WebSocket operations.
//!
//! [`WsError`] is the crate-level error. [`FrameError`] and [`FragmentError`]
//! are the narrower codec and reassembly failures; the connection engine maps
//! them onto a [`CloseCode`] before failing a connection.

use std::fmt;
use thiserror::Error;

/// Result type for WebSocket operations.
pub type WsResult<T> = Result<T, WsError>;

/// Errors that can occur during WebSocket operations.
#[derive(Debug, Error)]
pub enum WsError {
    /// The upgrade handshake failed.
    #[error("WebSocket handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer violated the framing rules.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A message exceeded the configured size limit.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooBig {
        /// Size of the offending message.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The WebSocket connection was closed.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Optional close code.
        code: Option<u16>,
        /// Reason for closing.
        reason: String,
    },

    /// Failed to send a message.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// A subprotocol name is not a valid RFC 2616 token.
    #[error("invalid subprotocol name: {0:?}")]
    InvalidProtocolName(String),

    /// A subprotocol was registered twice.
    #[error("subprotocol already registered: {0}")]
    DuplicateProtocol(String),

    /// Configuration was changed after the manager started accepting connections.
    #[error("connection manager for {0} has already started")]
    AlreadyStarted(String),

    /// Two managers were registered for the same path.
    #[error("an endpoint is already registered for {0}")]
    DuplicateEndpoint(String),

    /// The message payload could not be decoded.
    #[error("failed to decode message: {0}")]
    DecodeFailed(String),

    /// The message payload could not be encoded.
    #[error("failed to encode message: {0}")]
    EncodeFailed(String),

    /// Compressing or decompressing a payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tungstenite error.
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tungstenite::Error),
}

impl WsError {
    /// Create a new handshake failed error.
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed(reason.into())
    }

    /// Create a new protocol error.
    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Self::ProtocolError(reason.into())
    }

    /// Create a new connection closed error.
    pub fn connection_closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    /// Create a new send failed error.
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::SendFailed(reason.into())
    }

    /// Create a new compression error.
    pub fn compression(reason: impl Into<String>) -> Self {
        Self::Compression(reason.into())
    }

    /// Get the close code if this is a connection closed error.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::ConnectionClosed { code, .. } => *code,
            _ => None,
        }
    }

    /// Check if this error indicates the connection should be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(_)
                | Self::ProtocolError(_)
                | Self::MessageTooBig { .. }
                | Self::ConnectionClosed { .. }
                | Self::Compression(_)
                | Self::Io(_)
        )
    }

    /// The close code a connection should be failed with for this error.
    pub fn as_close_code(&self) -> CloseCode {
        match self {
            Self::ProtocolError(_) | Self::HandshakeFailed(_) => CloseCode::ProtocolError,
            Self::MessageTooBig { .. } => CloseCode::TooBig,
            Self::DecodeFailed(_) | Self::Compression(_) => CloseCode::InvalidData,
            Self::Io(_) | Self::ConnectionClosed { .. } => CloseCode::Abnormal,
            _ => CloseCode::ServerError,
        }
    }
}

/// Failures while reading a single frame off the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream failed or ended before the frame was complete.
    #[error("I/O error while reading frame: {0}")]
    Io(#[from] std::io::Error),

    /// The opcode nibble is not one RFC 6455 defines.
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    /// The declared payload length exceeds the configured maximum.
    #[error("frame payload of {declared} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Length announced in the frame header.
        declared: u64,
        /// Configured maximum.
        max: u64,
    },

    /// A 64-bit length with the most significant bit set.
    #[error("frame length {0} exceeds 2^63 - 1")]
    LengthOverflow(u64),

    /// A control frame announcing more than 125 payload bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLarge(u64),
}

impl FrameError {
    /// The close code a connection should be failed with for this error.
    pub fn as_close_code(&self) -> CloseCode {
        match self {
            Self::Io(_) => CloseCode::Abnormal,
            Self::UnknownOpcode(_) => CloseCode::PolicyViolation,
            Self::PayloadTooLarge { .. } => CloseCode::TooBig,
            Self::LengthOverflow(_) | Self::ControlTooLarge(_) => CloseCode::ProtocolError,
        }
    }
}

/// Out-of-sequence or oversized fragments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    /// A Text or Binary frame arrived while a fragmented message was open.
    #[error("data frame received while a fragmented message is in progress")]
    AlreadyInProgress,

    /// A Continuation frame arrived with no fragmented message open.
    #[error("continuation frame received without a message in progress")]
    NotInProgress,

    /// The accumulated message grew past the configured maximum.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooBig {
        /// Accumulated size so far.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

impl FragmentError {
    /// The close code a connection should be failed with for this error.
    pub fn as_close_code(&self) -> CloseCode {
        match self {
            Self::AlreadyInProgress | Self::NotInProgress => CloseCode::ProtocolError,
            Self::TooBig { .. } => CloseCode::TooBig,
        }
    }
}

/// Close code for WebSocket connections (RFC 6455 §7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    ProtocolError = 1002,
    /// Unsupported data (1003).
    UnsupportedData = 1003,
    /// Reserved, no meaning defined (1004).
    Undefined = 1004,
    /// No status received (1005).
    NoStatus = 1005,
    /// Abnormal closure (1006).
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidData = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    TooBig = 1009,
    /// Mandatory extension missing (1010).
    MandatoryExtension = 1010,
    /// Internal server error (1011).
    ServerError = 1011,
    /// Service restart (1012).
    ServiceRestart = 1012,
    /// Try again later (1013).
    TryAgainLater = 1013,
    /// Bad gateway (1014).
    BadGateway = 1014,
    /// TLS handshake failure (1015).
    TlsHandshakeFailure = 1015,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::ProtocolError),
            1003 => Some(Self::UnsupportedData),
            1004 => Some(Self::Undefined),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidData),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::TooBig),
            1010 => Some(Self::MandatoryExtension),
            1011 => Some(Self::ServerError),
            1012 => Some(Self::ServiceRestart),
            1013 => Some(Self::TryAgainLater),
            1014 => Some(Self::BadGateway),
            1015 => Some(Self::TlsHandshakeFailure),
            _ => None,
        }
    }

    /// Get the u16 value of this close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Codes that only describe a local condition and must never appear on the wire.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::Undefined | Self::NoStatus | Self::Abnormal | Self::TlsHandshakeFailure
        )
    }

    /// Same as [`CloseCode::is_reserved`] for a raw code received from a peer.
    pub fn is_reserved_code(code: u16) -> bool {
        Self::from_u16(code).is_some_and(Self::is_reserved)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::GoingAway => "GoingAway",
            Self::ProtocolError => "ProtocolError",
            Self::UnsupportedData => "UnsupportedData",
            Self::Undefined => "Undefined",
            Self::NoStatus => "NoStatus",
            Self::Abnormal => "Abnormal",
            Self::InvalidData => "InvalidData",
            Self::PolicyViolation => "PolicyViolation",
            Self::TooBig => "TooBig",
            Self::MandatoryExtension => "MandatoryExtension",
            Self::ServerError => "ServerError",
            Self::ServiceRestart => "ServiceRestart",
            Self::TryAgainLater => "TryAgainLater",
            Self::BadGateway => "BadGateway",
            Self::TlsHandshakeFailure => "TlsHandshakeFailure",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}
