//! Scripted WebSocket client.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TestError;
use crate::frame::{ClientFrame, ServerFrame, OP_BINARY, OP_CLOSE, OP_PONG, OP_TEXT};
use crate::request::TestUpgrade;
use crate::response::HandshakeReply;

/// How long `recv` waits by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A WebSocket client driven step by step from a test.
///
/// Works over any byte stream: one half of `tokio::io::duplex` handed to
/// a connection manager, or a `TcpStream` to a running server.
///
/// ```ignore
/// let (server, client) = tokio::io::duplex(64 * 1024);
/// manager.accept(server, handshake).await?;
///
/// let mut client = ClientEmulator::new(client);
/// client.send_text("HOLA").await?;
/// assert_eq!(client.expect_text().await?, "WELCOME");
/// ```
#[derive(Debug)]
pub struct ClientEmulator<S> {
    stream: S,
    timeout: Duration,
    buffered: Vec<u8>,
}

impl<S> ClientEmulator<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream that is already past the handshake.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            timeout: DEFAULT_TIMEOUT,
            buffered: Vec::new(),
        }
    }

    /// Change how long receives wait.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Perform an HTTP/1.1 upgrade over `stream`.
    ///
    /// Returns the parsed reply; the emulator is only usable for frames
    /// when the reply is `101`.
    pub async fn connect(stream: S, request: &TestUpgrade) -> Result<(Self, HandshakeReply), TestError> {
        let mut client = Self::new(stream);
        client.stream.write_all(&request.to_http1()).await?;
        client.stream.flush().await?;

        let head = tokio::time::timeout(client.timeout, client.read_head())
            .await
            .map_err(|_| TestError::Timeout)??;
        let reply = HandshakeReply::parse(&head)?;
        Ok((client, reply))
    }

    async fn read_head(&mut self) -> Result<Vec<u8>, TestError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            if self.stream.read(&mut byte).await? == 0 {
                return Err(TestError::Malformed("stream ended inside the response head".into()));
            }
            buf.push(byte[0]);
        }
        Ok(buf)
    }

    /// Write a frame.
    pub async fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), TestError> {
        self.send_raw(&frame.encode()).await
    }

    /// Write raw bytes.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TestError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a masked text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<(), TestError> {
        self.send_frame(&ClientFrame::text(text)).await
    }

    /// Write a masked binary frame.
    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<(), TestError> {
        self.send_frame(&ClientFrame::binary(data)).await
    }

    /// Write `value` as a JSON text frame.
    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<(), TestError> {
        let text = serde_json::to_string(value)?;
        self.send_text(&text).await
    }

    /// Write a Close frame.
    pub async fn send_close(&mut self, code: u16, reason: &str) -> Result<(), TestError> {
        self.send_frame(&ClientFrame::close(code, reason)).await
    }

    /// Read the next frame, whatever it is.
    pub async fn recv(&mut self) -> Result<ServerFrame, TestError> {
        let timeout = self.timeout;
        let read = async {
            if self.buffered.is_empty() {
                ServerFrame::read_from(&mut self.stream).await
            } else {
                let mut chained = self.buffered.as_slice().chain(&mut self.stream);
                let frame = ServerFrame::read_from(&mut chained).await;
                self.buffered.clear();
                frame
            }
        };
        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| TestError::Timeout)?
    }

    /// Read frames until a data or Close frame arrives, skipping Pongs.
    pub async fn recv_message(&mut self) -> Result<ServerFrame, TestError> {
        loop {
            let frame = self.recv().await?;
            if frame.opcode != OP_PONG {
                return Ok(frame);
            }
        }
    }

    /// The next message must be text.
    pub async fn expect_text(&mut self) -> Result<String, TestError> {
        let frame = self.recv_message().await?;
        if frame.opcode != OP_TEXT {
            return Err(TestError::UnexpectedFrame {
                expected: "text",
                opcode: frame.opcode,
            });
        }
        frame.text()
    }

    /// The next message must be binary.
    pub async fn expect_binary(&mut self) -> Result<Bytes, TestError> {
        let frame = self.recv_message().await?;
        if frame.opcode != OP_BINARY {
            return Err(TestError::UnexpectedFrame {
                expected: "binary",
                opcode: frame.opcode,
            });
        }
        Ok(frame.payload)
    }

    /// The next message must be a Close frame. Returns its code, if any.
    pub async fn expect_close(&mut self) -> Result<Option<u16>, TestError> {
        let frame = self.recv_message().await?;
        if frame.opcode != OP_CLOSE {
            return Err(TestError::UnexpectedFrame {
                expected: "close",
                opcode: frame.opcode,
            });
        }
        Ok(frame.close_code())
    }

    /// Wait until the server stops writing.
    pub async fn expect_eof(&mut self) -> Result<(), TestError> {
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(self.timeout, self.stream.read(&mut byte))
            .await
            .map_err(|_| TestError::Timeout)?;
        match read {
            Ok(0) | Err(_) => Ok(()),
            Ok(_) => Err(TestError::Malformed("server kept writing".into())),
        }
    }

    /// Whether anything arrives within `wait`.
    pub async fn is_silent(&mut self, wait: Duration) -> bool {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(wait, self.stream.read(&mut byte)).await {
            Err(_) => true,
            Ok(Ok(1)) => {
                self.buffered.push(byte[0]);
                false
            }
            Ok(_) => false,
        }
    }

    /// The underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}
