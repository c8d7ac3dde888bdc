//! The native connection engine.
//!
//! [`WebSocket`] owns one upgraded stream. Its receive loop decodes frames,
//! validates them, answers control frames inline and pushes completed
//! messages onto the connection's event queue. Writes from `send`, `ping`,
//! `close` and the loop itself share one async lock, so frames of different
//! messages never interleave on the wire.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, trace, warn};

use tessera_telemetry::metrics;

use crate::compression::{compress, decompress, CompressionMethod};
use crate::config::WebSocketConfig;
use crate::context::{
    BoxFuture, CloseStatus, ConnectionId, ConnectionState, SharedContext, WebSocketContext,
};
use crate::dispatch::{ConnectionEvent, EventSender};
use crate::error::{CloseCode, FrameError, WsError, WsResult};
use crate::fragment::{split_message, AssembledMessage, Reassembler};
use crate::frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD};
use crate::handshake::Handshake;
use crate::keepalive;
use crate::message::{FrameInfo, MessageInfo, MessageKind, TextEncoding};
use crate::shutdown::ShutdownSignal;

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// What a write carries, which decides its deadline and when it is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    /// Message frames, bounded by `write_timeout`. Only while open.
    Data,
    /// Ping and Pong, bounded by `close_timeout`. Only while open.
    Control,
    /// The Close frame, bounded by `close_timeout`. Allowed while closing.
    Close,
}

impl WriteKind {
    /// The time limit for this write and the matching deadline, if any.
    pub(crate) fn deadline(self, config: &WebSocketConfig) -> (Duration, Option<Instant>) {
        let limit = match self {
            Self::Data => config.write_timeout,
            Self::Control | Self::Close => config.close_timeout,
        };
        (limit, (!limit.is_zero()).then(|| Instant::now() + limit))
    }

    /// Whether the write may go out in `state`.
    pub(crate) fn allowed_in(self, state: ConnectionState) -> bool {
        match self {
            Self::Data | Self::Control => state.is_open(),
            Self::Close => state != ConnectionState::Closed,
        }
    }
}

pub(crate) enum WriteFailure<E> {
    Failed(E),
    Stalled,
    Closed,
}

/// Resolve at `deadline`, or never without one.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A connection served by the built-in frame engine.
pub struct WebSocket {
    id: ConnectionId,
    path: String,
    protocol: Option<String>,
    config: WebSocketConfig,
    compression: CompressionMethod,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<BoxedWriter>>,
    reader: SyncMutex<Option<BoxedReader>>,
    pong: Notify,
    close_status: SyncMutex<Option<CloseStatus>>,
    events: EventSender,
}

impl WebSocket {
    /// Wrap an upgraded stream. The connection starts [`ConnectionState::Open`].
    pub fn new<S>(
        stream: S,
        handshake: &Handshake,
        config: WebSocketConfig,
        events: EventSender,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (state, _) = watch::channel(ConnectionState::Open);

        Arc::new(Self {
            id: ConnectionId::new(),
            path: handshake.path.clone(),
            protocol: handshake.protocol.clone(),
            config,
            compression: handshake.compression,
            state,
            writer: Mutex::new(Some(Box::pin(writer))),
            reader: SyncMutex::new(Some(Box::pin(reader))),
            pong: Notify::new(),
            close_status: SyncMutex::new(None),
            events,
        })
    }

    /// Compression negotiated for this connection.
    pub fn compression(&self) -> CompressionMethod {
        self.compression
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn record_status(&self, code: u16, reason: &str) {
        let mut status = self.close_status.lock();
        if status.is_none() {
            *status = Some(CloseStatus {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Queue an event for the handler, waiting while the queue is full.
    ///
    /// Gives up once the connection stops being open, so a handler that
    /// closes the connection is never blocked behind its own backlog.
    async fn emit(&self, event: ConnectionEvent) {
        tokio::select! {
            // The dispatcher is gone once Disconnected was handled.
            _ = self.events.send(event) => {}
            () = self.wait_not_open() => {
                trace!(connection_id = %self.id, "event dropped while closing");
            }
        }
    }

    async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    async fn wait_not_open(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| !state.is_open()).await;
    }

    fn closed_error(&self, reason: &str) -> WsError {
        WsError::connection_closed(self.close_status().map(|status| status.code), reason)
    }

    /// Write frames under the send lock.
    ///
    /// Waiting for the lock and writing are both bounded by the deadline of
    /// `kind`. A write that fails, stalls past the deadline or is overtaken
    /// by teardown releases the stream while still holding the lock, then
    /// fails the connection with `Abnormal`.
    async fn write_frames(&self, frames: &[Frame], kind: WriteKind) -> WsResult<()> {
        let (limit, deadline) = kind.deadline(&self.config);

        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            () = sleep_until_deadline(deadline) => {
                self.stalled(limit).await;
                return Err(self.closed_error("write stalled"));
            }
            () = self.wait_closed() => return Err(self.closed_error("connection is closed")),
        };

        let state = self.state();
        if state == ConnectionState::Closed {
            guard.take();
            return Err(self.closed_error("connection is closed"));
        }
        if !kind.allowed_in(state) {
            return Err(self.closed_error("connection is not open"));
        }
        let Some(writer) = guard.as_mut() else {
            return Err(self.closed_error("stream already released"));
        };

        let outcome = {
            let io = async {
                for frame in frames {
                    writer.write_all(&frame.encode()).await?;
                }
                writer.flush().await
            };
            tokio::select! {
                result = io => result.map_err(WriteFailure::Failed),
                () = sleep_until_deadline(deadline) => Err(WriteFailure::Stalled),
                () = self.wait_closed() => Err(WriteFailure::Closed),
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(failure) => {
                // A partial frame may be on the wire; the stream is unusable.
                drop(guard.take());
                drop(guard);
                match failure {
                    WriteFailure::Failed(err) => {
                        debug!(connection_id = %self.id, error = %err, "write failed");
                        self.teardown(CloseCode::Abnormal.as_u16(), &err.to_string())
                            .await;
                        Err(WsError::send_failed(err.to_string()))
                    }
                    WriteFailure::Stalled => {
                        self.stalled(limit).await;
                        Err(self.closed_error("write stalled"))
                    }
                    WriteFailure::Closed => Err(self.closed_error("connection closed during write")),
                }
            }
        }
    }

    async fn stalled(&self, limit: Duration) {
        warn!(connection_id = %self.id, ?limit, "peer stopped reading");
        self.teardown(CloseCode::Abnormal.as_u16(), "write timed out")
            .await;
    }

    /// Move to `Closed` and release the stream. Idempotent.
    ///
    /// Never waits for the send lock: a writer holding it sees `Closed` and
    /// drops the stream itself.
    async fn teardown(&self, code: u16, reason: &str) {
        self.record_status(code, reason);

        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            debug!(
                connection_id = %self.id,
                code,
                reason,
                "connection closed"
            );
        }
        self.pong.notify_waiters();

        let writer = self
            .writer
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(mut writer) = writer {
            let _ = timeout(self.config.close_timeout, writer.shutdown()).await;
        }
        self.reader.lock().take();
    }

    /// Move from `Open` to `CloseSent` and send the Close frame.
    ///
    /// Returns `true` if a Close frame went out and the peer's answer is
    /// now awaited. Reserved codes tear down directly.
    async fn begin_close(&self, code: CloseCode, reason: &str) -> bool {
        if !self.transition(ConnectionState::Open, ConnectionState::CloseSent) {
            return false;
        }
        self.record_status(code.as_u16(), reason);

        if code.is_reserved() {
            self.teardown(code.as_u16(), reason).await;
            return false;
        }
        self.write_frames(&[Frame::close(code.as_u16(), reason)], WriteKind::Close)
            .await
            .is_ok()
    }

    async fn close_with(&self, code: CloseCode, reason: &str) {
        if !self.begin_close(code, reason).await {
            return;
        }
        if timeout(self.config.close_timeout, self.wait_closed())
            .await
            .is_err()
        {
            debug!(connection_id = %self.id, "no Close frame from peer within timeout");
            self.teardown(code.as_u16(), reason).await;
        }
    }

    /// Fail the connection after a protocol violation by the peer.
    async fn fail(&self, code: CloseCode, reason: &str) {
        warn!(connection_id = %self.id, %code, reason, "failing connection");
        metrics::record_protocol_error(&self.path, code.as_u16());
        self.begin_close(code, reason).await;
    }

    async fn send_payload(&self, payload: Bytes, kind: MessageKind) -> WsResult<()> {
        let len = payload.len();
        let frames = match kind {
            MessageKind::Ping => {
                if len > MAX_CONTROL_PAYLOAD {
                    return Err(WsError::send_failed(format!(
                        "ping payload of {len} bytes exceeds {MAX_CONTROL_PAYLOAD}"
                    )));
                }
                vec![Frame::ping(payload)]
            }
            MessageKind::Text | MessageKind::Binary => {
                let compressed = self.compression.is_enabled();
                let body = if compressed {
                    compress(self.compression, &payload)?
                } else {
                    payload
                };
                split_message(kind.opcode(), body, self.config.fragment_size, compressed)
            }
        };

        self.write_frames(&frames, WriteKind::Data).await?;
        trace!(connection_id = %self.id, kind = kind.as_str(), len, frames = frames.len(), "message sent");
        metrics::record_message_sent(&self.path, kind.as_str(), len);
        Ok(())
    }

    async fn ping_peer(&self) -> bool {
        if !self.state().is_open() {
            return false;
        }

        let notified = self.pong.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self
            .write_frames(&[Frame::ping(Bytes::new())], WriteKind::Control)
            .await
            .is_err()
        {
            return false;
        }
        timeout(self.config.ping_timeout, notified).await.is_ok()
            && self.state() != ConnectionState::Closed
    }

    #[instrument(skip_all, fields(connection_id = %self.id, path = %self.path))]
    async fn receive_loop(self: Arc<Self>, shutdown: ShutdownSignal) {
        let reader = self.reader.lock().take();
        let Some(mut reader) = reader else {
            warn!("receive loop already started");
            return;
        };

        let ctx: SharedContext = self.clone();
        keepalive::spawn_watchers(ctx, shutdown, self.config.keep_alive_interval);

        let max_payload = self.config.max_frame_payload();
        let mut reassembler = Reassembler::new(self.config.max_message_size);

        loop {
            let state = self.state();
            if state == ConnectionState::Closed {
                break;
            }

            let read = async {
                if state.is_open() {
                    Ok(Frame::read_from(&mut reader, max_payload).await)
                } else {
                    timeout(
                        self.config.close_timeout,
                        Frame::read_from(&mut reader, max_payload),
                    )
                    .await
                }
            };
            let result = tokio::select! {
                result = read => result,
                () = self.wait_closed() => break,
            };

            let frame = match result {
                Ok(Ok(frame)) => frame,
                Ok(Err(FrameError::Io(err))) => {
                    debug!(error = %err, "stream ended");
                    self.teardown(CloseCode::Abnormal.as_u16(), &err.to_string())
                        .await;
                    break;
                }
                Ok(Err(err)) => {
                    // The stream position is unknown after a bad header.
                    let code = err.as_close_code();
                    let reason = err.to_string();
                    if self.state().is_open() {
                        self.fail(code, &reason).await;
                    }
                    self.teardown(code.as_u16(), &reason).await;
                    break;
                }
                Err(_) => {
                    debug!("no Close frame from peer within timeout");
                    self.teardown(CloseCode::Abnormal.as_u16(), "close handshake timed out")
                        .await;
                    break;
                }
            };

            if !self.state().is_open() {
                if frame.opcode == OpCode::Close {
                    let status = self.close_status();
                    let (code, reason) = status
                        .map(|s| (s.code, s.reason))
                        .unwrap_or((frame.payload.close_code(), String::new()));
                    self.teardown(code, &reason).await;
                    break;
                }
                trace!(opcode = %frame.opcode, "ignoring frame while closing");
                continue;
            }

            if let Err(err) = self.validate(&frame) {
                self.fail(err.as_close_code(), &err.to_string()).await;
                continue;
            }

            self.emit(ConnectionEvent::Frame {
                payload: Bytes::copy_from_slice(frame.payload.as_bytes()),
                info: FrameInfo {
                    opcode: frame.opcode,
                    fin: frame.fin,
                    compressed: frame.rsv1,
                    masked: frame.is_masked(),
                    payload_len: frame.payload.len(),
                },
            })
            .await;

            match frame.opcode {
                OpCode::Ping => self.on_ping(frame).await,
                OpCode::Pong => self.pong.notify_waiters(),
                OpCode::Close => {
                    self.on_close(&frame).await;
                    break;
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    match reassembler.feed(&frame) {
                        Ok(Some(message)) => self.deliver(message).await,
                        Ok(None) => {}
                        Err(err) => {
                            reassembler.reset();
                            self.fail(err.as_close_code(), &err.to_string()).await;
                        }
                    }
                }
            }
        }

        if self.state() != ConnectionState::Closed {
            self.teardown(CloseCode::Abnormal.as_u16(), "receive loop ended")
                .await;
        }
        debug!(status = ?self.close_status(), "receive loop finished");
    }

    fn validate(&self, frame: &Frame) -> WsResult<()> {
        if !frame.is_masked() {
            return Err(WsError::protocol_error("client frame is not masked"));
        }
        if frame.rsv2 || frame.rsv3 {
            return Err(WsError::protocol_error("RSV2/RSV3 set without a negotiated extension"));
        }
        if frame.rsv1 {
            if !self.compression.is_enabled() {
                return Err(WsError::protocol_error("compressed frame without negotiated compression"));
            }
            if frame.is_control() || frame.opcode == OpCode::Continuation {
                return Err(WsError::protocol_error(format!(
                    "RSV1 set on a {} frame",
                    frame.opcode
                )));
            }
        }
        frame.validate_control()?;
        if frame.opcode == OpCode::Close {
            let len = frame.payload.len();
            if len == 1 {
                return Err(WsError::protocol_error("close payload of 1 byte"));
            }
            if len >= 2 && !is_valid_peer_close_code(frame.payload.close_code()) {
                return Err(WsError::protocol_error(format!(
                    "invalid close code {}",
                    frame.payload.close_code()
                )));
            }
        }
        Ok(())
    }

    async fn on_ping(&self, frame: Frame) {
        let payload = frame.payload.into_bytes();
        if self.config.emit_ping_messages {
            self.emit(ConnectionEvent::Message {
                info: MessageInfo {
                    kind: MessageKind::Ping,
                    compressed: false,
                    fragments: 1,
                    len: payload.len(),
                },
                payload: payload.clone(),
            })
            .await;
        }
        let _ = self
            .write_frames(&[Frame::pong(payload)], WriteKind::Control)
            .await;
    }

    async fn on_close(&self, frame: &Frame) {
        if !self.transition(ConnectionState::Open, ConnectionState::CloseReceived) {
            return;
        }
        let code = frame.payload.close_code();
        let reason = frame.payload.close_reason().unwrap_or_default().to_string();
        self.record_status(code, &reason);

        let echo = if CloseCode::is_reserved_code(code) {
            Frame::close_empty()
        } else {
            Frame::close(code, "")
        };
        let _ = self.write_frames(&[echo], WriteKind::Close).await;
        self.teardown(code, &reason).await;
    }

    async fn deliver(&self, message: AssembledMessage) {
        let Some(kind) = MessageKind::from_opcode(message.opcode) else {
            return;
        };

        let payload = if message.compressed {
            match decompress(self.compression, &message.payload, self.config.max_message_size) {
                Ok(payload) => payload,
                Err(err) => {
                    self.fail(err.as_close_code(), &err.to_string()).await;
                    return;
                }
            }
        } else {
            message.payload
        };

        if kind == MessageKind::Text
            && self.config.text_encoding == TextEncoding::Utf8
            && std::str::from_utf8(&payload).is_err()
        {
            self.fail(CloseCode::InvalidData, "text message is not valid UTF-8")
                .await;
            return;
        }

        metrics::record_message_received(&self.path, kind.as_str(), payload.len());
        self.emit(ConnectionEvent::Message {
            info: MessageInfo {
                kind,
                compressed: message.compressed,
                fragments: message.fragments,
                len: payload.len(),
            },
            payload,
        })
        .await;
    }
}

/// Codes a peer may legitimately put in a Close frame (RFC 6455 §7.4).
fn is_valid_peer_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

impl WebSocketContext for WebSocket {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn close_status(&self) -> Option<CloseStatus> {
        self.close_status.lock().clone()
    }

    fn text_encoding(&self) -> TextEncoding {
        self.config.text_encoding
    }

    fn send(&self, payload: Bytes, kind: MessageKind) -> BoxFuture<'_, WsResult<()>> {
        Box::pin(self.send_payload(payload, kind))
    }

    fn ping(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.ping_peer())
    }

    fn close(&self, code: CloseCode, reason: String) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.close_with(code, &reason).await })
    }

    fn closed(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.wait_closed())
    }

    fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> BoxFuture<'static, ()> {
        Box::pin(self.receive_loop(shutdown))
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("protocol", &self.protocol)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{self, EventReceiver};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn handshake(compression: CompressionMethod) -> Handshake {
        Handshake {
            path: "/test".to_string(),
            accept_key: String::new(),
            protocol: None,
            compression,
        }
    }

    fn connect(config: WebSocketConfig) -> (Arc<WebSocket>, DuplexStream, EventReceiver) {
        connect_with_buffer(config, 64 * 1024)
    }

    /// A peer whose socket buffers at most `buffer` bytes it has not read.
    fn connect_with_buffer(
        config: WebSocketConfig,
        buffer: usize,
    ) -> (Arc<WebSocket>, DuplexStream, EventReceiver) {
        let (server, client) = tokio::io::duplex(buffer);
        let (tx, rx) = dispatch::channel(config.event_queue_capacity);
        let ws = WebSocket::new(server, &handshake(CompressionMethod::None), config, tx);
        (ws, client, rx)
    }

    fn quiet() -> WebSocketConfig {
        WebSocketConfig::default()
            .keep_alive_interval(Duration::ZERO)
            .close_timeout(Duration::from_millis(200))
            .ping_timeout(Duration::from_millis(200))
    }

    async fn next_frame(client: &mut DuplexStream) -> Frame {
        timeout(Duration::from_secs(2), Frame::read_from(client, 0))
            .await
            .expect("frame within timeout")
            .expect("valid frame")
    }

    async fn write(client: &mut DuplexStream, frame: Frame) {
        client.write_all(&frame.with_mask(KEY).encode()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_close_code_sends_no_frame() {
        let (ws, mut client, _rx) = connect(quiet());

        ws.close(CloseCode::Abnormal, "local failure".to_string()).await;
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert_eq!(ws.close_status().unwrap().code, 1006);

        let mut captured = Vec::new();
        client.read_to_end(&mut captured).await.unwrap();
        assert!(captured.is_empty(), "unexpected bytes {captured:?}");
    }

    #[tokio::test]
    async fn test_close_times_out_without_peer_answer() {
        let (ws, mut client, _rx) = connect(quiet());

        ws.close(CloseCode::Normal, "bye".to_string()).await;
        assert_eq!(ws.state(), ConnectionState::Closed);

        let frame = next_frame(&mut client).await;
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(frame.payload.close_code(), 1000);
        assert_eq!(frame.payload.close_reason(), Some("bye"));
        assert!(!frame.is_masked());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (ws, _client, _rx) = connect(quiet());
        ws.close(CloseCode::Abnormal, String::new()).await;
        ws.close(CloseCode::Normal, String::new()).await;
        assert_eq!(ws.close_status().unwrap().code, 1006);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (ws, _client, _rx) = connect(quiet());
        ws.close(CloseCode::Abnormal, String::new()).await;
        let err = ws.send(Bytes::from_static(b"late"), MessageKind::Text).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_ping_answered_and_unanswered() {
        let (ws, mut client, _rx) = connect(quiet());
        tokio::spawn(Arc::clone(&ws).run(ShutdownSignal::new()));

        let pinger = tokio::spawn({
            let ws = Arc::clone(&ws);
            async move { ws.ping().await }
        });
        let ping = next_frame(&mut client).await;
        assert_eq!(ping.opcode, OpCode::Ping);
        write(&mut client, Frame::pong(ping.payload.into_bytes())).await;
        assert!(pinger.await.unwrap());

        // Nobody answers this one.
        assert!(!ws.ping().await);
        assert_eq!(next_frame(&mut client).await.opcode, OpCode::Ping);
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let config = quiet().fragment_size(16);
        let (ws, mut client, _rx) = connect(config);

        let first = Bytes::from(vec![b'a'; 160]);
        let second = Bytes::from(vec![b'b'; 160]);
        let (r1, r2) = tokio::join!(
            ws.send(first.clone(), MessageKind::Binary),
            ws.send(second.clone(), MessageKind::Binary),
        );
        r1.unwrap();
        r2.unwrap();

        let mut messages = Vec::new();
        let mut current = Vec::new();
        while messages.len() < 2 {
            let frame = next_frame(&mut client).await;
            if frame.opcode == OpCode::Binary {
                assert!(current.is_empty(), "new message started mid-message");
            } else {
                assert_eq!(frame.opcode, OpCode::Continuation);
            }
            current.extend_from_slice(frame.payload.as_bytes());
            if frame.fin {
                messages.push(std::mem::take(&mut current));
            }
        }

        assert!(messages.iter().all(|m| m.len() == 160));
        assert!(messages.iter().all(|m| m.iter().all(|b| *b == m[0])));
        assert_ne!(messages[0][0], messages[1][0]);
    }

    #[tokio::test]
    async fn test_peer_close_is_echoed() {
        let (ws, mut client, _rx) = connect(quiet());
        let run = tokio::spawn(Arc::clone(&ws).run(ShutdownSignal::new()));

        write(&mut client, Frame::close(1000, "bye")).await;
        let echo = next_frame(&mut client).await;
        assert_eq!(echo.opcode, OpCode::Close);
        assert_eq!(echo.payload.close_code(), 1000);

        run.await.unwrap();
        assert_eq!(ws.state(), ConnectionState::Closed);
        let status = ws.close_status().unwrap();
        assert_eq!(status.code, 1000);
        assert_eq!(status.reason, "bye");
    }

    #[tokio::test]
    async fn test_message_event_after_frames() {
        let (ws, mut client, mut rx) = connect(quiet());
        tokio::spawn(Arc::clone(&ws).run(ShutdownSignal::new()));

        write(&mut client, Frame::text("Hel").with_fin(false)).await;
        write(&mut client, Frame::continuation("lo", true)).await;

        let mut frames = 0;
        loop {
            match rx.recv().await.unwrap() {
                ConnectionEvent::Frame { .. } => frames += 1,
                ConnectionEvent::Message { payload, info } => {
                    assert_eq!(&payload[..], b"Hello");
                    assert_eq!(info.kind, MessageKind::Text);
                    assert_eq!(info.fragments, 2);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(frames, 2);
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_with_invalid_data() {
        let (ws, mut client, _rx) = connect(quiet());
        tokio::spawn(Arc::clone(&ws).run(ShutdownSignal::new()));

        write(&mut client, Frame::text(vec![0xff, 0xfe])).await;
        let close = next_frame(&mut client).await;
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(close.payload.close_code(), 1007);
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let (ws, mut client, _rx) = connect(quiet());
        let shutdown = ShutdownSignal::new();
        tokio::spawn(Arc::clone(&ws).run(shutdown.clone()));

        shutdown.trigger();
        let close = next_frame(&mut client).await;
        assert_eq!(close.payload.close_code(), 1001);
        write(&mut client, Frame::close(1001, "")).await;

        timeout(Duration::from_secs(1), ws.closed()).await.unwrap();
        assert_eq!(ws.close_status().unwrap().code, 1001);
    }

    #[tokio::test]
    async fn test_close_bounded_when_peer_stops_reading() {
        let (ws, _client, _rx) = connect_with_buffer(quiet(), 4);

        let closed = timeout(
            Duration::from_secs(3),
            ws.close(CloseCode::Normal, "bye".to_string()),
        )
        .await;
        assert!(closed.is_ok(), "close hung on a stalled peer");
        assert_eq!(ws.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_ping_bounded_when_peer_stops_reading() {
        let (ws, _client, _rx) = connect_with_buffer(quiet(), 4);

        // A two-byte text frame fills the peer's buffer exactly.
        ws.send(Bytes::from_static(b"hi"), MessageKind::Text)
            .await
            .unwrap();

        let answered = timeout(Duration::from_secs(3), ws.ping()).await;
        assert_eq!(answered.ok(), Some(false));
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert_eq!(ws.close_status().unwrap().code, 1006);
    }

    #[tokio::test]
    async fn test_stalled_data_write_fails_connection() {
        let config = quiet().write_timeout(Duration::from_millis(200));
        let (ws, _client, _rx) = connect_with_buffer(config, 4);

        let result = timeout(
            Duration::from_secs(3),
            ws.send(Bytes::from(vec![7u8; 64]), MessageKind::Binary),
        )
        .await
        .expect("send bounded by the write timeout");
        let err = result.unwrap_err();
        assert_eq!(err.close_code(), Some(1006));
        assert!(err.is_fatal());
        assert_eq!(ws.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_overtakes_unbounded_stuck_write() {
        let config = quiet().write_timeout(Duration::ZERO);
        let (ws, _client, _rx) = connect_with_buffer(config, 4);

        let stuck = tokio::spawn({
            let ws = Arc::clone(&ws);
            async move { ws.send(Bytes::from(vec![1u8; 64]), MessageKind::Binary).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stuck.is_finished());

        timeout(
            Duration::from_secs(3),
            ws.close(CloseCode::Normal, "bye".to_string()),
        )
        .await
        .expect("close waits at most the close timeout for the writer");
        assert_eq!(ws.state(), ConnectionState::Closed);

        let send = timeout(Duration::from_secs(3), stuck)
            .await
            .expect("stuck send released by teardown")
            .unwrap();
        assert!(send.is_err());
    }

    #[tokio::test]
    async fn test_slow_handler_bounds_event_queue() {
        let config = quiet().event_queue_capacity(2);
        let (ws, mut client, mut rx) = connect(config);
        tokio::spawn(Arc::clone(&ws).run(ShutdownSignal::new()));

        for i in 0..10 {
            write(&mut client, Frame::text(format!("m{i}").as_str())).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.len() <= 2, "queue grew to {}", rx.len());

        let mut received = Vec::new();
        while received.len() < 10 {
            let event = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event within timeout")
                .unwrap();
            if let ConnectionEvent::Message { payload, .. } = event {
                received.push(String::from_utf8(payload.to_vec()).unwrap());
            }
            assert!(rx.len() <= 2);
        }
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_close_not_blocked_by_full_event_queue() {
        let config = quiet().event_queue_capacity(1);
        let (ws, mut client, _rx) = connect(config);
        let run = tokio::spawn(Arc::clone(&ws).run(ShutdownSignal::new()));

        for i in 0..5 {
            write(&mut client, Frame::text(format!("m{i}").as_str())).await;
        }
        write(&mut client, Frame::close(1000, "")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ws.state().is_open());

        ws.close(CloseCode::Normal, "bye".to_string()).await;
        timeout(Duration::from_secs(3), run)
            .await
            .expect("receive loop finishes once closing")
            .unwrap();
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert_eq!(ws.close_status().unwrap().code, 1000);
    }
}
