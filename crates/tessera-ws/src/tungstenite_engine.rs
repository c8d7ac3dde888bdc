//! Connections served by `tokio-tungstenite`.
//!
//! An alternative to the native engine behind the same
//! [`WebSocketContext`] interface. Tungstenite reassembles messages and
//! answers Pings and Close frames on its own, so this connection reports
//! one synthesised frame event per message and does not support
//! compression.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, instrument, trace, warn};
use tungstenite::protocol::{Role, WebSocketConfig as TungsteniteConfig};
use tungstenite::Message as WireMessage;

use tessera_telemetry::metrics;

use crate::config::WebSocketConfig;
use crate::context::{
    BoxFuture, CloseStatus, ConnectionId, ConnectionState, SharedContext, WebSocketContext,
};
use crate::dispatch::{ConnectionEvent, EventSender};
use crate::engine::{sleep_until_deadline, WriteFailure, WriteKind};
use crate::error::{CloseCode, WsError, WsResult};
use crate::frame::OpCode;
use crate::handshake::Handshake;
use crate::keepalive;
use crate::message::{FrameInfo, MessageInfo, MessageKind, TextEncoding};
use crate::shutdown::ShutdownSignal;

/// Any upgraded byte stream.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

type WsStream = WebSocketStream<Box<dyn IoStream>>;

/// A connection backed by a tungstenite [`WebSocketStream`].
pub struct TungsteniteConnection {
    id: ConnectionId,
    path: String,
    protocol: Option<String>,
    config: WebSocketConfig,
    state: watch::Sender<ConnectionState>,
    sink: Mutex<Option<SplitSink<WsStream, WireMessage>>>,
    stream: SyncMutex<Option<SplitStream<WsStream>>>,
    pong: Notify,
    close_status: SyncMutex<Option<CloseStatus>>,
    events: EventSender,
}

impl TungsteniteConnection {
    /// Wrap an upgraded stream whose handshake has already been answered.
    pub async fn new<S>(
        stream: S,
        handshake: &Handshake,
        config: WebSocketConfig,
        events: EventSender,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let limit = (config.max_message_size != 0).then_some(config.max_message_size);
        let wire_config = TungsteniteConfig::default()
            .max_message_size(limit)
            .max_frame_size(limit);

        let boxed: Box<dyn IoStream> = Box::new(stream);
        let ws = WebSocketStream::from_raw_socket(boxed, Role::Server, Some(wire_config)).await;
        let (sink, stream) = ws.split();
        let (state, _) = watch::channel(ConnectionState::Open);

        Arc::new(Self {
            id: ConnectionId::new(),
            path: handshake.path.clone(),
            protocol: handshake.protocol.clone(),
            config,
            state,
            sink: Mutex::new(Some(sink)),
            stream: SyncMutex::new(Some(stream)),
            pong: Notify::new(),
            close_status: SyncMutex::new(None),
            events,
        })
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            let matched = *state == from;
            if matched {
                *state = to;
            }
            matched
        })
    }

    fn record_status(&self, code: u16, reason: &str) {
        self.close_status.lock().get_or_insert_with(|| CloseStatus {
            code,
            reason: reason.to_string(),
        });
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

    /// Send `message`, or only flush queued replies when it is `None`.
    ///
    /// Bounded like the native engine's writes: a failed, stalled or
    /// overtaken write drops the sink under the lock and fails the
    /// connection with `Abnormal`.
    async fn write(&self, message: Option<WireMessage>, kind: WriteKind) -> WsResult<()> {
        let (limit, deadline) = kind.deadline(&self.config);

        let mut guard = tokio::select! {
            guard = self.sink.lock() => guard,
            () = sleep_until_deadline(deadline) => {
                self.stalled(limit).await;
                return Err(self.closed_error("write stalled"));
            }
            () = self.wait_closed() => return Err(self.closed_error("connection is closed")),
        };

        let state = self.state();
        if state == ConnectionState::Closed {
            drop(guard.take());
            return Err(self.closed_error("connection is closed"));
        }
        // Flushing tungstenite's own replies is allowed while closing.
        if message.is_some() && !kind.allowed_in(state) {
            return Err(self.closed_error("connection is not open"));
        }
        let Some(sink) = guard.as_mut() else {
            return Err(self.closed_error("stream already released"));
        };

        let outcome = {
            let io = async {
                match message {
                    Some(message) => sink.send(message).await,
                    None => sink.flush().await,
                }
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
                drop(guard.take());
                drop(guard);
                match failure {
                    WriteFailure::Failed(err) => {
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

    /// Flush replies tungstenite queued on its own (Pong, Close echo).
    async fn flush(&self) {
        let _ = self.write(None, WriteKind::Control).await;
    }

    async fn stalled(&self, limit: Duration) {
        warn!(connection_id = %self.id, ?limit, "peer stopped reading");
        self.teardown(CloseCode::Abnormal.as_u16(), "write timed out")
            .await;
    }

    /// Drop both halves without a Close frame. Idempotent.
    ///
    /// A writer holding the sink lock sees `Closed` and drops the sink itself.
    async fn teardown(&self, code: u16, reason: &str) {
        self.record_status(code, reason);
        if self.state.send_replace(ConnectionState::Closed) != ConnectionState::Closed {
            debug!(connection_id = %self.id, code, reason, "connection closed");
        }
        self.pong.notify_waiters();

        let sink = self.sink.try_lock().ok().and_then(|mut guard| guard.take());
        drop(sink);
        drop(self.stream.lock().take());
    }

    /// Queue an event for the handler, waiting while the queue is full.
    async fn emit(&self, event: ConnectionEvent) {
        tokio::select! {
            _ = self.events.send(event) => {}
            () = self.wait_not_open() => {
                trace!(connection_id = %self.id, "event dropped while closing");
            }
        }
    }

    async fn begin_close(&self, code: CloseCode, reason: &str) -> bool {
        if !self.transition(ConnectionState::Open, ConnectionState::CloseSent) {
            return false;
        }
        self.record_status(code.as_u16(), reason);

        if code.is_reserved() {
            self.teardown(code.as_u16(), reason).await;
            return false;
        }
        let frame = tungstenite::protocol::CloseFrame {
            code: code.as_u16().into(),
            reason: reason.to_string().into(),
        };
        self.write(Some(WireMessage::Close(Some(frame))), WriteKind::Close)
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
            self.teardown(code.as_u16(), reason).await;
        }
    }

    async fn send_payload(&self, payload: Bytes, kind: MessageKind) -> WsResult<()> {
        let len = payload.len();
        let message = match kind {
            MessageKind::Text => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|e| WsError::EncodeFailed(e.to_string()))?;
                WireMessage::Text(text.into())
            }
            MessageKind::Binary => WireMessage::Binary(payload),
            MessageKind::Ping => WireMessage::Ping(payload),
        };
        self.write(Some(message), WriteKind::Data).await?;
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
            .write(Some(WireMessage::Ping(Bytes::new())), WriteKind::Control)
            .await
            .is_err()
        {
            return false;
        }
        timeout(self.config.ping_timeout, notified).await.is_ok()
            && self.state() != ConnectionState::Closed
    }

    async fn deliver(&self, kind: MessageKind, payload: Bytes) {
        let len = payload.len();
        self.emit(ConnectionEvent::Frame {
            payload: payload.clone(),
            info: FrameInfo {
                opcode: kind.opcode(),
                fin: true,
                compressed: false,
                masked: true,
                payload_len: len,
            },
        })
        .await;
        if kind != MessageKind::Ping {
            metrics::record_message_received(&self.path, kind.as_str(), len);
        }
        if kind != MessageKind::Ping || self.config.emit_ping_messages {
            self.emit(ConnectionEvent::Message {
                payload,
                info: MessageInfo {
                    kind,
                    compressed: false,
                    fragments: 1,
                    len,
                },
            })
            .await;
        }
    }

    #[instrument(skip_all, fields(connection_id = %self.id, path = %self.path))]
    async fn receive_loop(self: Arc<Self>, shutdown: ShutdownSignal) {
        let stream = self.stream.lock().take();
        let Some(mut stream) = stream else {
            return;
        };

        let ctx: SharedContext = self.clone();
        keepalive::spawn_watchers(ctx, shutdown, self.config.keep_alive_interval);

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                () = self.wait_closed() => break,
            };

            match next {
                Some(Ok(WireMessage::Text(text))) => {
                    let payload = Bytes::copy_from_slice(text.as_bytes());
                    self.deliver(MessageKind::Text, payload).await;
                }
                Some(Ok(WireMessage::Binary(data))) => self.deliver(MessageKind::Binary, data).await,
                Some(Ok(WireMessage::Ping(data))) => {
                    self.deliver(MessageKind::Ping, data).await;
                    self.flush().await;
                }
                Some(Ok(WireMessage::Pong(data))) => {
                    self.emit(ConnectionEvent::Frame {
                        info: FrameInfo {
                            opcode: OpCode::Pong,
                            fin: true,
                            compressed: false,
                            masked: true,
                            payload_len: data.len(),
                        },
                        payload: data,
                    })
                    .await;
                    self.pong.notify_waiters();
                }
                Some(Ok(WireMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((CloseCode::NoStatus.as_u16(), String::new()));
                    if self.transition(ConnectionState::Open, ConnectionState::CloseReceived) {
                        self.record_status(code, &reason);
                        self.flush().await;
                    }
                }
                Some(Ok(WireMessage::Frame(_))) => {}
                Some(Err(err)) => {
                    let code = close_code_for(&err);
                    debug!(error = %err, %code, "tungstenite stream failed");
                    if code != CloseCode::Abnormal {
                        metrics::record_protocol_error(&self.path, code.as_u16());
                        self.begin_close(code, &err.to_string()).await;
                    }
                    self.teardown(code.as_u16(), &err.to_string()).await;
                    break;
                }
                None => {
                    trace!("stream ended");
                    break;
                }
            }
        }

        drop(stream);
        let status = self.close_status();
        let (code, reason) = status
            .map(|s| (s.code, s.reason))
            .unwrap_or((CloseCode::Abnormal.as_u16(), "stream ended".to_string()));
        self.teardown(code, &reason).await;
    }
}

fn close_code_for(err: &tungstenite::Error) -> CloseCode {
    match err {
        tungstenite::Error::Capacity(_) => CloseCode::TooBig,
        tungstenite::Error::Protocol(_) => CloseCode::ProtocolError,
        tungstenite::Error::Utf8 { .. } => CloseCode::InvalidData,
        _ => CloseCode::Abnormal,
    }
}

impl WebSocketContext for TungsteniteConnection {
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
        // Tungstenite only carries UTF-8 text.
        TextEncoding::Utf8
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

impl std::fmt::Debug for TungsteniteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteConnection")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
