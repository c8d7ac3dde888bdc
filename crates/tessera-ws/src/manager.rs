//! Per-endpoint connection management.
//!
//! A [`ConnectionManager`] owns every connection accepted on one path. It
//! negotiates subprotocols during the handshake, keeps a registry of live
//! connections, purges dead ones on a watchdog timer, and broadcasts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use http::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};

use tessera_telemetry::metrics;

use crate::compression::CompressionMethod;
use crate::config::{EngineKind, ManagerConfig, WebSocketConfig};
use crate::context::{ConnectionId, SharedContext};
use crate::dispatch::{self, ConnectionEvent, EventReceiver, EventSender};
use crate::engine::WebSocket;
use crate::error::{CloseCode, WsError, WsResult};
use crate::handler::WebSocketHandler;
use crate::handshake::{
    bad_request_response, is_valid_token, negotiate_protocol, plain_response, Handshake,
    HandshakeResponse, UpgradeRequest,
};
use crate::message::MessageKind;
use crate::shutdown::ShutdownSignal;
use crate::tungstenite_engine::TungsteniteConnection;

/// Counters for one manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Connections currently registered.
    pub active: usize,
    /// Connections accepted since creation.
    pub total_accepted: usize,
    /// Upgrade requests rejected during negotiation.
    pub total_rejected: usize,
    /// Connections that left the registry.
    pub total_closed: usize,
    /// Connections removed by the watchdog.
    pub total_purged: usize,
}

struct ConnectionEntry {
    ctx: SharedContext,
    events: EventSender,
}

/// Owns the connections of one endpoint path.
pub struct ConnectionManager {
    path: String,
    handler: Arc<dyn WebSocketHandler>,
    protocols: RwLock<Vec<String>>,
    websocket: RwLock<WebSocketConfig>,
    watchdog_enabled: bool,
    watchdog_interval: Duration,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    started: AtomicBool,
    shutdown: ShutdownSignal,
    watchdog: SyncMutex<Option<JoinHandle<()>>>,
    total_accepted: AtomicUsize,
    total_rejected: AtomicUsize,
    total_closed: AtomicUsize,
    total_purged: AtomicUsize,
}

impl ConnectionManager {
    /// Create a manager for `path`.
    ///
    /// Fails if a configured subprotocol is not a valid token or is listed twice.
    pub fn new(
        path: impl Into<String>,
        config: ManagerConfig,
        handler: Arc<dyn WebSocketHandler>,
    ) -> WsResult<Arc<Self>> {
        let manager = Self {
            path: path.into(),
            handler,
            protocols: RwLock::new(Vec::new()),
            websocket: RwLock::new(config.websocket),
            watchdog_enabled: config.watchdog_enabled,
            watchdog_interval: config.watchdog_interval,
            connections: DashMap::new(),
            started: AtomicBool::new(false),
            shutdown: ShutdownSignal::new(),
            watchdog: SyncMutex::new(None),
            total_accepted: AtomicUsize::new(0),
            total_rejected: AtomicUsize::new(0),
            total_closed: AtomicUsize::new(0),
            total_purged: AtomicUsize::new(0),
        };
        for protocol in config.protocols {
            manager.add_protocol(protocol)?;
        }
        Ok(Arc::new(manager))
    }

    /// Endpoint path served by this manager.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Application callbacks.
    pub fn handler(&self) -> &Arc<dyn WebSocketHandler> {
        &self.handler
    }

    /// Registered subprotocols, in registration order.
    pub fn protocols(&self) -> Vec<String> {
        self.protocols.read().clone()
    }

    /// Per-connection settings applied to new connections.
    pub fn websocket_config(&self) -> WebSocketConfig {
        self.websocket.read().clone()
    }

    /// Whether the first connection has been accepted.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Register a subprotocol.
    pub fn add_protocol(&self, name: impl Into<String>) -> WsResult<()> {
        let name = name.into();
        self.ensure_not_started()?;
        if !is_valid_token(&name) {
            return Err(WsError::InvalidProtocolName(name));
        }

        let mut protocols = self.protocols.write();
        if protocols.contains(&name) {
            return Err(WsError::DuplicateProtocol(name));
        }
        protocols.push(name);
        Ok(())
    }

    /// Replace the per-connection settings.
    pub fn set_websocket_config(&self, config: WebSocketConfig) -> WsResult<()> {
        self.ensure_not_started()?;
        *self.websocket.write() = config;
        Ok(())
    }

    fn ensure_not_started(&self) -> WsResult<()> {
        if self.is_started() {
            return Err(WsError::AlreadyStarted(self.path.clone()));
        }
        Ok(())
    }

    fn reject(&self, reason: &'static str, response: HandshakeResponse) -> HandshakeResponse {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_handshake_rejected(&self.path, reason);
        debug!(path = %self.path, reason, status = %response.status(), "upgrade rejected");
        response
    }

    /// Decide whether an upgrade request is accepted.
    ///
    /// On rejection the returned response is ready to send: `503` once shut
    /// down, otherwise `400`. A subprotocol mismatch lists every supported
    /// protocol in its own `Sec-WebSocket-Protocol` header.
    pub fn negotiate(&self, request: &UpgradeRequest) -> Result<Handshake, HandshakeResponse> {
        if self.is_shutdown() {
            return Err(self.reject(
                "shutdown",
                plain_response(StatusCode::SERVICE_UNAVAILABLE, "endpoint is shutting down"),
            ));
        }

        let accept_key = match request.validate() {
            Ok(key) => key,
            Err(err) => {
                return Err(self.reject("headers", bad_request_response(&err.to_string(), &[])));
            }
        };

        let protocols = self.protocols.read().clone();
        let Some(protocol) = negotiate_protocol(&request.protocols, &protocols) else {
            return Err(self.reject(
                "subprotocol",
                bad_request_response("no supported subprotocol requested", &protocols),
            ));
        };

        let config = self.websocket.read();
        let compression = if config.compression.is_enabled()
            && config.engine == EngineKind::Native
            && request.offers_deflate()
        {
            CompressionMethod::Deflate
        } else {
            CompressionMethod::None
        };

        Ok(Handshake {
            path: self.path.clone(),
            accept_key,
            protocol,
            compression,
        })
    }

    /// Answer a hyper upgrade request.
    ///
    /// The returned response is either a rejection or the `101`. In the
    /// latter case the connection is accepted once hyper hands over the
    /// upgraded stream.
    pub fn upgrade<B>(self: &Arc<Self>, mut request: Request<B>) -> HandshakeResponse {
        let handshake = match self.negotiate(&UpgradeRequest::from_request(&request)) {
            Ok(handshake) => handshake,
            Err(response) => return response,
        };

        let response = handshake.response();
        let on_upgrade = hyper::upgrade::on(&mut request);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    if let Err(err) = manager.accept(TokioIo::new(upgraded), handshake).await {
                        warn!(path = %manager.path, error = %err, "failed to accept connection");
                    }
                }
                Err(err) => {
                    warn!(path = %manager.path, error = %err, "upgrade failed");
                }
            }
        });
        response
    }

    /// Take ownership of an upgraded stream.
    ///
    /// Registers the connection, fires the connected callback and spawns the
    /// receive loop. The first call starts the watchdog.
    #[instrument(skip_all, fields(path = %self.path))]
    pub async fn accept<S>(self: &Arc<Self>, stream: S, handshake: Handshake) -> WsResult<SharedContext>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_shutdown() {
            return Err(WsError::connection_closed(
                Some(CloseCode::GoingAway.as_u16()),
                "endpoint is shutting down",
            ));
        }
        if !self.started.swap(true, Ordering::AcqRel) {
            self.start_watchdog();
        }

        let config = self.websocket_config();
        let (events, receiver) = dispatch::channel(config.event_queue_capacity);
        let ctx = match config.engine {
            EngineKind::Native => {
                WebSocket::new(stream, &handshake, config, events.clone()) as SharedContext
            }
            EngineKind::Tungstenite => {
                TungsteniteConnection::new(stream, &handshake, config, events.clone()).await
                    as SharedContext
            }
        };

        self.register(Arc::clone(&ctx), events, receiver);

        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let running = Arc::clone(&ctx);
        tokio::spawn(async move {
            Arc::clone(&running).run(shutdown).await;
            manager.connection_finished(&running);
        });

        Ok(ctx)
    }

    fn register(self: &Arc<Self>, ctx: SharedContext, events: EventSender, receiver: EventReceiver) {
        let id = ctx.id();
        // The queue is new, so there is room for the first event.
        let _ = events.try_send(ConnectionEvent::Connected);
        self.connections.insert(
            id,
            ConnectionEntry {
                ctx: Arc::clone(&ctx),
                events,
            },
        );
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_opened(&self.path);
        debug!(connection_id = %id, protocol = ?ctx.protocol(), "connection registered");

        tokio::spawn(dispatch::run_dispatcher(Arc::clone(self), ctx, receiver));
    }

    fn connection_finished(self: &Arc<Self>, ctx: &SharedContext) {
        // The watchdog may have removed it already.
        if let Some((_, entry)) = self.connections.remove(&ctx.id()) {
            self.release(entry);
        }
    }

    fn release(self: &Arc<Self>, entry: ConnectionEntry) {
        self.total_closed.fetch_add(1, Ordering::Relaxed);
        let code = entry
            .ctx
            .close_status()
            .map_or(CloseCode::Abnormal.as_u16(), |status| status.code);
        metrics::record_connection_closed(&self.path, code);
        debug!(connection_id = %entry.ctx.id(), code, "connection removed");

        // Queued behind any pending events; the send waits for room.
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let ConnectionEntry { ctx, events } = entry;
            if events.send(ConnectionEvent::Disconnected).await.is_err() {
                // The dispatcher is gone; run the callback here.
                let handler = Arc::clone(manager.handler());
                let fut = handler.on_client_disconnected(&manager, &ctx);
                dispatch::invoke(&ctx, "disconnected", fut).await;
            }
        });
    }

    fn start_watchdog(self: &Arc<Self>) {
        if !self.watchdog_enabled || self.watchdog_interval.is_zero() {
            return;
        }

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.watchdog_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.recv() => break,
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let purged = manager.purge_disconnected();
                if purged > 0 {
                    info!(path = %manager.path, purged, "watchdog purged connections");
                }
            }
        });
        *self.watchdog.lock() = Some(task);
    }

    /// Remove every registered connection that is no longer open.
    ///
    /// This is one watchdog tick. Each removed connection gets its
    /// disconnected callback on its dispatcher task, so the callback may
    /// call back into the manager.
    pub fn purge_disconnected(self: &Arc<Self>) -> usize {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.ctx.state().is_open())
            .map(|entry| *entry.key())
            .collect();

        let mut purged = 0;
        for id in stale {
            let Some((_, entry)) = self.connections.remove(&id) else {
                continue;
            };
            purged += 1;
            self.total_purged.fetch_add(1, Ordering::Relaxed);

            let ctx = Arc::clone(&entry.ctx);
            tokio::spawn(async move {
                ctx.close(CloseCode::Abnormal, "purged by watchdog".to_string())
                    .await;
            });
            self.release(entry);
        }
        purged
    }

    /// Send to every open connection. Returns how many sends succeeded.
    pub async fn broadcast(&self, payload: Bytes, kind: MessageKind) -> usize {
        self.broadcast_filtered(payload, kind, |_| true).await
    }

    /// Send to every open connection accepted by `filter`.
    pub async fn broadcast_filtered<F>(&self, payload: Bytes, kind: MessageKind, filter: F) -> usize
    where
        F: Fn(&SharedContext) -> bool,
    {
        let targets: Vec<SharedContext> = self
            .connections
            .iter()
            .filter(|entry| entry.ctx.state().is_open() && filter(&entry.ctx))
            .map(|entry| Arc::clone(&entry.ctx))
            .collect();

        let results = join_all(targets.iter().map(|ctx| ctx.send(payload.clone(), kind))).await;
        results.into_iter().filter(Result::is_ok).count()
    }

    /// Look up a registered connection.
    pub fn get(&self, id: &ConnectionId) -> Option<SharedContext> {
        self.connections.get(id).map(|entry| Arc::clone(&entry.ctx))
    }

    /// Ids of all registered connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Current counters.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.connections.len(),
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_closed: self.total_closed.load(Ordering::Relaxed),
            total_purged: self.total_purged.load(Ordering::Relaxed),
        }
    }

    /// Close every connection with `GoingAway` and stop the watchdog.
    ///
    /// Later upgrades are refused. Calling this again does nothing.
    pub async fn shutdown(&self) {
        if self.is_shutdown() {
            return;
        }
        self.shutdown.trigger();
        if let Some(task) = self.watchdog.lock().take() {
            task.abort();
        }

        let open: Vec<SharedContext> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(&entry.ctx))
            .collect();
        info!(path = %self.path, connections = open.len(), "shutting down endpoint");

        let wait = self.websocket.read().close_timeout;
        join_all(open.iter().map(|ctx| async move {
            ctx.close(CloseCode::GoingAway, "server shutting down".to_string())
                .await;
            let _ = timeout(wait, ctx.closed()).await;
        }))
        .await;
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("path", &self.path)
            .field("protocols", &*self.protocols.read())
            .field("connections", &self.connections.len())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_EVENT_QUEUE_CAPACITY;
    use crate::context::{BoxFuture, CloseStatus, ConnectionState, WebSocketContext};
    use crate::handler::HandlerResult;
    use crate::message::{MessageInfo, TextEncoding};
    use tokio::sync::{watch, Notify};

    struct StubContext {
        id: ConnectionId,
        state: watch::Sender<ConnectionState>,
        sent: AtomicUsize,
    }

    impl StubContext {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(),
                state: watch::channel(ConnectionState::Open).0,
                sent: AtomicUsize::new(0),
            })
        }
    }

    impl WebSocketContext for StubContext {
        fn id(&self) -> ConnectionId {
            self.id
        }
        fn path(&self) -> &str {
            "/stub"
        }
        fn protocol(&self) -> Option<&str> {
            None
        }
        fn state(&self) -> ConnectionState {
            *self.state.borrow()
        }
        fn close_status(&self) -> Option<CloseStatus> {
            None
        }
        fn text_encoding(&self) -> TextEncoding {
            TextEncoding::Utf8
        }
        fn send(&self, _payload: Bytes, _kind: MessageKind) -> BoxFuture<'_, WsResult<()>> {
            Box::pin(async move {
                if !self.state().is_open() {
                    return Err(WsError::connection_closed(None, "closed"));
                }
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
        fn ping(&self) -> BoxFuture<'_, bool> {
            Box::pin(async { true })
        }
        fn close(&self, _code: CloseCode, _reason: String) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.state.send_replace(ConnectionState::Closed);
            })
        }
        fn closed(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                let mut rx = self.state.subscribe();
                let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
            })
        }
        fn run(self: Arc<Self>, _shutdown: ShutdownSignal) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    #[derive(Default)]
    struct Counting {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        notify: Notify,
    }

    impl WebSocketHandler for Counting {
        fn on_client_connected<'a>(
            &'a self,
            _manager: &'a Arc<ConnectionManager>,
            _ctx: &'a SharedContext,
        ) -> BoxFuture<'a, HandlerResult> {
            Box::pin(async move {
                self.connected.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn on_client_disconnected<'a>(
            &'a self,
            manager: &'a Arc<ConnectionManager>,
            _ctx: &'a SharedContext,
        ) -> BoxFuture<'a, HandlerResult> {
            Box::pin(async move {
                // Calling back into the manager must not deadlock.
                let _ = manager.broadcast(Bytes::from_static(b"left"), MessageKind::Text).await;
                self.disconnected.fetch_add(1, Ordering::SeqCst);
                self.notify.notify_one();
                Ok(())
            })
        }

        fn on_message_received<'a>(
            &'a self,
            _manager: &'a Arc<ConnectionManager>,
            _ctx: &'a SharedContext,
            _payload: Bytes,
            _message: MessageInfo,
        ) -> BoxFuture<'a, HandlerResult> {
            Box::pin(async { Ok(()) })
        }
    }

    fn manager_with(handler: Arc<Counting>, config: ManagerConfig) -> Arc<ConnectionManager> {
        ConnectionManager::new("/stub", config, handler).unwrap()
    }

    fn add_stub(manager: &Arc<ConnectionManager>) -> Arc<StubContext> {
        let stub = StubContext::new();
        let (tx, rx) = dispatch::channel(DEFAULT_EVENT_QUEUE_CAPACITY);
        manager.register(stub.clone(), tx, rx);
        stub
    }

    #[tokio::test]
    async fn test_watchdog_purges_closed_connection() {
        let handler = Arc::new(Counting::default());
        let manager = manager_with(handler.clone(), ManagerConfig::default());

        let stubs: Vec<_> = (0..3).map(|_| add_stub(&manager)).collect();
        assert_eq!(manager.len(), 3);

        stubs[1].state.send_replace(ConnectionState::CloseSent);
        assert_eq!(manager.purge_disconnected(), 1);
        assert_eq!(manager.len(), 2);
        assert!(manager.get(&stubs[1].id).is_none());

        tokio::time::timeout(Duration::from_secs(1), handler.notify.notified())
            .await
            .unwrap();
        assert_eq!(manager.purge_disconnected(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(handler.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(handler.connected.load(Ordering::SeqCst), 3);
        assert_eq!(stubs[0].sent.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().total_purged, 1);
        assert_eq!(manager.stats().active, 2);
    }

    #[tokio::test]
    async fn test_finished_after_purge_fires_once() {
        let handler = Arc::new(Counting::default());
        let manager = manager_with(handler.clone(), ManagerConfig::default());
        let stub = add_stub(&manager);

        stub.state.send_replace(ConnectionState::Closed);
        assert_eq!(manager.purge_disconnected(), 1);
        let ctx: SharedContext = stub;
        manager.connection_finished(&ctx);

        tokio::time::timeout(Duration::from_secs(1), handler.notify.notified())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().total_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_timer_runs() {
        let handler = Arc::new(Counting::default());
        let config = ManagerConfig::default().watchdog_interval(Duration::from_secs(5));
        let manager = manager_with(handler.clone(), config);
        manager.start_watchdog();

        let stub = add_stub(&manager);
        stub.state.send_replace(ConnectionState::Closed);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(manager.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_filtered() {
        let handler = Arc::new(Counting::default());
        let manager = manager_with(handler, ManagerConfig::default());
        let a = add_stub(&manager);
        let b = add_stub(&manager);

        let target = a.id;
        let sent = manager
            .broadcast_filtered(Bytes::from_static(b"x"), MessageKind::Text, |ctx| {
                ctx.id() == target
            })
            .await;
        assert_eq!(sent, 1);
        assert_eq!(manager.broadcast(Bytes::from_static(b"y"), MessageKind::Binary).await, 2);
        assert_eq!(a.sent.load(Ordering::SeqCst), 2);
        assert_eq!(b.sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_protocol_registration_rules() {
        let handler = Arc::new(Counting::default());
        let manager = manager_with(handler, ManagerConfig::default().protocol("chat"));

        assert!(matches!(manager.add_protocol("chat"), Err(WsError::DuplicateProtocol(_))));
        assert!(matches!(
            manager.add_protocol("bad name"),
            Err(WsError::InvalidProtocolName(_))
        ));
        manager.add_protocol("echo").unwrap();
        assert_eq!(manager.protocols(), vec!["chat", "echo"]);

        manager.started.store(true, Ordering::Release);
        assert!(matches!(manager.add_protocol("late"), Err(WsError::AlreadyStarted(_))));
        assert!(matches!(
            manager.set_websocket_config(WebSocketConfig::default()),
            Err(WsError::AlreadyStarted(_))
        ));
    }

    #[test]
    fn test_new_rejects_invalid_configured_protocol() {
        let handler = Arc::new(Counting::default());
        let result = ConnectionManager::new("/x", ManagerConfig::default().protocol("a b"), handler);
        assert!(matches!(result, Err(WsError::InvalidProtocolName(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_rejects() {
        let handler = Arc::new(Counting::default());
        let manager = manager_with(handler, ManagerConfig::default());
        let stub = add_stub(&manager);

        manager.shutdown().await;
        assert_eq!(stub.state(), ConnectionState::Closed);
        assert!(manager.is_shutdown());

        let request = UpgradeRequest {
            path: "/stub".to_string(),
            connection: Some("Upgrade".to_string()),
            upgrade: Some("websocket".to_string()),
            version: Some("13".to_string()),
            key: Some("dGhlIHNhbXBsZSBub25jZQ==".to_string()),
            protocols: Vec::new(),
            extensions: Vec::new(),
        };
        let response = manager.negotiate(&request).unwrap_err();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        manager.shutdown().await;
    }
}
