//! Session Transport - one multiplexed WebSocket to the contract service
//!
//! Correlates request/response pairs by `req_id`, dispatches subscription
//! pushes to registered handlers, and reconnects with exponential backoff.
//! On every disconnect all pending calls are rejected and the subscription
//! registry is cleared; callers re-subscribe after `TransportEvent::Reconnected`.
//!
//! Tasks per connection: one reader, one writer fed by an mpsc channel.
//! A supervisor task drives reconnects and a keepalive task pings while Ready.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{ReconnectConfig, SessionConfig};
use crate::error::{ProtocolErrorClass, Result, SessionError};
use crate::protocol::{self, Authorization, Request};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Callback invoked for every push on a subscription
pub type PushHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Connection lifecycle as seen by the rest of the bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Reconnecting { attempt: u32 },
    Closed,
    Failed,
}

/// Lifecycle notifications for the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Disconnected { reason: String },
    /// Socket re-established and re-authorized; subscriptions must be replayed
    Reconnected,
    FatalDisconnect { attempts: u32 },
}

/// A call waiting for its response
pub struct PendingRequest {
    pub kind: &'static str,
    pub issued_at: Instant,
    reply: oneshot::Sender<Result<Value>>,
    /// Registered against the subscription id carried by the response
    handler: Option<PushHandler>,
}

impl PendingRequest {
    pub fn new(kind: &'static str, reply: oneshot::Sender<Result<Value>>) -> Self {
        Self {
            kind,
            issued_at: Instant::now(),
            reply,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: PushHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    fn resolve(self, result: Result<Value>) {
        // The caller may have timed out and dropped the receiver
        let _ = self.reply.send(result);
    }
}

/// Calls in flight, keyed by correlation id
#[derive(Default)]
pub struct PendingRequests {
    requests: HashMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub fn insert(&mut self, req_id: u64, request: PendingRequest) {
        self.requests.insert(req_id, request);
    }

    pub fn take(&mut self, req_id: u64) -> Option<PendingRequest> {
        self.requests.remove(&req_id)
    }

    pub fn remove(&mut self, req_id: u64) -> bool {
        self.requests.remove(&req_id).is_some()
    }

    pub fn contains(&self, req_id: u64) -> bool {
        self.requests.contains_key(&req_id)
    }

    /// Fail every pending call with `err`; returns how many were rejected
    pub fn reject_all(&mut self, err: SessionError) -> usize {
        let count = self.requests.len();
        for (req_id, request) in self.requests.drain() {
            debug!(
                "Rejecting {} (req_id {}) after {:?}",
                request.kind,
                req_id,
                request.issued_at.elapsed()
            );
            request.resolve(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Push handlers keyed by server-assigned subscription id
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: HashMap<String, PushHandler>,
}

impl SubscriptionRegistry {
    pub fn register(&mut self, subscription_id: String, handler: PushHandler) {
        self.handlers.insert(subscription_id, handler);
    }

    pub fn remove(&mut self, subscription_id: &str) -> bool {
        self.handlers.remove(subscription_id).is_some()
    }

    pub fn handler(&self, subscription_id: &str) -> Option<PushHandler> {
        self.handlers.get(subscription_id).cloned()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.handlers.len();
        self.handlers.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Exponential backoff with optional ±25% jitter
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay = config
        .base_delay_ms
        .saturating_mul(1_u64 << attempt.min(20))
        .min(config.max_delay_ms);

    let jittered = if config.jitter {
        let jitter_range = delay / 4;
        let jitter = rand::random::<u64>() % (jitter_range * 2 + 1);
        delay.saturating_sub(jitter_range) + jitter
    } else {
        delay
    };

    Duration::from_millis(jittered)
}

struct Inner {
    config: SessionConfig,
    next_req_id: AtomicU64,
    generation: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<PendingRequests>,
    subscriptions: Mutex<SubscriptionRegistry>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state: RwLock<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to the session connection
#[derive(Clone)]
pub struct SessionTransport {
    inner: Arc<Inner>,
}

impl SessionTransport {
    /// Create an unconnected transport and the receiver for its lifecycle events
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            next_req_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pending: Mutex::new(PendingRequests::default()),
            subscriptions: Mutex::new(SubscriptionRegistry::default()),
            outbound: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            events,
            tasks: Mutex::new(Vec::new()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Open the socket; Ready on success, `Connection` after the connect timeout
    pub async fn connect(&self) -> Result<()> {
        *self.inner.state.write().await = ConnectionState::Connecting;
        let stream = match self.inner.open_socket().await {
            Ok(stream) => stream,
            Err(e) => {
                *self.inner.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let done = self.inner.attach(stream).await;

        let supervisor = tokio::spawn(supervise(Arc::clone(&self.inner), done));
        let keepalive = tokio::spawn(keepalive(Arc::clone(&self.inner)));
        self.inner.tasks.lock().await.extend([supervisor, keepalive]);

        info!("Session transport ready");
        Ok(())
    }

    /// Authorize with the configured token
    pub async fn authorize(&self) -> Result<Authorization> {
        self.inner.authorize().await
    }

    /// Send a request and wait for its correlated response
    pub async fn call(&self, request: Request) -> Result<Value> {
        self.inner.call(request, None).await
    }

    /// Open a stream; `handler` receives the first payload and every push
    ///
    /// Returns the subscription id, or None when the service answered without
    /// one (e.g. a contract that had already settled).
    pub async fn subscribe(&self, request: Request, handler: PushHandler) -> Result<Option<String>> {
        let response = self.inner.call(request, Some(handler)).await?;
        Ok(protocol::subscription_id(&response))
    }

    /// Stop a stream; the local handler is removed even if `forget` fails
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.inner.subscriptions.lock().await.remove(subscription_id);
        self.call(Request::Forget {
            subscription_id: subscription_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Graceful shutdown without reconnecting
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.inner.outbound.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
        let rejected = self
            .inner
            .pending
            .lock()
            .await
            .reject_all(SessionError::Connection("transport closed".to_string()));
        self.inner.subscriptions.lock().await.clear();
        *self.inner.state.write().await = ConnectionState::Closed;
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Session transport closed ({} pending calls rejected)", rejected);
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().await.len()
    }
}

impl Inner {
    async fn open_socket(&self) -> Result<WsStream> {
        let url = self
            .config
            .url()
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        let timeout = self.config.connect_timeout();

        match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => {
                info!("Connected to {}", self.config.endpoint);
                Ok(stream)
            }
            Ok(Err(e)) => Err(SessionError::Connection(format!(
                "WebSocket connection failed: {}",
                e
            ))),
            Err(_) => Err(SessionError::Connection(format!(
                "connect timed out after {:?}",
                timeout
            ))),
        }
    }

    /// Start reader and writer tasks; the receiver fires when the reader ends
    async fn attach(self: &Arc<Self>, stream: WsStream) -> oneshot::Receiver<String> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, reader) = stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        *self.outbound.lock().await = Some(out_tx);
        *self.state.write().await = ConnectionState::Ready;

        tokio::spawn(write_loop(sink, out_rx));
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let reason = inner.read_loop(reader).await;
            inner.detach(generation, &reason).await;
            let _ = done_tx.send(reason);
        });

        done_rx
    }

    async fn read_loop(&self, mut reader: WsReader) -> String {
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                Some(Ok(Message::Ping(data))) => {
                    if let Some(tx) = self.outbound.lock().await.as_ref() {
                        let _ = tx.send(Message::Pong(data));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => format!("closed by server: {}", frame.reason),
                        None => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("WebSocket error: {}", e),
                None => return "stream ended".to_string(),
            }
        }
    }

    /// Drop connection-scoped state unless a newer connection replaced it
    async fn detach(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.outbound.lock().await.take();
        let rejected = self
            .pending
            .lock()
            .await
            .reject_all(SessionError::Connection(reason.to_string()));
        let dropped = self.subscriptions.lock().await.clear();
        if !self.closed.load(Ordering::SeqCst) {
            *self.state.write().await = ConnectionState::Disconnected;
            warn!(
                "Connection lost ({}): {} pending calls rejected, {} subscriptions dropped",
                reason, rejected, dropped
            );
        }
    }

    async fn dispatch(&self, text: &str) {
        let msg: Value = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return;
            }
        };

        // First response to a call
        if let Some(req_id) = protocol::req_id(&msg) {
            let pending = self.pending.lock().await.take(req_id);
            if let Some(pending) = pending {
                if let Some(err) = protocol::error(&msg) {
                    debug!("{} (req_id {}) failed: {}", pending.kind, req_id, err);
                    pending.resolve(Err(SessionError::Protocol(err)));
                    return;
                }
                if let Some(handler) = pending.handler.clone() {
                    if let Some(sub_id) = protocol::subscription_id(&msg) {
                        self.subscriptions
                            .lock()
                            .await
                            .register(sub_id, Arc::clone(&handler));
                    }
                    handler(msg.clone());
                }
                pending.resolve(Ok(msg));
                return;
            }
        }

        // Subsequent push on a stream
        if let Some(sub_id) = protocol::subscription_id(&msg) {
            let handler = self.subscriptions.lock().await.handler(&sub_id);
            match handler {
                Some(handler) => handler(msg),
                None => debug!("Push for unknown subscription {}", sub_id),
            }
            return;
        }

        if let Some(err) = protocol::error(&msg) {
            warn!("Unsolicited error from service: {}", err);
            return;
        }

        debug!(
            "Dropping message with unknown correlation id {:?} ({:?})",
            protocol::req_id(&msg),
            protocol::msg_type(&msg)
        );
    }

    async fn call(&self, request: Request, handler: Option<PushHandler>) -> Result<Value> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let kind = request.kind();
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut pending = PendingRequest::new(kind, reply_tx);
        if let Some(handler) = handler {
            pending = pending.with_handler(handler);
        }
        self.pending.lock().await.insert(req_id, pending);

        let payload = request.to_payload(req_id);
        let sent = match self.outbound.lock().await.as_ref() {
            Some(tx) => tx.send(Message::Text(payload.to_string())).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().await.remove(req_id);
            return Err(SessionError::Connection("not connected".to_string()));
        }
        debug!("Sent {} (req_id {})", kind, req_id);

        let after = self.config.request_timeout();
        match tokio::time::timeout(after, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Connection("request dropped".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(req_id);
                Err(SessionError::RequestTimeout { kind, after })
            }
        }
    }

    async fn authorize(&self) -> Result<Authorization> {
        let response = self
            .call(
                Request::Authorize {
                    token: self.config.api_token.clone(),
                },
                None,
            )
            .await?;
        let auth = Authorization::parse(&response)?;
        info!("Authorized as {} ({} {})", auth.loginid, auth.balance, auth.currency);
        Ok(auth)
    }

    /// Reconnect with backoff, then re-authorize
    async fn reconnect(self: &Arc<Self>) -> Result<oneshot::Receiver<String>> {
        let policy = self.config.reconnect;
        for attempt in 0..policy.max_attempts {
            let delay = backoff_delay(attempt, &policy);
            *self.state.write().await = ConnectionState::Reconnecting {
                attempt: attempt + 1,
            };
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                policy.max_attempts
            );
            tokio::time::sleep(delay).await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(SessionError::Connection("transport closed".to_string()));
            }

            let stream = match self.open_socket().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    continue;
                }
            };
            let done = self.attach(stream).await;

            if self.config.api_token.is_empty() {
                return Ok(done);
            }
            match self.authorize().await {
                Ok(_) => return Ok(done),
                Err(SessionError::Protocol(e))
                    if e.class() == ProtocolErrorClass::InvalidCredential =>
                {
                    error!("Re-authorization rejected: {}", e);
                    return Err(SessionError::Protocol(e));
                }
                Err(e) => {
                    warn!("Re-authorization failed: {}", e);
                    self.outbound.lock().await.take();
                }
            }
        }
        Err(SessionError::FatalDisconnect {
            attempts: policy.max_attempts,
        })
    }
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            debug!("Writer stopped: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn supervise(inner: Arc<Inner>, mut done: oneshot::Receiver<String>) {
    loop {
        let reason = (&mut done)
            .await
            .unwrap_or_else(|_| "reader stopped".to_string());
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let _ = inner.events.send(TransportEvent::Disconnected {
            reason: reason.clone(),
        });

        match inner.reconnect().await {
            Ok(next) => {
                done = next;
                info!("Session re-established");
                let _ = inner.events.send(TransportEvent::Reconnected);
            }
            Err(e) => {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                error!("Giving up on session: {}", e);
                *inner.state.write().await = ConnectionState::Failed;
                let attempts = match e {
                    SessionError::FatalDisconnect { attempts } => attempts,
                    _ => 0,
                };
                let _ = inner.events.send(TransportEvent::FatalDisconnect { attempts });
                break;
            }
        }
    }
}

async fn keepalive(inner: Arc<Inner>) {
    let period = inner.config.keepalive();
    if period.is_zero() {
        return;
    }
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        if *inner.state.read().await != ConnectionState::Ready {
            continue;
        }
        if let Err(e) = inner.call(Request::Ping, None).await {
            warn!("Keepalive ping failed: {}", e);
        }
    }
}
