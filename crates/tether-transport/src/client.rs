//! Client side of the WebSocket transport: a [`Realtime`] implementation
//! that speaks the relay frame protocol.
//!
//! One socket carries every Space. Requests are matched to replies by the
//! envelope `seq`; subscription events are routed by subscription id.
//!
//! ```text
//!             ┌──────── outbound (mpsc) ────────┐
//! request() ──┤                                  ├─▶ writer task ─▶ socket
//!             └─ pending[seq] = oneshot          │
//! socket ─▶ reader task ─┬─ reply  ─▶ pending[request]
//!                        └─ Event  ─▶ subscriptions[id] (an EventSink)
//! ```
//!
//! The reader flips the link's `down` flag when the socket ends, which is
//! what [`Realtime::closed`] waits on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tether_auth::{AuthError, TokenProvider};
use tether_protocol::{
    ClientFrame, Codec, Envelope, JsonCodec, MemberKey, PROTOCOL_VERSION,
    ProtocolError, RelayFrame, SpaceId, SpaceMember, SubscriptionId, Topic,
    unix_millis,
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::{Delivery, EventSink, Realtime, RealtimeSpace, Subscription, TransportError};

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

/// How [`WebSocketRealtime::connect`] retries a failed attempt.
///
/// Every failure is retried, including a refused credential: the token
/// provider is asked again on each attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts in total, including the first. At least one is always made.
    ///
    /// Default: 5.
    pub max_attempts: u32,

    /// Wait after the first failure.
    ///
    /// Default: 200 ms.
    pub initial_backoff: Duration,

    /// Upper bound for the doubling backoff.
    ///
    /// Default: 5 s.
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The wait after failed attempt number `attempt` (1-based):
    /// `initial_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Link: one authenticated socket
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, oneshot::Sender<RelayFrame>>,
    /// Subscribe requests in flight, keyed by request seq. Moved into
    /// `subscriptions` by the reader when `Subscribed` arrives, before the
    /// reply is handed back, so no event can slip past.
    pending_subscriptions: HashMap<u64, EventSink>,
    subscriptions: HashMap<SubscriptionId, EventSink>,
    closed: bool,
}

impl Routes {
    /// Fails everything outstanding. Dropping the senders wakes every
    /// waiter and releases every subscription sink.
    fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.pending_subscriptions.clear();
        self.subscriptions.clear();
    }

    fn dispatch(&mut self, frame: RelayFrame) {
        match frame {
            RelayFrame::Event {
                subscription,
                event,
            } => {
                let delivered = self.subscriptions.get(&subscription).is_some_and(|sink| {
                    sink.send(Delivery {
                        subscription,
                        event,
                    })
                    .is_ok()
                });
                if !delivered {
                    self.subscriptions.remove(&subscription);
                    tracing::debug!(%subscription, "event for unknown subscription dropped");
                }
            }
            reply => {
                let Some(request) = reply.request() else {
                    tracing::debug!(?reply, "unexpected relay frame ignored");
                    return;
                };
                let sink = self.pending_subscriptions.remove(&request);
                if let (RelayFrame::Subscribed { subscription, .. }, Some(sink)) =
                    (&reply, sink)
                {
                    self.subscriptions.insert(*subscription, sink);
                }
                match self.pending.remove(&request) {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => {
                        tracing::debug!(request, "reply to abandoned request dropped");
                    }
                }
            }
        }
    }
}

struct Link {
    key: MemberKey,
    outbound: mpsc::UnboundedSender<Message>,
    routes: Arc<StdMutex<Routes>>,
    next_seq: AtomicU64,
    reader: JoinHandle<()>,
    /// Turns `true` once the reader has stopped. A dropped sender means
    /// the same.
    down: watch::Receiver<bool>,
    codec: JsonCodec,
    request_timeout: Duration,
}

impl Link {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        lock_routes(&self.routes)
    }

    fn is_alive(&self) -> bool {
        !*self.down.borrow() && !self.routes().closed && !self.outbound.is_closed()
    }

    /// Resolves once the reader has stopped.
    async fn wait_down(&self) {
        let mut down = self.down.clone();
        let _ = down.wait_for(|down| *down).await;
    }

    /// Sends `frame` and waits for the matching reply.
    ///
    /// `sink`, if given, receives the events of the subscription a
    /// `Subscribe` request creates.
    async fn request(
        &self,
        frame: ClientFrame,
        sink: Option<EventSink>,
    ) -> Result<RelayFrame, TransportError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let text = encode_text(&self.codec, seq, &frame)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes();
            if routes.closed {
                return Err(TransportError::ConnectionClosed(
                    "link is closed".into(),
                ));
            }
            routes.pending.insert(seq, tx);
            if let Some(sink) = sink {
                routes.pending_subscriptions.insert(seq, sink);
            }
        }

        if self.outbound.send(Message::Text(text.into())).is_err() {
            self.forget(seq);
            return Err(TransportError::ConnectionClosed(
                "writer task is gone".into(),
            ));
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(TransportError::ConnectionClosed(
                    "socket closed before the reply arrived".into(),
                ));
            }
            Err(_) => {
                self.forget(seq);
                return Err(TransportError::Timeout);
            }
        };

        match reply {
            RelayFrame::Error { code, message, .. } => {
                Err(TransportError::Rejected { code, message })
            }
            reply => Ok(reply),
        }
    }

    fn forget(&self, seq: u64) {
        let mut routes = self.routes();
        routes.pending.remove(&seq);
        routes.pending_subscriptions.remove(&seq);
    }

    /// Says goodbye and stops both tasks.
    fn shutdown(&self) {
        self.routes().close();
        if let Ok(text) = encode_text(&self.codec, 0, &ClientFrame::Disconnect) {
            let _ = self.outbound.send(Message::Text(text.into()));
        }
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock_routes(routes: &StdMutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode_text(
    codec: &JsonCodec,
    seq: u64,
    frame: &ClientFrame,
) -> Result<String, TransportError> {
    let envelope = Envelope {
        seq,
        timestamp: unix_millis(),
        payload: frame,
    };
    let bytes = codec.encode(&envelope)?;
    String::from_utf8(bytes).map_err(|e| {
        TransportError::Protocol(ProtocolError::InvalidMessage(e.to_string()))
    })
}

fn decode_frame(
    codec: &JsonCodec,
    message: Message,
) -> Option<Result<RelayFrame, ProtocolError>> {
    let bytes: Vec<u8> = match message {
        Message::Text(text) => text.as_bytes().to_vec(),
        Message::Binary(data) => data.into(),
        _ => return None,
    };
    Some(
        codec
            .decode::<Envelope<RelayFrame>>(&bytes)
            .map(|envelope| envelope.payload),
    )
}

/// Reads frames until the relay answers `Authenticate`.
async fn await_authenticated<S>(
    stream: &mut S,
    codec: &JsonCodec,
) -> Result<MemberKey, TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| {
            TransportError::ReceiveFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                e,
            ))
        })?;
        let Some(frame) = decode_frame(codec, message) else {
            continue;
        };
        return match frame? {
            RelayFrame::Authenticated {
                client_id,
                connection_id,
            } => Ok(MemberKey {
                client_id,
                connection_id,
            }),
            RelayFrame::Rejected { reason } => {
                Err(TransportError::Auth(AuthError::Rejected(reason)))
            }
            other => Err(unexpected("Authenticated", &other)),
        };
    }
    Err(TransportError::ConnectionClosed(
        "relay closed during authentication".into(),
    ))
}

// ---------------------------------------------------------------------------
// WebSocketRealtime
// ---------------------------------------------------------------------------

/// A [`Realtime`] client for a Tether relay.
///
/// ```rust,no_run
/// use tether_transport::{ReconnectPolicy, WebSocketRealtime};
/// use std::time::Duration;
///
/// let realtime = WebSocketRealtime::new("ws://127.0.0.1:9400")
///     .with_policy(ReconnectPolicy::none())
///     .with_request_timeout(Duration::from_secs(2));
/// # let _ = realtime;
/// ```
#[derive(Clone)]
pub struct WebSocketRealtime {
    url: String,
    policy: ReconnectPolicy,
    request_timeout: Duration,
    codec: JsonCodec,
    link: Arc<StdMutex<Option<Arc<Link>>>>,
    /// Serializes connect attempts. The slot itself is only held briefly.
    connecting: Arc<Mutex<()>>,
}

impl WebSocketRealtime {
    /// A client for the relay at `url` (`ws://host:port`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            policy: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(10),
            codec: JsonCodec,
            link: Arc::new(StdMutex::new(None)),
            connecting: Arc::new(Mutex::new(())),
        }
    }

    /// Replaces the retry policy used by `connect`.
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long any single request waits for its reply.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Link>>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_link(&self) -> Result<Arc<Link>, TransportError> {
        self.slot()
            .as_ref()
            .filter(|link| link.is_alive())
            .cloned()
            .ok_or(TransportError::NotConnected)
    }

    /// One connection attempt: fetch a token, open the socket,
    /// authenticate, start the reader and writer tasks.
    async fn open_link<T: TokenProvider>(
        &self,
        tokens: &T,
    ) -> Result<Link, TransportError> {
        let credential = tokens.request_token().await?;

        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let hello = encode_text(
            &self.codec,
            0,
            &ClientFrame::Authenticate {
                version: PROTOCOL_VERSION,
                token: credential.token,
            },
        )?;
        sink.send(Message::Text(hello.into())).await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })?;

        let key = tokio::time::timeout(
            self.request_timeout,
            await_authenticated(&mut stream, &self.codec),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let routes = Arc::new(StdMutex::new(Routes::default()));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (down_tx, down) = watch::channel(false);

        // Writer: drains the outbound queue. A Close message is the last
        // thing it sends.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(error = %e, "relay socket write failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn({
            let routes = Arc::clone(&routes);
            let codec = self.codec;
            async move {
                while let Some(message) = stream.next().await {
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(error = %e, "relay socket read failed");
                            break;
                        }
                    };
                    match decode_frame(&codec, message) {
                        Some(Ok(frame)) => lock_routes(&routes).dispatch(frame),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "undecodable relay frame");
                        }
                        None => {}
                    }
                }
                tracing::info!("relay socket closed");
                lock_routes(&routes).close();
                down_tx.send_replace(true);
            }
        });

        Ok(Link {
            key,
            outbound,
            routes,
            next_seq: AtomicU64::new(1),
            reader,
            down,
            codec: self.codec,
            request_timeout: self.request_timeout,
        })
    }
}

impl std::fmt::Debug for WebSocketRealtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRealtime")
            .field("url", &self.url)
            .field("policy", &self.policy)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Realtime for WebSocketRealtime {
    type Space = WebSocketSpace;

    /// Connects, retrying every failure per the [`ReconnectPolicy`]. The
    /// last error is returned once attempts are exhausted.
    async fn connect<T: TokenProvider>(
        &self,
        tokens: &T,
    ) -> Result<MemberKey, TransportError> {
        let _connecting = self.connecting.lock().await;
        if let Ok(link) = self.current_link() {
            return Ok(link.key.clone());
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open_link(tokens).await {
                Ok(link) => {
                    let key = link.key.clone();
                    tracing::info!(url = %self.url, member = %key, attempt, "relay link established");
                    *self.slot() = Some(Arc::new(link));
                    return Ok(key);
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::warn!(url = %self.url, error = %e, attempt, "giving up on relay");
                    return Err(e);
                }
                Err(e) => {
                    let wait = self.policy.backoff(attempt);
                    tracing::warn!(
                        url = %self.url,
                        error = %e,
                        attempt,
                        backoff = ?wait,
                        "relay connect failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn space(&self, id: &SpaceId) -> Result<WebSocketSpace, TransportError> {
        self.current_link()?;
        Ok(WebSocketSpace {
            id: id.clone(),
            realtime: self.clone(),
        })
    }

    fn is_connected(&self) -> bool {
        self.current_link().is_ok()
    }

    async fn closed(&self) {
        let link = self.slot().clone();
        if let Some(link) = link {
            link.wait_down().await;
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _connecting = self.connecting.lock().await;
        let link = self.slot().take();
        if let Some(link) = link {
            link.shutdown();
            tracing::info!(url = %self.url, "relay link closed");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebSocketSpace
// ---------------------------------------------------------------------------

/// One Space reached through a [`WebSocketRealtime`].
///
/// Every call goes over whatever link is current, so a handle survives a
/// reconnect (its subscriptions do not).
#[derive(Debug, Clone)]
pub struct WebSocketSpace {
    id: SpaceId,
    realtime: WebSocketRealtime,
}

impl WebSocketSpace {
    async fn call(&self, frame: ClientFrame) -> Result<RelayFrame, TransportError> {
        let link = self.realtime.current_link()?;
        link.request(frame, None).await
    }

    async fn ack(&self, frame: ClientFrame) -> Result<(), TransportError> {
        match self.call(frame).await? {
            RelayFrame::Ack { .. } => Ok(()),
            other => Err(unexpected("Ack", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &RelayFrame) -> TransportError {
    TransportError::Protocol(ProtocolError::InvalidMessage(format!(
        "expected {expected}, got {got:?}"
    )))
}

impl RealtimeSpace for WebSocketSpace {
    fn id(&self) -> &SpaceId {
        &self.id
    }

    async fn enter(&self, profile_data: Option<Value>) -> Result<(), TransportError> {
        self.ack(ClientFrame::Enter {
            space: self.id.clone(),
            profile_data,
        })
        .await
    }

    async fn leave(&self) -> Result<(), TransportError> {
        self.ack(ClientFrame::Leave {
            space: self.id.clone(),
        })
        .await
    }

    async fn update_profile(
        &self,
        profile_data: Option<Value>,
    ) -> Result<(), TransportError> {
        self.ack(ClientFrame::UpdateProfile {
            space: self.id.clone(),
            profile_data,
        })
        .await
    }

    async fn members(&self) -> Result<Vec<SpaceMember>, TransportError> {
        match self
            .call(ClientFrame::Members {
                space: self.id.clone(),
            })
            .await?
        {
            RelayFrame::Members { members, .. } => Ok(members),
            other => Err(unexpected("Members", &other)),
        }
    }

    async fn self_member(&self) -> Result<Option<SpaceMember>, TransportError> {
        match self
            .call(ClientFrame::SelfMember {
                space: self.id.clone(),
            })
            .await?
        {
            RelayFrame::SelfMember { member, .. } => Ok(member),
            other => Err(unexpected("SelfMember", &other)),
        }
    }

    async fn subscribe(
        &self,
        topic: Topic,
        sink: EventSink,
    ) -> Result<Subscription, TransportError> {
        let link = self.realtime.current_link()?;
        let frame = ClientFrame::Subscribe {
            space: self.id.clone(),
            topic,
        };
        match link.request(frame, Some(sink)).await? {
            RelayFrame::Subscribed { subscription, .. } => Ok(Subscription {
                id: subscription,
                topic,
            }),
            other => Err(unexpected("Subscribed", &other)),
        }
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let link = self.realtime.current_link()?;
        link.routes().subscriptions.remove(&id);
        let frame = ClientFrame::Unsubscribe {
            space: self.id.clone(),
            subscription: id,
        };
        match link.request(frame, None).await? {
            RelayFrame::Ack { .. } => Ok(()),
            other => Err(unexpected("Ack", &other)),
        }
    }

    async fn set_location(&self, location: Value) -> Result<(), TransportError> {
        self.ack(ClientFrame::SetLocation {
            space: self.id.clone(),
            location,
        })
        .await
    }
}
