//! Per-connection handler: authentication and frame routing.
//!
//! Each accepted socket gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive `Authenticate` → check version and token
//!   2. Open a hub connection → send `Authenticated`
//!   3. Loop: receive client frames → apply them to the hub → reply, and
//!      relay hub deliveries as `Event` frames
//!
//! Every subscription of the connection delivers into one sink, drained
//! by the same task that handles client frames. Replies and events then
//! share one outbound queue drained by a writer task. So events reach the
//! client in hub order across topics, and a `Subscribed` reply always
//! precedes the first event of that subscription.

use std::collections::HashMap;
use std::sync::Arc;

use tether_protocol::{
    ClientFrame, Codec, ConnectionId, Envelope, JsonCodec, MemberKey,
    PROTOCOL_VERSION, ProtocolError, RelayFrame, SpaceId, SubscriptionId,
    unix_millis,
};
use tether_transport::{Delivery, EventSink, Hub, WebSocketPeer};
use tokio::sync::mpsc;

use crate::TetherError;
use crate::server::RelayState;

/// Drops a connection from the hub when the handler exits.
///
/// The hub then publishes a `leave` for every Space the connection was
/// still in and forgets its subscriptions.
struct ConnectionGuard {
    connection_id: ConnectionId,
    hub: Hub,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.disconnect(&self.connection_id);
    }
}

/// Handles a single socket from accept to close.
pub(crate) async fn handle_connection(
    peer: WebSocketPeer,
    state: Arc<RelayState>,
) -> Result<(), TetherError> {
    let peer = Arc::new(peer);
    let peer_id = peer.id();
    tracing::debug!(%peer_id, addr = %peer.addr(), "handling new connection");

    let key = authenticate(&peer, &state).await?;
    tracing::info!(%peer_id, client_id = %key.client_id, connection_id = %key.connection_id, "client authenticated");

    let guard = ConnectionGuard {
        connection_id: key.connection_id.clone(),
        hub: state.hub.clone(),
    };

    let (outbound, frames) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(Arc::clone(&peer), state.codec, frames));
    let (sink, mut deliveries) = mpsc::unbounded_channel();

    let mut session = RelaySession {
        key,
        hub: state.hub.clone(),
        outbound,
        sink,
        subscriptions: HashMap::new(),
    };

    loop {
        tokio::select! {
            received = peer.recv() => {
                let data = match received {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        tracing::info!(%peer_id, "connection closed cleanly");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%peer_id, error = %e, "recv error");
                        break;
                    }
                };

                let envelope: Envelope<ClientFrame> = match state.codec.decode(&data) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::debug!(%peer_id, error = %e, "failed to decode frame");
                        continue;
                    }
                };

                if session.handle(envelope.seq, envelope.payload) {
                    tracing::info!(%peer_id, "client disconnected");
                    break;
                }
            }
            Some(delivery) = deliveries.recv() => session.forward(delivery),
        }
    }

    drop(guard);
    drop(session);
    writer.abort();
    let _ = peer.close().await;
    Ok(())
}

/// Receives `Authenticate`, validates it, and registers the connection
/// with the hub.
async fn authenticate(
    peer: &WebSocketPeer,
    state: &RelayState,
) -> Result<MemberKey, TetherError> {
    let data = match tokio::time::timeout(state.config.auth_timeout, peer.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(invalid("connection closed before authentication"));
        }
        Ok(Err(e)) => return Err(TetherError::Transport(e)),
        Err(_) => return Err(invalid("authentication timed out")),
    };

    let envelope: Envelope<ClientFrame> = state.codec.decode(&data)?;

    let (version, token) = match envelope.payload {
        ClientFrame::Authenticate { version, token } => (version, token),
        _ => {
            reject(peer, &state.codec, "expected Authenticate").await?;
            return Err(invalid("first frame must be Authenticate"));
        }
    };

    if version != PROTOCOL_VERSION {
        reject(
            peer,
            &state.codec,
            &format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}"),
        )
        .await?;
        return Err(invalid("protocol version mismatch"));
    }

    let validated = state.issuer.lock().await.validate(&token);
    let client_id = match validated {
        Ok(client_id) => client_id,
        Err(e) => {
            reject(peer, &state.codec, &e.to_string()).await?;
            return Err(TetherError::Auth(e));
        }
    };

    let key = state.hub.open_connection(client_id);
    let reply = RelayFrame::Authenticated {
        client_id: key.client_id.clone(),
        connection_id: key.connection_id.clone(),
    };
    peer.send(encode_text(&state.codec, 0, &reply)?).await?;

    Ok(key)
}

/// Sends `Rejected`. The caller then drops the socket.
async fn reject(
    peer: &WebSocketPeer,
    codec: &JsonCodec,
    reason: &str,
) -> Result<(), TetherError> {
    tracing::debug!(peer_id = %peer.id(), reason, "authentication rejected");
    let frame = RelayFrame::Rejected {
        reason: reason.to_string(),
    };
    peer.send(encode_text(codec, 0, &frame)?).await?;
    Ok(())
}

fn invalid(message: &str) -> TetherError {
    TetherError::Protocol(ProtocolError::InvalidMessage(message.to_string()))
}

fn encode_text(
    codec: &JsonCodec,
    seq: u64,
    frame: &RelayFrame,
) -> Result<String, TetherError> {
    let envelope = Envelope {
        seq,
        timestamp: unix_millis(),
        payload: frame,
    };
    let bytes = codec.encode(&envelope)?;
    String::from_utf8(bytes)
        .map_err(|e| TetherError::Protocol(ProtocolError::InvalidMessage(e.to_string())))
}

/// Drains the outbound queue onto the socket.
async fn write_frames(
    peer: Arc<WebSocketPeer>,
    codec: JsonCodec,
    mut frames: mpsc::UnboundedReceiver<RelayFrame>,
) {
    let mut seq: u64 = 1;
    while let Some(frame) = frames.recv().await {
        let text = match encode_text(&codec, next_seq(&mut seq), &frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(peer_id = %peer.id(), error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = peer.send(text).await {
            tracing::debug!(peer_id = %peer.id(), error = %e, "send failed, writer stopping");
            break;
        }
    }
}

/// Increments and returns the next sequence number.
fn next_seq(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}

/// One authenticated connection's view of the hub.
struct RelaySession {
    key: MemberKey,
    hub: Hub,
    outbound: mpsc::UnboundedSender<RelayFrame>,
    /// Shared by every subscription of this connection.
    sink: EventSink,
    /// Subscriptions this connection opened, and the Space each is on.
    subscriptions: HashMap<SubscriptionId, SpaceId>,
}

impl RelaySession {
    /// Applies one client frame. Returns `true` if the connection should
    /// close.
    fn handle(&mut self, request: u64, frame: ClientFrame) -> bool {
        let reply = match frame {
            ClientFrame::Disconnect => return true,

            ClientFrame::Authenticate { .. } => error(request, 400, "already authenticated"),

            ClientFrame::Enter {
                space,
                profile_data,
            } => {
                self.hub.enter(&space, &self.key, profile_data);
                RelayFrame::Ack { request }
            }

            ClientFrame::Leave { space } => {
                self.hub.leave(&space, &self.key);
                RelayFrame::Ack { request }
            }

            ClientFrame::UpdateProfile {
                space,
                profile_data,
            } => match self.hub.update_profile(&space, &self.key, profile_data) {
                Ok(_) => RelayFrame::Ack { request },
                Err(e) => error(request, 404, &e.to_string()),
            },

            ClientFrame::Members { space } => RelayFrame::Members {
                request,
                members: self.hub.members(&space),
            },

            ClientFrame::SelfMember { space } => RelayFrame::SelfMember {
                request,
                member: self.hub.member(&space, &self.key),
            },

            ClientFrame::Subscribe { space, topic } => {
                let subscription = self.hub.subscribe(
                    &space,
                    topic,
                    &self.key.connection_id,
                    self.sink.clone(),
                );
                self.subscriptions.insert(subscription.id, space);
                RelayFrame::Subscribed {
                    request,
                    subscription: subscription.id,
                }
            }

            ClientFrame::Unsubscribe {
                space,
                subscription,
            } => {
                if self.subscriptions.get(&subscription) == Some(&space) {
                    self.subscriptions.remove(&subscription);
                    self.hub.unsubscribe(&space, subscription);
                    RelayFrame::Ack { request }
                } else {
                    error(request, 404, &format!("unknown subscription {subscription}"))
                }
            }

            ClientFrame::SetLocation { space, location } => {
                match self.hub.set_location(&space, &self.key, location) {
                    Ok(()) => RelayFrame::Ack { request },
                    Err(e) => error(request, 404, &e.to_string()),
                }
            }
        };

        self.send(reply);
        false
    }

    fn send(&self, frame: RelayFrame) {
        if self.outbound.send(frame).is_err() {
            tracing::debug!(member = %self.key, "writer gone, frame dropped");
        }
    }

    /// Queues one hub delivery as an `Event` frame. Deliveries for a
    /// subscription this session already dropped are discarded.
    fn forward(&self, delivery: Delivery) {
        let Delivery {
            subscription,
            event,
        } = delivery;
        if !self.subscriptions.contains_key(&subscription) {
            tracing::trace!(member = %self.key, %subscription, "delivery after unsubscribe dropped");
            return;
        }
        self.send(RelayFrame::Event {
            subscription,
            event,
        });
    }
}

fn error(request: u64, code: u16, message: &str) -> RelayFrame {
    RelayFrame::Error {
        request,
        code,
        message: message.to_string(),
    }
}
