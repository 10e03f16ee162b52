//! Frames exchanged between a WebSocket client and the relay.
//!
//! Every frame travels inside an [`Envelope`]. Client requests use the
//! envelope's `seq` as a request id; the relay echoes it back in the
//! `request` field of the matching reply, which lets one socket carry many
//! concurrent requests.
//!
//! ```text
//! client ── Envelope{seq: 7, Subscribe{..}} ──────────────▶ relay
//! client ◀──────────── Envelope{Subscribed{request: 7, ..}} relay
//! client ◀──────────── Envelope{Event{subscription, event}} relay
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ClientId, ConnectionId, SpaceEvent, SpaceId, SpaceMember, SubscriptionId,
    Topic,
};

/// The current protocol version. Clients send it in
/// [`ClientFrame::Authenticate`] and the relay rejects a mismatch.
pub const PROTOCOL_VERSION: u32 = 1;

/// The top-level wrapper around every frame on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    /// Per-sender sequence number. For client frames this is the request id.
    pub seq: u64,

    /// Unix milliseconds at send time.
    pub timestamp: u64,

    /// The frame itself.
    pub payload: P,
}

/// Client → relay.
///
/// `#[serde(tag = "type")]` produces internally tagged JSON:
/// `{ "type": "Enter", "space": "workspace:w1", "profileData": null }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// First frame on every socket. `token` is a credential issued by the
    /// relay's token issuer.
    Authenticate { version: u32, token: String },

    /// Enter a Space as this connection.
    Enter {
        space: SpaceId,
        profile_data: Option<Value>,
    },

    /// Leave a Space.
    Leave { space: SpaceId },

    /// Re-publish this connection's profile data inside a Space.
    UpdateProfile {
        space: SpaceId,
        profile_data: Option<Value>,
    },

    /// Ask for the full member snapshot of a Space.
    Members { space: SpaceId },

    /// Ask for this connection's own member record in a Space.
    SelfMember { space: SpaceId },

    /// Start receiving events of one topic.
    Subscribe { space: SpaceId, topic: Topic },

    /// Stop one subscription.
    Unsubscribe {
        space: SpaceId,
        subscription: SubscriptionId,
    },

    /// Publish this connection's location. The payload is opaque here.
    SetLocation { space: SpaceId, location: Value },

    /// Polite goodbye before closing the socket.
    Disconnect,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    /// Reply to `Authenticate`: who the relay thinks we are.
    Authenticated {
        client_id: ClientId,
        connection_id: ConnectionId,
    },

    /// Reply to `Authenticate` when the token or version was refused.
    /// The relay closes the socket after sending it.
    Rejected { reason: String },

    /// Generic success reply.
    Ack { request: u64 },

    /// Reply to `Members`.
    Members {
        request: u64,
        members: Vec<SpaceMember>,
    },

    /// Reply to `SelfMember`.
    SelfMember {
        request: u64,
        member: Option<SpaceMember>,
    },

    /// Reply to `Subscribe`.
    Subscribed {
        request: u64,
        subscription: SubscriptionId,
    },

    /// A request failed. `code` follows HTTP conventions.
    Error {
        request: u64,
        code: u16,
        message: String,
    },

    /// An event delivered on a subscription.
    Event {
        subscription: SubscriptionId,
        event: SpaceEvent,
    },
}

impl RelayFrame {
    /// The request id this frame answers, if it is a reply.
    pub fn request(&self) -> Option<u64> {
        match self {
            Self::Ack { request }
            | Self::Members { request, .. }
            | Self::SelfMember { request, .. }
            | Self::Subscribed { request, .. }
            | Self::Error { request, .. } => Some(*request),
            Self::Authenticated { .. }
            | Self::Rejected { .. }
            | Self::Event { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventName, LastEvent};

    fn space() -> SpaceId {
        SpaceId::database("w1", "d1").unwrap()
    }

    #[test]
    fn test_client_frame_enter_json_format() {
        let frame = ClientFrame::Enter {
            space: space(),
            profile_data: Some(serde_json::json!({ "name": "Ada" })),
        };
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "Enter");
        assert_eq!(json["space"], "workspace:w1|database:d1");
        assert_eq!(json["profileData"]["name"], "Ada");
    }

    #[test]
    fn test_client_frame_subscribe_json_format() {
        let frame = ClientFrame::Subscribe {
            space: space(),
            topic: Topic::Locations,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "Subscribe");
        assert_eq!(json["topic"], "locations");
    }

    #[test]
    fn test_relay_frame_event_json_format() {
        let frame = RelayFrame::Event {
            subscription: SubscriptionId(9),
            event: SpaceEvent::Member(SpaceMember {
                client_id: ClientId::new("u1"),
                connection_id: ConnectionId::new("c1"),
                profile_data: None,
                is_connected: true,
                location: None,
                last_event: LastEvent {
                    name: EventName::Enter,
                    timestamp: 1,
                },
            }),
        };
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "Event");
        assert_eq!(json["subscription"], 9);
        assert_eq!(json["event"]["kind"], "member");
    }

    #[test]
    fn test_relay_frame_request_only_for_replies() {
        assert_eq!(RelayFrame::Ack { request: 4 }.request(), Some(4));
        assert_eq!(
            RelayFrame::Error {
                request: 5,
                code: 404,
                message: "no".into()
            }
            .request(),
            Some(5)
        );
        assert_eq!(
            RelayFrame::Rejected {
                reason: "bad token".into()
            }
            .request(),
            None
        );
    }

    #[test]
    fn test_decode_unknown_frame_type_returns_error() {
        let unknown = r#"{"type": "FlyToMoon", "speed": 9000}"#;
        let result: Result<ClientFrame, _> = serde_json::from_str(unknown);
        assert!(result.is_err());
    }

    #[test]
    fn test_envelope_carries_seq_and_payload() {
        let json = r#"{
            "seq": 12,
            "timestamp": 100,
            "payload": { "type": "Disconnect" }
        }"#;
        let envelope: Envelope<ClientFrame> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.seq, 12);
        assert_eq!(envelope.payload, ClientFrame::Disconnect);
    }
}
