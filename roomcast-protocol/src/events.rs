//! Media Event definitions and the wire codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::{PeerId, TrackId};

/// Failure to interpret or produce wire bytes. The engine logs and drops
/// malformed inbound events; it never terminates the connection over them.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed media event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Events sent from a client library to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Request admission to the session.
    #[serde(rename_all = "camelCase")]
    Join { metadata: Value },

    /// Leave the session voluntarily.
    Leave,

    /// Replace the peer's free-form metadata.
    #[serde(rename_all = "camelCase")]
    UpdatePeerMetadata { metadata: Value },

    /// Replace the metadata of one of the peer's own tracks.
    #[serde(rename_all = "camelCase")]
    UpdateTrackMetadata {
        track_id: TrackId,
        track_metadata: Value,
    },

    /// Ask that a specific simulcast encoding of a track be forwarded.
    #[serde(rename_all = "camelCase")]
    SelectEncoding {
        peer_id: PeerId,
        track_id: TrackId,
        encoding: String,
    },

    /// Opaque payload passed through to the peer's endpoint.
    Custom(Value),
}

impl ClientEvent {
    /// Deserialize an inbound Media Event from transport bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Serialize for transport. Client libraries use this; the engine only
    /// decodes inbound events.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Snapshot of an already-admitted peer, delivered to a newcomer inside
/// `peerAccepted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInRoom {
    pub id: PeerId,
    pub metadata: Value,
    pub track_id_to_metadata: HashMap<TrackId, Value>,
}

/// Events sent from the engine to client libraries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Admission granted; carries a snapshot of the other peers and their
    /// active tracks.
    #[serde(rename_all = "camelCase")]
    PeerAccepted {
        id: PeerId,
        peers_in_room: Vec<PeerInRoom>,
    },

    /// Admission refused, with optional application data.
    #[serde(rename_all = "camelCase")]
    PeerDenied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Another peer joined.
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer: PeerInRoom },

    /// A peer left voluntarily or was torn down.
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },

    /// A peer's metadata changed.
    #[serde(rename_all = "camelCase")]
    PeerUpdated { peer_id: PeerId, metadata: Value },

    /// The addressed peer was removed by the server.
    #[serde(rename_all = "camelCase")]
    PeerRemoved { peer_id: PeerId, reason: String },

    /// Tracks of a peer became available for subscription.
    #[serde(rename_all = "camelCase")]
    TracksAdded {
        peer_id: PeerId,
        track_id_to_metadata: HashMap<TrackId, Value>,
    },

    /// Tracks of a peer are gone.
    #[serde(rename_all = "camelCase")]
    TracksRemoved {
        peer_id: PeerId,
        track_ids: Vec<TrackId>,
    },

    /// Track metadata changed.
    #[serde(rename_all = "camelCase")]
    TrackUpdated {
        peer_id: PeerId,
        track_id: TrackId,
        metadata: Value,
    },

    /// Priority ordering of tracks under bandwidth pressure. Originated by
    /// an external display-manager policy, not by the engine itself.
    #[serde(rename_all = "camelCase")]
    TracksPriority { tracks: Vec<TrackId> },

    /// The forwarded simulcast encoding of a track changed for the
    /// addressed receiver.
    #[serde(rename_all = "camelCase")]
    EncodingSwitched {
        peer_id: PeerId,
        track_id: TrackId,
        encoding: String,
    },

    /// Opaque payload from an endpoint to its peer.
    Custom(Value),
}

impl ServerEvent {
    /// Serialize for transport. Observers receive the resulting bytes ready
    /// to hand to the wire.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize an outbound Media Event. Client libraries use this; it is
    /// also handy in tests.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_join_with_metadata() {
        let raw = br#"{"type":"join","data":{"metadata":{"name":"Bob"}}}"#;
        let event = ClientEvent::decode(raw).unwrap();
        match event {
            ClientEvent::Join { metadata } => {
                assert_eq!(metadata, json!({"name": "Bob"}));
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn decodes_leave_without_data() {
        let event = ClientEvent::decode(br#"{"type":"leave"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Leave));
    }

    #[test]
    fn decodes_select_encoding() {
        let raw = br#"{"type":"selectEncoding","data":{"peerId":"p1","trackId":"t1","encoding":"m"}}"#;
        match ClientEvent::decode(raw).unwrap() {
            ClientEvent::SelectEncoding {
                peer_id,
                track_id,
                encoding,
            } => {
                assert_eq!(peer_id.as_str(), "p1");
                assert_eq!(track_id.as_str(), "t1");
                assert_eq!(encoding, "m");
            }
            other => panic!("expected selectEncoding, got {other:?}"),
        }
    }

    #[test]
    fn custom_payload_round_trips_untouched() {
        let raw = br#"{"type":"custom","data":{"sdp":"v=0","anything":[1,2,3]}}"#;
        let event = ClientEvent::decode(raw).unwrap();
        let ClientEvent::Custom(value) = &event else {
            panic!("expected custom");
        };
        assert_eq!(value["sdp"], "v=0");
        let encoded = event.encode().unwrap();
        let reparsed: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(reparsed["type"], "custom");
        assert_eq!(reparsed["data"]["anything"], json!([1, 2, 3]));
    }

    #[test]
    fn rejects_unknown_type_and_garbage() {
        assert!(ClientEvent::decode(br#"{"type":"teleport","data":{}}"#).is_err());
        assert!(ClientEvent::decode(b"not json at all").is_err());
    }

    #[test]
    fn peer_accepted_wire_shape() {
        let event = ServerEvent::PeerAccepted {
            id: PeerId::from("p2"),
            peers_in_room: vec![PeerInRoom {
                id: PeerId::from("p1"),
                metadata: json!({"name": "Alice"}),
                track_id_to_metadata: HashMap::from([(
                    TrackId::from("t1"),
                    json!({"kind": "camera"}),
                )]),
            }],
        };
        let wire: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(wire["type"], "peerAccepted");
        assert_eq!(wire["data"]["id"], "p2");
        assert_eq!(wire["data"]["peersInRoom"][0]["id"], "p1");
        assert_eq!(
            wire["data"]["peersInRoom"][0]["trackIdToMetadata"]["t1"]["kind"],
            "camera"
        );
    }

    #[test]
    fn tracks_added_wire_shape() {
        let event = ServerEvent::TracksAdded {
            peer_id: PeerId::from("p1"),
            track_id_to_metadata: HashMap::from([(TrackId::from("t1"), json!(null))]),
        };
        let wire: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(wire["type"], "tracksAdded");
        assert_eq!(wire["data"]["peerId"], "p1");
        assert!(wire["data"]["trackIdToMetadata"]
            .as_object()
            .unwrap()
            .contains_key("t1"));
    }

    #[test]
    fn encoding_switched_wire_shape() {
        let event = ServerEvent::EncodingSwitched {
            peer_id: PeerId::from("p1"),
            track_id: TrackId::from("t2"),
            encoding: "m".to_string(),
        };
        let wire: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(wire["type"], "encodingSwitched");
        assert_eq!(wire["data"]["peerId"], "p1");
        assert_eq!(wire["data"]["trackId"], "t2");
        assert_eq!(wire["data"]["encoding"], "m");
    }

    #[test]
    fn peer_denied_omits_empty_data() {
        let wire: Value =
            serde_json::from_slice(&ServerEvent::PeerDenied { data: None }.encode().unwrap())
                .unwrap();
        assert_eq!(wire["type"], "peerDenied");
        assert!(wire["data"].as_object().map_or(true, |o| o.is_empty()));

        let with_data = ServerEvent::PeerDenied {
            data: Some(json!({"reason": "full"})),
        };
        let wire: Value = serde_json::from_slice(&with_data.encode().unwrap()).unwrap();
        assert_eq!(wire["data"]["reason"], "full");
    }
}
