//! Session state store: the authoritative in-memory record of peers,
//! endpoints, tracks and subscriptions.
//!
//! All mutation happens on the engine actor; nothing here is shared or
//! locked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::warn;

use roomcast_protocol::{EndpointId, PeerId, PeerInRoom, TrackId, TrackKind};

use crate::endpoint::EndpointControl;
use crate::graph::tee::{MediaPayloadSender, RawDepayloader};

/// A delivery format a subscriber may request: the engine-side raw format
/// (depayloaded) or an opaque remote format understood by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryFormat {
    Raw,
    Remote(String),
}

/// Options of a subscribe call.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub default_simulcast_encoding: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Pending,
    Active,
}

/// An endpoint's desire to receive one track in one format.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub endpoint_id: EndpointId,
    pub track_id: TrackId,
    pub format: DeliveryFormat,
    pub opts: SubscribeOptions,
    pub status: SubscriptionStatus,
}

/// A subscription whose track is not ready yet, plus the staged branch
/// sender that will be linked into the tee at fulfillment.
pub struct PendingSubscription {
    pub subscription: Subscription,
    pub sender: MediaPayloadSender,
}

/// Track description supplied by the publishing endpoint.
#[derive(Debug, Clone)]
pub struct TrackInit {
    pub id: TrackId,
    pub kind: TrackKind,
    pub encoding: String,
    pub formats: Vec<DeliveryFormat>,
    pub simulcast_encodings: Option<Vec<String>>,
    pub metadata: Value,
}

/// Track description offered to subscribing endpoints.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: TrackId,
    pub owner: EndpointId,
    pub kind: TrackKind,
    pub encoding: String,
    pub formats: Vec<DeliveryFormat>,
    pub simulcast_encodings: Option<Vec<String>>,
    pub metadata: Value,
}

pub struct TrackRecord {
    pub id: TrackId,
    pub owner: EndpointId,
    pub kind: TrackKind,
    pub encoding: String,
    pub formats: Vec<DeliveryFormat>,
    pub simulcast_encodings: Option<Vec<String>>,
    pub active: bool,
    pub metadata: Value,
    pub depayloader: Option<Arc<dyn RawDepayloader>>,
}

impl TrackRecord {
    pub fn from_init(init: TrackInit, owner: EndpointId) -> Self {
        Self {
            id: init.id,
            owner,
            kind: init.kind,
            encoding: init.encoding,
            formats: init.formats,
            simulcast_encodings: init.simulcast_encodings,
            active: false,
            metadata: init.metadata,
            depayloader: None,
        }
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id.clone(),
            owner: self.owner.clone(),
            kind: self.kind,
            encoding: self.encoding.clone(),
            formats: self.formats.clone(),
            simulcast_encodings: self.simulcast_encodings.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn is_simulcast(&self) -> bool {
        self.simulcast_encodings.is_some()
    }

    pub fn accepts(&self, format: &DeliveryFormat) -> bool {
        self.formats.contains(format)
    }

    pub fn offers_encoding(&self, encoding: &str) -> bool {
        self.simulcast_encodings
            .as_ref()
            .map_or(false, |encodings| {
                encodings.iter().any(|e| e == encoding)
            })
    }
}

/// Peer admission input.
#[derive(Debug, Clone)]
pub struct PeerInit {
    pub id: PeerId,
    pub metadata: Value,
}

pub struct PeerRecord {
    pub id: PeerId,
    pub metadata: Value,
    pub joined_at: DateTime<Utc>,
    pub endpoint_id: Option<EndpointId>,
}

pub struct EndpointRecord {
    pub id: EndpointId,
    pub peer_id: Option<PeerId>,
    pub node: Option<String>,
    pub control_tx: mpsc::Sender<EndpointControl>,
    pub abort: AbortHandle,
    pub inbound_tracks: HashMap<TrackId, TrackRecord>,
    pub subscriptions: HashMap<TrackId, Subscription>,
}

/// Counts exposed by the stats RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub peers: usize,
    pub endpoints: usize,
    pub active_tracks: usize,
    pub active_subscriptions: usize,
    pub pending_subscriptions: usize,
}

pub struct SessionState {
    session_id: String,
    peers: HashMap<PeerId, PeerRecord>,
    endpoints: HashMap<EndpointId, EndpointRecord>,
    pending_subscriptions: Vec<PendingSubscription>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            peers: HashMap::new(),
            endpoints: HashMap::new(),
            pending_subscriptions: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Insert a peer. A duplicate id is a warned no-op.
    pub fn add_peer(&mut self, init: PeerInit) -> bool {
        if self.peers.contains_key(&init.id) {
            warn!(session = %self.session_id, peer_id = %init.id, "peer already present, ignoring add");
            return false;
        }
        self.peers.insert(
            init.id.clone(),
            PeerRecord {
                id: init.id,
                metadata: init.metadata,
                joined_at: Utc::now(),
                endpoint_id: None,
            },
        );
        true
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: &PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(id)
    }

    pub fn has_peer(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Remove a peer together with its attached endpoint (and therefore all
    /// of that endpoint's tracks) in one mutation.
    pub fn remove_peer(&mut self, id: &PeerId) -> Option<(PeerRecord, Option<EndpointRecord>)> {
        let peer = self.peers.remove(id)?;
        let endpoint = peer
            .endpoint_id
            .as_ref()
            .and_then(|eid| self.endpoints.remove(eid));
        Some((peer, endpoint))
    }

    /// Insert an endpoint and attach it to its peer. A duplicate endpoint id
    /// or an already-attached peer is a warned no-op.
    pub fn add_endpoint(&mut self, record: EndpointRecord) -> bool {
        if self.endpoints.contains_key(&record.id) {
            warn!(session = %self.session_id, endpoint_id = %record.id, "endpoint already present, ignoring add");
            return false;
        }
        if let Some(peer_id) = &record.peer_id {
            let Some(peer) = self.peers.get_mut(peer_id) else {
                warn!(session = %self.session_id, peer_id = %peer_id, "no such peer, dropping endpoint");
                return false;
            };
            if peer.endpoint_id.is_some() {
                warn!(session = %self.session_id, peer_id = %peer_id, "peer already has an endpoint, dropping add");
                return false;
            }
            peer.endpoint_id = Some(record.id.clone());
        }
        self.endpoints.insert(record.id.clone(), record);
        true
    }

    pub fn endpoint(&self, id: &EndpointId) -> Option<&EndpointRecord> {
        self.endpoints.get(id)
    }

    pub fn endpoint_mut(&mut self, id: &EndpointId) -> Option<&mut EndpointRecord> {
        self.endpoints.get_mut(id)
    }

    pub fn has_endpoint(&self, id: &EndpointId) -> bool {
        self.endpoints.contains_key(id)
    }

    /// Remove an endpoint record, detaching it from its peer.
    pub fn remove_endpoint(&mut self, id: &EndpointId) -> Option<EndpointRecord> {
        let record = self.endpoints.remove(id)?;
        if let Some(peer_id) = &record.peer_id {
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.endpoint_id = None;
            }
        }
        Some(record)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointRecord> {
        self.endpoints.values()
    }

    pub fn endpoints_mut(&mut self) -> impl Iterator<Item = &mut EndpointRecord> {
        self.endpoints.values_mut()
    }

    pub fn find_track(&self, id: &TrackId) -> Option<&TrackRecord> {
        self.endpoints
            .values()
            .find_map(|e| e.inbound_tracks.get(id))
    }

    pub fn find_track_mut(&mut self, id: &TrackId) -> Option<&mut TrackRecord> {
        self.endpoints
            .values_mut()
            .find_map(|e| e.inbound_tracks.get_mut(id))
    }

    /// Every active track in the session.
    pub fn active_tracks(&self) -> impl Iterator<Item = &TrackRecord> {
        self.endpoints
            .values()
            .flat_map(|e| e.inbound_tracks.values())
            .filter(|t| t.active)
    }

    /// Endpoints holding an active subscription to the given track.
    pub fn subscribers_of(&self, track_id: &TrackId) -> Vec<EndpointId> {
        self.endpoints
            .values()
            .filter(|e| e.subscriptions.contains_key(track_id))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Snapshot of every peer except `exclude`, with the metadata of their
    /// active tracks. Delivered to a newcomer inside `peerAccepted`.
    pub fn peers_snapshot(&self, exclude: &PeerId) -> Vec<PeerInRoom> {
        self.peers
            .values()
            .filter(|p| &p.id != exclude)
            .map(|p| {
                let track_id_to_metadata = p
                    .endpoint_id
                    .as_ref()
                    .and_then(|eid| self.endpoints.get(eid))
                    .map(|e| {
                        e.inbound_tracks
                            .values()
                            .filter(|t| t.active)
                            .map(|t| (t.id.clone(), t.metadata.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                PeerInRoom {
                    id: p.id.clone(),
                    metadata: p.metadata.clone(),
                    track_id_to_metadata,
                }
            })
            .collect()
    }

    pub fn push_pending(&mut self, pending: PendingSubscription) {
        self.pending_subscriptions.push(pending);
    }

    pub fn has_pending(&self, endpoint_id: &EndpointId, track_id: &TrackId) -> bool {
        self.pending_subscriptions.iter().any(|p| {
            &p.subscription.endpoint_id == endpoint_id && &p.subscription.track_id == track_id
        })
    }

    pub fn remove_pending(&mut self, endpoint_id: &EndpointId, track_id: &TrackId) {
        self.pending_subscriptions.retain(|p| {
            !(&p.subscription.endpoint_id == endpoint_id && &p.subscription.track_id == track_id)
        });
    }

    /// Remove and return every pending subscription targeting the track, in
    /// insertion order.
    pub fn take_pending_for_track(&mut self, track_id: &TrackId) -> Vec<PendingSubscription> {
        let all = std::mem::take(&mut self.pending_subscriptions);
        let (matching, rest) = all
            .into_iter()
            .partition(|p| &p.subscription.track_id == track_id);
        self.pending_subscriptions = rest;
        matching
    }

    /// Cancellation on endpoint removal: drop pending subscriptions the
    /// endpoint issued and those targeting its tracks.
    pub fn drop_pending_for_endpoint(&mut self, endpoint_id: &EndpointId, track_ids: &[TrackId]) {
        self.pending_subscriptions.retain(|p| {
            &p.subscription.endpoint_id != endpoint_id
                && !track_ids.contains(&p.subscription.track_id)
        });
    }

    pub fn drop_pending_for_tracks(&mut self, track_ids: &[TrackId]) {
        self.pending_subscriptions
            .retain(|p| !track_ids.contains(&p.subscription.track_id));
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            peers: self.peers.len(),
            endpoints: self.endpoints.len(),
            active_tracks: self.active_tracks().count(),
            active_subscriptions: self
                .endpoints
                .values()
                .map(|e| e.subscriptions.len())
                .sum(),
            pending_subscriptions: self.pending_subscriptions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer(id: &str) -> PeerInit {
        PeerInit {
            id: PeerId::from(id),
            metadata: json!({}),
        }
    }

    fn endpoint(id: &str, peer_id: Option<&str>) -> EndpointRecord {
        let (control_tx, _rx) = mpsc::channel(1);
        let abort = tokio::spawn(async {}).abort_handle();
        EndpointRecord {
            id: EndpointId::from(id),
            peer_id: peer_id.map(PeerId::from),
            node: None,
            control_tx,
            abort,
            inbound_tracks: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    fn track(id: &str, owner: &str) -> TrackRecord {
        TrackRecord::from_init(
            TrackInit {
                id: TrackId::from(id),
                kind: TrackKind::Audio,
                encoding: "opus".to_string(),
                formats: vec![DeliveryFormat::Raw],
                simulcast_encodings: None,
                metadata: json!(null),
            },
            EndpointId::from(owner),
        )
    }

    fn pending(endpoint_id: &str, track_id: &str) -> PendingSubscription {
        let (sender, _rx) = mpsc::channel(1);
        PendingSubscription {
            subscription: Subscription {
                endpoint_id: EndpointId::from(endpoint_id),
                track_id: TrackId::from(track_id),
                format: DeliveryFormat::Raw,
                opts: SubscribeOptions::default(),
                status: SubscriptionStatus::Pending,
            },
            sender,
        }
    }

    #[tokio::test]
    async fn duplicate_peer_add_is_a_noop() {
        let mut state = SessionState::new("s");
        assert!(state.add_peer(peer("p1")));
        assert!(!state.add_peer(PeerInit {
            id: PeerId::from("p1"),
            metadata: json!({"replaced": true}),
        }));
        assert_eq!(state.peer(&PeerId::from("p1")).unwrap().metadata, json!({}));
    }

    #[tokio::test]
    async fn removing_a_peer_takes_its_endpoint_and_tracks() {
        let mut state = SessionState::new("s");
        state.add_peer(peer("p1"));
        let mut record = endpoint("p1", Some("p1"));
        record
            .inbound_tracks
            .insert(TrackId::from("t1"), track("t1", "p1"));
        assert!(state.add_endpoint(record));

        let (peer, endpoint) = state.remove_peer(&PeerId::from("p1")).unwrap();
        assert_eq!(peer.id.as_str(), "p1");
        let endpoint = endpoint.unwrap();
        assert!(endpoint.inbound_tracks.contains_key(&TrackId::from("t1")));
        assert!(!state.has_endpoint(&EndpointId::from("p1")));
        assert!(state.find_track(&TrackId::from("t1")).is_none());
    }

    #[tokio::test]
    async fn second_endpoint_for_a_peer_is_rejected() {
        let mut state = SessionState::new("s");
        state.add_peer(peer("p1"));
        assert!(state.add_endpoint(endpoint("p1", Some("p1"))));
        assert!(!state.add_endpoint(endpoint("e2", Some("p1"))));
        assert!(!state.has_endpoint(&EndpointId::from("e2")));
    }

    #[tokio::test]
    async fn endpoint_for_unknown_peer_is_dropped() {
        let mut state = SessionState::new("s");
        assert!(!state.add_endpoint(endpoint("e1", Some("ghost"))));
        assert!(!state.has_endpoint(&EndpointId::from("e1")));
    }

    #[tokio::test]
    async fn pending_subscriptions_drain_in_insertion_order() {
        let mut state = SessionState::new("s");
        state.push_pending(pending("e1", "t1"));
        state.push_pending(pending("e2", "t2"));
        state.push_pending(pending("e3", "t1"));
        state.push_pending(pending("e4", "t1"));

        let drained = state.take_pending_for_track(&TrackId::from("t1"));
        let order: Vec<_> = drained
            .iter()
            .map(|p| p.subscription.endpoint_id.as_str().to_string())
            .collect();
        assert_eq!(order, vec!["e1", "e3", "e4"]);
        // Unrelated pending subscriptions stay.
        assert!(state.has_pending(&EndpointId::from("e2"), &TrackId::from("t2")));
        assert_eq!(state.stats().pending_subscriptions, 1);
    }

    #[tokio::test]
    async fn endpoint_removal_cancels_its_pending_subscriptions() {
        let mut state = SessionState::new("s");
        state.push_pending(pending("e1", "t9"));
        state.push_pending(pending("e2", "t1"));
        // e1 subscribed elsewhere and owns t1.
        state.drop_pending_for_endpoint(&EndpointId::from("e1"), &[TrackId::from("t1")]);
        assert_eq!(state.stats().pending_subscriptions, 0);
    }
}
