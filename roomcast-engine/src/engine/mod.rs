//! The session engine actor.
//!
//! One engine task per session consumes [`EngineCommand`]s from a single
//! channel and mutates session state directly; no locks. Endpoints and tees
//! run as independent tasks and talk to the engine strictly through
//! messages, so a wedged or crashing endpoint never corrupts the session.
//!
//! The admission handshake is state-machine based: a `join` parks the peer
//! in `awaiting_decision` and processing continues; `AcceptPeer`/`DenyPeer`
//! are ordinary commands that consume the parked entry.

pub mod messages;

use bytes::Bytes;
use nanoid::nanoid;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use roomcast_protocol::{ClientEvent, EndpointId, PeerId, PeerInRoom, ServerEvent, TrackId};

use crate::config::SessionOptions;
use crate::endpoint::{
    Endpoint, EndpointContext, EndpointControl, EndpointExit, EndpointOptions, TrackPublication,
    ENDPOINT_CONTROL_CHANNEL_CAPACITY,
};
use crate::error::EngineError;
use crate::graph::tee::{
    MediaPayloadSender, RawDepayloader, TeeEvent, MEDIA_PAYLOAD_CHANNEL_CAPACITY,
};
use crate::graph::{GraphSpec, StagedLink, TeeKind, TrackRoute};
use crate::registry::{EngineMessage, EventTarget, ObserverSender, Registry};
use crate::state::{
    DeliveryFormat, PeerInit, SessionState, SessionStats, SubscribeOptions, Subscription,
    SubscriptionStatus, TrackInit, TrackRecord,
};
use messages::{
    EngineCommand, EngineCommandReceiver, EngineCommandSender, SubscribeResult,
    SubscribeResultSender, TrackReadyResultSender, ENGINE_COMMAND_CHANNEL_CAPACITY,
    SUBSCRIBE_TIMEOUT,
};

/// Join data parked while the application decides on admission.
struct PendingJoin {
    metadata: Value,
}

/// Cloneable front of a running engine. All control-API calls go through
/// here.
#[derive(Clone)]
pub struct EngineHandle {
    session_id: Arc<str>,
    tx: EngineCommandSender,
}

impl EngineHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn command_sender(&self) -> EngineCommandSender {
        self.tx.clone()
    }

    async fn send(&self, command: EngineCommand) -> crate::Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Insert a peer directly, as if it had joined and been accepted.
    pub async fn add_peer(&self, peer: PeerInit) -> crate::Result<()> {
        self.send(EngineCommand::AddPeer { peer }).await
    }

    /// Remove a peer, sending it `peerRemoved` with the given reason.
    pub async fn remove_peer(
        &self,
        peer_id: PeerId,
        reason: Option<String>,
    ) -> crate::Result<()> {
        self.send(EngineCommand::RemovePeer { peer_id, reason }).await
    }

    pub async fn accept_peer(&self, peer_id: PeerId) -> crate::Result<()> {
        self.send(EngineCommand::AcceptPeer { peer_id }).await
    }

    pub async fn deny_peer(&self, peer_id: PeerId, data: Option<Value>) -> crate::Result<()> {
        self.send(EngineCommand::DenyPeer { peer_id, data }).await
    }

    /// Add an endpoint. Fails with `InvalidArguments` when both
    /// `endpoint_id` and `peer_id` are given; an unknown `peer_id` drops the
    /// request with a warning.
    pub async fn add_endpoint(
        &self,
        endpoint: impl Endpoint,
        opts: EndpointOptions,
    ) -> crate::Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(EngineCommand::AddEndpoint {
            endpoint: Box::new(endpoint),
            opts,
            result: result_tx,
        })
        .await?;
        result_rx.await.map_err(|_| EngineError::Closed)?
    }

    pub async fn remove_endpoint(&self, endpoint_id: EndpointId) -> crate::Result<()> {
        self.send(EngineCommand::RemoveEndpoint { endpoint_id }).await
    }

    /// Register an observer for engine messages. Idempotent per id.
    pub async fn register(
        &self,
        observer_id: impl Into<String>,
        sender: ObserverSender,
    ) -> crate::Result<()> {
        self.send(EngineCommand::Register {
            observer_id: observer_id.into(),
            sender,
        })
        .await
    }

    pub async fn unregister(&self, observer_id: impl Into<String>) -> crate::Result<()> {
        self.send(EngineCommand::Unregister {
            observer_id: observer_id.into(),
        })
        .await
    }

    /// Hand the engine an inbound Media Event from a peer's signaling
    /// channel.
    pub async fn receive_media_event(&self, peer_id: PeerId, data: Bytes) -> crate::Result<()> {
        self.send(EngineCommand::ReceiveMediaEvent { peer_id, data })
            .await
    }

    /// Subscribe an endpoint to a track. Waits for acceptance up to five
    /// seconds; on success the returned receiver yields the track's
    /// payloads once the subscription is fulfilled.
    pub async fn subscribe(
        &self,
        endpoint_id: EndpointId,
        track_id: TrackId,
        format: DeliveryFormat,
        opts: SubscribeOptions,
    ) -> SubscribeResult {
        let (result_tx, result_rx) = oneshot::channel();
        let command = EngineCommand::Subscribe {
            endpoint_id,
            track_id,
            format,
            opts,
            result: result_tx,
        };
        if self.tx.send(command).await.is_err() {
            return Err(crate::SubscribeError::Timeout);
        }
        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(crate::SubscribeError::Timeout),
        }
    }

    pub async fn publish(
        &self,
        endpoint_id: EndpointId,
        publication: TrackPublication,
    ) -> crate::Result<()> {
        self.send(EngineCommand::Publish {
            endpoint_id,
            publication,
        })
        .await
    }

    /// Report a track ready to stream; returns the payload sender feeding
    /// its tee.
    pub async fn track_ready(
        &self,
        endpoint_id: EndpointId,
        track_id: TrackId,
        rid: Option<String>,
        encoding: String,
        depayloader: Arc<dyn RawDepayloader>,
    ) -> crate::Result<MediaPayloadSender> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(EngineCommand::TrackReady {
            endpoint_id,
            track_id,
            rid,
            encoding,
            depayloader,
            result: result_tx,
        })
        .await?;
        result_rx.await.map_err(|_| EngineError::Closed)?
    }

    pub async fn custom_media_event(
        &self,
        endpoint_id: EndpointId,
        data: Bytes,
    ) -> crate::Result<()> {
        self.send(EngineCommand::CustomMediaEvent { endpoint_id, data })
            .await
    }

    pub async fn stats(&self) -> crate::Result<SessionStats> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(EngineCommand::Stats { result: result_tx }).await?;
        result_rx.await.map_err(|_| EngineError::Closed)
    }

    /// Stop the engine, tearing down every tee and endpoint task.
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send(EngineCommand::Shutdown).await
    }
}

/// The session engine actor. Created with [`Engine::start`], driven through
/// an [`EngineHandle`].
pub struct Engine {
    opts: SessionOptions,
    state: SessionState,
    registry: Registry,
    routes: HashMap<TrackId, TrackRoute>,
    awaiting_decision: HashMap<PeerId, PendingJoin>,
    handle: EngineHandle,
    rx: EngineCommandReceiver,
}

impl Engine {
    /// Spawn the engine task and return its handle.
    pub fn start(opts: SessionOptions) -> EngineHandle {
        let (tx, rx) = mpsc::channel(ENGINE_COMMAND_CHANNEL_CAPACITY);
        let handle = EngineHandle {
            session_id: Arc::from(opts.id.as_str()),
            tx,
        };
        let span = tracing::info_span!("engine", session = %opts.id);
        let engine = Self {
            registry: Registry::new(opts.id.as_str()),
            state: SessionState::new(opts.id.as_str()),
            routes: HashMap::new(),
            awaiting_decision: HashMap::new(),
            handle: handle.clone(),
            rx,
            opts,
        };
        tokio::spawn(engine.run().instrument(span));
        handle
    }

    async fn run(mut self) {
        info!(
            display_manager = self.opts.display_manager,
            labels = ?self.opts.telemetry_label,
            trace_ctx = ?self.opts.trace_ctx,
            "engine started"
        );

        while let Some(command) = self.rx.recv().await {
            match command {
                EngineCommand::AddPeer { peer } => self.handle_add_peer(peer),
                EngineCommand::RemovePeer { peer_id, reason } => {
                    self.handle_remove_peer(&peer_id, reason).await;
                }
                EngineCommand::AcceptPeer { peer_id } => self.handle_accept_peer(&peer_id),
                EngineCommand::DenyPeer { peer_id, data } => self.handle_deny_peer(&peer_id, data),
                EngineCommand::AddEndpoint {
                    endpoint,
                    opts,
                    result,
                } => self.handle_add_endpoint(endpoint, opts, result),
                EngineCommand::RemoveEndpoint { endpoint_id } => {
                    self.teardown_endpoint(&endpoint_id).await;
                }
                EngineCommand::Register {
                    observer_id,
                    sender,
                } => {
                    self.registry.register(observer_id, sender);
                }
                EngineCommand::Unregister { observer_id } => {
                    self.registry.unregister(&observer_id);
                }
                EngineCommand::ReceiveMediaEvent { peer_id, data } => {
                    self.handle_media_event(peer_id, data).await;
                }
                EngineCommand::Subscribe {
                    endpoint_id,
                    track_id,
                    format,
                    opts,
                    result,
                } => {
                    self.handle_subscribe(endpoint_id, track_id, format, opts, result)
                        .await;
                }
                EngineCommand::TrackReady {
                    endpoint_id,
                    track_id,
                    rid,
                    encoding,
                    depayloader,
                    result,
                } => {
                    self.handle_track_ready(endpoint_id, track_id, rid, encoding, depayloader, result)
                        .await;
                }
                EngineCommand::Publish {
                    endpoint_id,
                    publication,
                } => match publication {
                    TrackPublication::Added(tracks) => {
                        self.handle_publish_added(&endpoint_id, tracks);
                    }
                    TrackPublication::Removed(track_ids) => {
                        self.handle_publish_removed(&endpoint_id, track_ids).await;
                    }
                },
                EngineCommand::CustomMediaEvent { endpoint_id, data } => {
                    self.handle_custom_media_event(&endpoint_id, &data);
                }
                EngineCommand::EncodingSwitched {
                    track_id,
                    receiver_id,
                    encoding,
                } => self.handle_encoding_switched(&track_id, &receiver_id, encoding),
                EngineCommand::EndpointExited { endpoint_id, exit } => {
                    self.handle_endpoint_exited(&endpoint_id, exit).await;
                }
                EngineCommand::Stats { result } => {
                    let _ = result.send(self.state.stats());
                }
                EngineCommand::Shutdown => break,
            }
        }

        self.teardown().await;
        info!("engine stopped");
    }

    // ----- admission -------------------------------------------------------

    fn handle_add_peer(&mut self, init: PeerInit) {
        if self.state.has_peer(&init.id) {
            warn!(peer_id = %init.id, "peer already present, ignoring add");
            return;
        }
        // A direct add supersedes a parked join for the same id.
        self.awaiting_decision.remove(&init.id);
        self.admit_peer(init);
    }

    fn handle_accept_peer(&mut self, peer_id: &PeerId) {
        let Some(pending) = self.awaiting_decision.remove(peer_id) else {
            warn!(peer_id = %peer_id, "accept for a peer not awaiting admission");
            return;
        };
        self.admit_peer(PeerInit {
            id: peer_id.clone(),
            metadata: pending.metadata,
        });
    }

    fn handle_deny_peer(&mut self, peer_id: &PeerId, data: Option<Value>) {
        if self.awaiting_decision.remove(peer_id).is_none() {
            warn!(peer_id = %peer_id, "deny for a peer not awaiting admission");
            return;
        }
        self.send_event(
            EventTarget::Peer(peer_id.clone()),
            ServerEvent::PeerDenied { data },
        );
    }

    fn admit_peer(&mut self, init: PeerInit) {
        let peer_id = init.id.clone();
        let metadata = init.metadata.clone();
        if !self.state.add_peer(init) {
            return;
        }
        // The snapshot to the newcomer goes out before the broadcast so
        // every observer sees `peerAccepted` first.
        let peers_in_room = self.state.peers_snapshot(&peer_id);
        self.send_event(
            EventTarget::Peer(peer_id.clone()),
            ServerEvent::PeerAccepted {
                id: peer_id.clone(),
                peers_in_room,
            },
        );
        self.send_event(
            EventTarget::Broadcast,
            ServerEvent::PeerJoined {
                peer: PeerInRoom {
                    id: peer_id.clone(),
                    metadata,
                    track_id_to_metadata: HashMap::new(),
                },
            },
        );
        crate::metrics::ACTIVE_PEERS.inc();
        info!(peer_id = %peer_id, "peer admitted");
    }

    async fn handle_remove_peer(&mut self, peer_id: &PeerId, reason: Option<String>) {
        if !self.state.has_peer(peer_id) {
            warn!(peer_id = %peer_id, "remove of unknown peer");
            return;
        }
        let reason = reason.unwrap_or_else(|| "Peer removed".to_string());
        self.send_event(
            EventTarget::Peer(peer_id.clone()),
            ServerEvent::PeerRemoved {
                peer_id: peer_id.clone(),
                reason,
            },
        );
        self.remove_peer_internal(peer_id).await;
    }

    /// Tear a peer down: endpoint first (with its tracks and tees), then the
    /// record, then the departure notifications.
    async fn remove_peer_internal(&mut self, peer_id: &PeerId) {
        let endpoint_id = self.state.peer(peer_id).and_then(|p| p.endpoint_id.clone());
        if let Some(endpoint_id) = endpoint_id {
            self.teardown_endpoint(&endpoint_id).await;
        }
        let Some((peer, _)) = self.state.remove_peer(peer_id) else {
            warn!(peer_id = %peer_id, "remove of unknown peer");
            return;
        };
        self.send_event(
            EventTarget::Broadcast,
            ServerEvent::PeerLeft {
                peer_id: peer.id.clone(),
            },
        );
        self.registry.dispatch(EngineMessage::PeerLeft {
            peer_id: peer.id,
            metadata: peer.metadata,
        });
        crate::metrics::ACTIVE_PEERS.dec();
    }

    // ----- endpoint lifecycle ---------------------------------------------

    fn handle_add_endpoint(
        &mut self,
        endpoint: Box<dyn Endpoint>,
        opts: EndpointOptions,
        result: oneshot::Sender<crate::Result<()>>,
    ) {
        if opts.endpoint_id.is_some() && opts.peer_id.is_some() {
            let _ = result.send(Err(EngineError::InvalidArguments(
                "both endpoint_id and peer_id specified".to_string(),
            )));
            return;
        }
        if let Some(peer_id) = &opts.peer_id {
            match self.state.peer(peer_id) {
                None => {
                    // Tolerated signaling race: the peer may already be gone.
                    warn!(peer_id = %peer_id, "no such peer, dropping endpoint add");
                    let _ = result.send(Ok(()));
                    return;
                }
                Some(peer) if peer.endpoint_id.is_some() => {
                    warn!(peer_id = %peer_id, "peer already has an endpoint, dropping add");
                    let _ = result.send(Ok(()));
                    return;
                }
                Some(_) => {}
            }
        }

        let endpoint_id = opts
            .endpoint_id
            .clone()
            .or_else(|| opts.peer_id.as_ref().map(EndpointId::from))
            .unwrap_or_else(|| EndpointId::new(nanoid!(12)));
        if self.state.has_endpoint(&endpoint_id) {
            warn!(endpoint_id = %endpoint_id, "endpoint already present, ignoring add");
            let _ = result.send(Ok(()));
            return;
        }

        let (control_tx, control_rx) = mpsc::channel(ENDPOINT_CONTROL_CHANNEL_CAPACITY);
        let ctx = EndpointContext::new(endpoint_id.clone(), control_rx, self.handle.clone());
        let join = tokio::spawn(endpoint.run(ctx));
        let abort = join.abort_handle();
        spawn_exit_watcher(endpoint_id.clone(), join, self.handle.command_sender());

        if let Some(node) = &opts.node {
            info!(endpoint_id = %endpoint_id, node = %node, "endpoint placement hint");
        }
        let record = crate::state::EndpointRecord {
            id: endpoint_id.clone(),
            peer_id: opts.peer_id,
            node: opts.node,
            control_tx,
            abort: abort.clone(),
            inbound_tracks: HashMap::new(),
            subscriptions: HashMap::new(),
        };
        if !self.state.add_endpoint(record) {
            abort.abort();
            let _ = result.send(Ok(()));
            return;
        }
        crate::metrics::ACTIVE_ENDPOINTS.inc();

        // Initial controls: session policy, then the current track offer.
        let offer: Vec<_> = self
            .state
            .active_tracks()
            .filter(|t| t.owner != endpoint_id)
            .map(TrackRecord::info)
            .collect();
        if let Some(record) = self.state.endpoint(&endpoint_id) {
            self.send_control(
                record,
                EndpointControl::SetDisplayManager {
                    enabled: self.opts.display_manager,
                },
            );
            if !offer.is_empty() {
                self.send_control(record, EndpointControl::NewTracks { tracks: offer });
            }
        }
        info!(endpoint_id = %endpoint_id, "endpoint added");
        let _ = result.send(Ok(()));
    }

    /// Shared removal procedure: unlink subscribers, cancel pendings, tear
    /// down tees, drop the record. Used by explicit removal, peer departure
    /// and crash containment alike.
    async fn teardown_endpoint(&mut self, endpoint_id: &EndpointId) {
        let Some(record) = self.state.remove_endpoint(endpoint_id) else {
            warn!(endpoint_id = %endpoint_id, "remove of unknown endpoint");
            return;
        };
        record.abort.abort();

        let track_ids: Vec<TrackId> = record.inbound_tracks.keys().cloned().collect();
        let active_ids: Vec<TrackId> = record
            .inbound_tracks
            .values()
            .filter(|t| t.active)
            .map(|t| t.id.clone())
            .collect();

        // RemoveTracks goes only to endpoints actively subscribed, filtered
        // to their own subscription set.
        let mut controls = Vec::new();
        for other in self.state.endpoints_mut() {
            let subscribed: Vec<TrackId> = track_ids
                .iter()
                .filter(|t| other.subscriptions.contains_key(t))
                .cloned()
                .collect();
            if subscribed.is_empty() {
                continue;
            }
            for track_id in &subscribed {
                other.subscriptions.remove(track_id);
            }
            controls.push((
                other.id.clone(),
                other.control_tx.clone(),
                EndpointControl::RemoveTracks {
                    track_ids: subscribed,
                },
            ));
        }
        for (other_id, control_tx, control) in controls {
            send_control_raw(&other_id, &control_tx, control);
        }

        self.state.drop_pending_for_endpoint(endpoint_id, &track_ids);

        // Unlink this endpoint's branches from other tracks' tees.
        for (track_id, subscription) in &record.subscriptions {
            if let Some(route) = self.routes.get(track_id) {
                route
                    .unlink(
                        endpoint_id.as_str(),
                        matches!(subscription.format, DeliveryFormat::Raw),
                    )
                    .await;
            }
        }

        for track_id in &track_ids {
            if let Some(route) = self.routes.remove(track_id) {
                route.shutdown().await;
            }
        }

        crate::metrics::ACTIVE_ENDPOINTS.dec();
        crate::metrics::ACTIVE_TRACKS.sub(active_ids.len() as i64);

        if !active_ids.is_empty() {
            let owner_peer = record
                .peer_id
                .clone()
                .unwrap_or_else(|| PeerId::from(endpoint_id.as_str()));
            self.send_event(
                EventTarget::Broadcast,
                ServerEvent::TracksRemoved {
                    peer_id: owner_peer,
                    track_ids: active_ids,
                },
            );
        }
        info!(endpoint_id = %endpoint_id, "endpoint removed");
    }

    async fn handle_endpoint_exited(&mut self, endpoint_id: &EndpointId, exit: EndpointExit) {
        match exit {
            EndpointExit::Cancelled => {
                debug!(endpoint_id = %endpoint_id, "endpoint task cancelled");
            }
            EndpointExit::Finished => {
                if self.state.has_endpoint(endpoint_id) {
                    info!(endpoint_id = %endpoint_id, "endpoint finished");
                    self.teardown_endpoint(endpoint_id).await;
                }
            }
            EndpointExit::Failed(reason) | EndpointExit::Panicked(reason) => {
                if !self.state.has_endpoint(endpoint_id) {
                    return;
                }
                error!(endpoint_id = %endpoint_id, reason = %reason, "endpoint crashed");
                crate::metrics::ENDPOINT_CRASHES_TOTAL.inc();

                let peer_id = self
                    .state
                    .endpoint(endpoint_id)
                    .and_then(|e| e.peer_id.clone());
                if let Some(peer_id) = &peer_id {
                    self.send_event(
                        EventTarget::Peer(peer_id.clone()),
                        ServerEvent::PeerRemoved {
                            peer_id: peer_id.clone(),
                            reason: "Internal server error".to_string(),
                        },
                    );
                }
                self.registry.dispatch(EngineMessage::EndpointCrashed {
                    endpoint_id: endpoint_id.clone(),
                });

                match peer_id {
                    Some(peer_id) => self.remove_peer_internal(&peer_id).await,
                    None => self.teardown_endpoint(endpoint_id).await,
                }
            }
        }
    }

    // ----- publication & subscriptions ------------------------------------

    fn handle_publish_added(&mut self, endpoint_id: &EndpointId, tracks: Vec<TrackInit>) {
        if !self.state.has_endpoint(endpoint_id) {
            warn!(endpoint_id = %endpoint_id, "publish from unknown endpoint");
            return;
        }

        let mut added = Vec::new();
        for mut init in tracks {
            if self.state.find_track(&init.id).is_some() {
                warn!(track_id = %init.id, "track id already in session, skipping");
                continue;
            }
            if init
                .simulcast_encodings
                .as_ref()
                .map_or(false, Vec::is_empty)
            {
                warn!(track_id = %init.id, "empty simulcast encoding list, treating as non-simulcast");
                init.simulcast_encodings = None;
            }
            let record = TrackRecord::from_init(init, endpoint_id.clone());
            added.push(record.info());
            if let Some(endpoint) = self.state.endpoint_mut(endpoint_id) {
                endpoint.inbound_tracks.insert(record.id.clone(), record);
            }
        }
        if added.is_empty() {
            return;
        }

        // Offer the new tracks to every other endpoint. `tracksAdded` to
        // peers waits until the tracks actually become active.
        for other in self.state.endpoints() {
            if &other.id == endpoint_id {
                continue;
            }
            self.send_control(
                other,
                EndpointControl::NewTracks {
                    tracks: added.clone(),
                },
            );
        }
        debug!(endpoint_id = %endpoint_id, count = added.len(), "tracks published");
    }

    async fn handle_publish_removed(&mut self, endpoint_id: &EndpointId, track_ids: Vec<TrackId>) {
        let Some(endpoint) = self.state.endpoint_mut(endpoint_id) else {
            warn!(endpoint_id = %endpoint_id, "unpublish from unknown endpoint");
            return;
        };

        let mut removed = Vec::new();
        let mut removed_active = Vec::new();
        for track_id in track_ids {
            match endpoint.inbound_tracks.remove(&track_id) {
                Some(track) => {
                    if track.active {
                        removed_active.push(track_id.clone());
                    }
                    removed.push(track_id);
                }
                None => warn!(track_id = %track_id, "unpublish of a track the endpoint does not own"),
            }
        }
        if removed.is_empty() {
            return;
        }

        let mut controls = Vec::new();
        for other in self.state.endpoints_mut() {
            let subscribed: Vec<TrackId> = removed
                .iter()
                .filter(|t| other.subscriptions.contains_key(t))
                .cloned()
                .collect();
            if subscribed.is_empty() {
                continue;
            }
            for track_id in &subscribed {
                other.subscriptions.remove(track_id);
            }
            controls.push((
                other.id.clone(),
                other.control_tx.clone(),
                EndpointControl::RemoveTracks {
                    track_ids: subscribed,
                },
            ));
        }
        for (other_id, control_tx, control) in controls {
            send_control_raw(&other_id, &control_tx, control);
        }

        self.state.drop_pending_for_tracks(&removed);
        for track_id in &removed {
            if let Some(route) = self.routes.remove(track_id) {
                route.shutdown().await;
            }
        }
        crate::metrics::ACTIVE_TRACKS.sub(removed_active.len() as i64);

        if !removed_active.is_empty() {
            let owner_peer = self.owner_peer_id(endpoint_id);
            self.send_event(
                EventTarget::Broadcast,
                ServerEvent::TracksRemoved {
                    peer_id: owner_peer,
                    track_ids: removed_active,
                },
            );
        }
    }

    async fn handle_track_ready(
        &mut self,
        endpoint_id: EndpointId,
        track_id: TrackId,
        rid: Option<String>,
        encoding: String,
        depayloader: Arc<dyn RawDepayloader>,
        result: TrackReadyResultSender,
    ) {
        let owns = self
            .state
            .endpoint(&endpoint_id)
            .map_or(false, |e| e.inbound_tracks.contains_key(&track_id));
        if !owns {
            warn!(endpoint_id = %endpoint_id, track_id = %track_id, "track_ready for a track the endpoint does not own");
            let _ = result.send(Err(EngineError::NotFound(format!(
                "track {track_id} on endpoint {endpoint_id}"
            ))));
            return;
        }

        if let Some(route) = self.routes.get(&track_id) {
            // Another simulcast layer of an already-ready track; all layers
            // share one payload channel, tagged by rid.
            debug!(track_id = %track_id, rid = ?rid, "additional layer ready");
            let _ = result.send(Ok(route.tee.payload_tx.clone()));
            return;
        }

        let Some((simulcast_encodings, metadata)) = self
            .state
            .find_track_mut(&track_id)
            .map(|track| {
                track.active = true;
                track.encoding = encoding;
                track.depayloader = Some(depayloader);
                if let Some(rid) = &rid {
                    if track.simulcast_encodings.is_none() {
                        warn!(track_id = %track.id, rid = %rid, "layer id on an undeclared simulcast track, deriving encodings");
                        track.simulcast_encodings = Some(vec![rid.clone()]);
                    }
                }
                (track.simulcast_encodings.clone(), track.metadata.clone())
            })
        else {
            let _ = result.send(Err(EngineError::NotFound(format!("track {track_id}"))));
            return;
        };

        let owner_peer = self.owner_peer_id(&endpoint_id);
        let route = TrackRoute::build(
            &track_id,
            &owner_peer,
            simulcast_encodings.as_deref(),
            self.opts.display_manager,
            self.handle.command_sender(),
        );
        let payload_tx = route.tee.payload_tx.clone();
        self.routes.insert(track_id.clone(), route);
        crate::metrics::ACTIVE_TRACKS.inc();

        // Drain parked subscriptions in arrival order; all their graph edits
        // commit as one batch.
        let pending = self.state.take_pending_for_track(&track_id);
        let mut spec = GraphSpec::default();
        for entry in pending {
            let endpoint = entry.subscription.endpoint_id.clone();
            if !self
                .stage_subscription(entry.subscription, entry.sender, &mut spec)
                .await
            {
                warn!(endpoint_id = %endpoint, track_id = %track_id, "pending subscription dropped at fulfillment");
            }
        }
        if !spec.is_empty() {
            spec.commit().await;
        }

        self.send_event(
            EventTarget::Broadcast,
            ServerEvent::TracksAdded {
                peer_id: owner_peer,
                track_id_to_metadata: HashMap::from([(track_id.clone(), metadata)]),
            },
        );
        info!(track_id = %track_id, endpoint_id = %endpoint_id, "track ready");
        let _ = result.send(Ok(payload_tx));
    }

    async fn handle_subscribe(
        &mut self,
        endpoint_id: EndpointId,
        track_id: TrackId,
        format: DeliveryFormat,
        opts: SubscribeOptions,
        result: SubscribeResultSender,
    ) {
        if !self.state.has_endpoint(&endpoint_id) {
            // No spec'd error covers an unknown subscriber; the caller runs
            // into its timeout.
            warn!(endpoint_id = %endpoint_id, "subscribe from unknown endpoint");
            return;
        }
        if track_id.as_str().is_empty() {
            let _ = result.send(Err(crate::SubscribeError::InvalidTrackId));
            return;
        }

        // Validate against the track when it is already known; a subscribe
        // racing ahead of the publish is parked unvalidated.
        if let Some(track) = self.state.find_track(&track_id) {
            if !track.accepts(&format) {
                let _ = result.send(Err(crate::SubscribeError::InvalidFormat));
                return;
            }
            if track.is_simulcast() {
                if let Some(encoding) = &opts.default_simulcast_encoding {
                    if !track.offers_encoding(encoding) {
                        let _ = result
                            .send(Err(crate::SubscribeError::InvalidDefaultSimulcastEncoding));
                        return;
                    }
                }
            }
        }

        // At most one subscription per (endpoint, track): a duplicate
        // replaces the previous branch.
        let prior = self
            .state
            .endpoint(&endpoint_id)
            .and_then(|e| e.subscriptions.get(&track_id).cloned());
        if let Some(prior) = prior {
            warn!(endpoint_id = %endpoint_id, track_id = %track_id, "duplicate subscribe, replacing existing branch");
            if let Some(route) = self.routes.get(&track_id) {
                route
                    .unlink(
                        endpoint_id.as_str(),
                        matches!(prior.format, DeliveryFormat::Raw),
                    )
                    .await;
            }
            if let Some(endpoint) = self.state.endpoint_mut(&endpoint_id) {
                endpoint.subscriptions.remove(&track_id);
            }
        }
        if self.state.has_pending(&endpoint_id, &track_id) {
            warn!(endpoint_id = %endpoint_id, track_id = %track_id, "duplicate subscribe, replacing pending entry");
            self.state.remove_pending(&endpoint_id, &track_id);
        }

        let (sender, receiver) = mpsc::channel(MEDIA_PAYLOAD_CHANNEL_CAPACITY);
        let subscription = Subscription {
            endpoint_id: endpoint_id.clone(),
            track_id: track_id.clone(),
            format,
            opts,
            status: SubscriptionStatus::Pending,
        };

        if self.routes.contains_key(&track_id) {
            let mut spec = GraphSpec::default();
            if self.stage_subscription(subscription, sender, &mut spec).await {
                spec.commit().await;
                let _ = result.send(Ok(receiver));
            } else {
                warn!(endpoint_id = %endpoint_id, track_id = %track_id, "subscription could not be fulfilled");
            }
        } else {
            self.state.push_pending(crate::state::PendingSubscription {
                subscription,
                sender,
            });
            debug!(endpoint_id = %endpoint_id, track_id = %track_id, "subscription parked until track-ready");
            let _ = result.send(Ok(receiver));
        }
    }

    /// Stage the graph edits for one subscription and record it as active.
    /// Returns false (staging nothing) when the subscription cannot be
    /// fulfilled anymore.
    async fn stage_subscription(
        &mut self,
        mut subscription: Subscription,
        sender: MediaPayloadSender,
        spec: &mut GraphSpec,
    ) -> bool {
        let track_id = subscription.track_id.clone();
        let endpoint_id = subscription.endpoint_id.clone();
        if !self.state.has_endpoint(&endpoint_id) {
            warn!(endpoint_id = %endpoint_id, "subscriber endpoint gone");
            return false;
        }
        let Some(track) = self.state.find_track(&track_id) else {
            warn!(track_id = %track_id, "track gone before fulfillment");
            return false;
        };
        if !track.accepts(&subscription.format) {
            warn!(track_id = %track_id, "requested format not accepted by track");
            return false;
        }
        let depayloader = track.depayloader.clone();

        let Some(route) = self.routes.get_mut(&track_id) else {
            warn!(track_id = %track_id, "no route for active track");
            return false;
        };
        let link = match subscription.format {
            DeliveryFormat::Raw => {
                let Some(depayloader) = depayloader else {
                    warn!(track_id = %track_id, "track has no depayloading filter for raw delivery");
                    return false;
                };
                let raw_tee = route.ensure_raw_branch(&track_id, depayloader).await;
                StagedLink {
                    tee: raw_tee,
                    receiver_id: endpoint_id.to_string(),
                    sender,
                    selected_encoding: None,
                }
            }
            DeliveryFormat::Remote(_) => StagedLink {
                tee: route.tee.clone(),
                receiver_id: endpoint_id.to_string(),
                sender,
                selected_encoding: subscription.opts.default_simulcast_encoding.clone(),
            },
        };
        spec.stage(link);

        subscription.status = SubscriptionStatus::Active;
        if let Some(endpoint) = self.state.endpoint_mut(&endpoint_id) {
            endpoint.subscriptions.insert(track_id, subscription);
        }
        true
    }

    // ----- media events ----------------------------------------------------

    async fn handle_media_event(&mut self, peer_id: PeerId, data: Bytes) {
        crate::metrics::MEDIA_EVENTS_TOTAL
            .with_label_values(&["inbound"])
            .inc();
        let event = match ClientEvent::decode(&data) {
            Ok(event) => event,
            Err(e) => {
                warn!(peer_id = %peer_id, "dropping malformed media event: {e}");
                return;
            }
        };

        let known = self.state.has_peer(&peer_id);
        if !known && !matches!(event, ClientEvent::Join { .. }) {
            warn!(peer_id = %peer_id, "media event from unknown peer");
            return;
        }

        match event {
            ClientEvent::Join { metadata } => {
                if known || self.awaiting_decision.contains_key(&peer_id) {
                    warn!(peer_id = %peer_id, "join from an already known peer");
                    return;
                }
                self.awaiting_decision.insert(
                    peer_id.clone(),
                    PendingJoin {
                        metadata: metadata.clone(),
                    },
                );
                self.registry
                    .dispatch(EngineMessage::NewPeer { peer_id, metadata });
            }
            ClientEvent::Leave => {
                self.remove_peer_internal(&peer_id).await;
            }
            ClientEvent::UpdatePeerMetadata { metadata } => {
                if let Some(peer) = self.state.peer_mut(&peer_id) {
                    peer.metadata = metadata.clone();
                }
                self.send_event(
                    EventTarget::Broadcast,
                    ServerEvent::PeerUpdated { peer_id, metadata },
                );
            }
            ClientEvent::UpdateTrackMetadata {
                track_id,
                track_metadata,
            } => self.handle_update_track_metadata(&peer_id, &track_id, track_metadata),
            ClientEvent::SelectEncoding {
                peer_id: owner_peer,
                track_id,
                encoding,
            } => {
                self.handle_select_encoding(&peer_id, &owner_peer, &track_id, encoding)
                    .await;
            }
            ClientEvent::Custom(value) => {
                let endpoint_id = EndpointId::from(&peer_id);
                let Some(endpoint) = self.state.endpoint(&endpoint_id) else {
                    warn!(peer_id = %peer_id, "custom event for a peer without an endpoint");
                    return;
                };
                match serde_json::to_vec(&value) {
                    Ok(bytes) => self.send_control(
                        endpoint,
                        EndpointControl::Custom {
                            data: Bytes::from(bytes),
                        },
                    ),
                    Err(e) => warn!(peer_id = %peer_id, "unserializable custom event: {e}"),
                }
            }
        }
    }

    fn handle_update_track_metadata(
        &mut self,
        peer_id: &PeerId,
        track_id: &TrackId,
        metadata: Value,
    ) {
        let endpoint_id = EndpointId::from(peer_id);
        let Some(endpoint) = self.state.endpoint_mut(&endpoint_id) else {
            warn!(peer_id = %peer_id, "track metadata update from a peer without an endpoint");
            return;
        };
        let Some(track) = endpoint.inbound_tracks.get_mut(track_id) else {
            warn!(peer_id = %peer_id, track_id = %track_id, "metadata update for a track the peer does not own");
            return;
        };
        track.metadata = metadata.clone();
        self.send_event(
            EventTarget::Broadcast,
            ServerEvent::TrackUpdated {
                peer_id: peer_id.clone(),
                track_id: track_id.clone(),
                metadata,
            },
        );
    }

    async fn handle_select_encoding(
        &mut self,
        subscriber_peer: &PeerId,
        claimed_owner: &PeerId,
        track_id: &TrackId,
        encoding: String,
    ) {
        let subscriber_endpoint = EndpointId::from(subscriber_peer);
        let has_subscription = self
            .state
            .endpoint(&subscriber_endpoint)
            .map_or(false, |e| e.subscriptions.contains_key(track_id));
        if !has_subscription {
            warn!(peer_id = %subscriber_peer, track_id = %track_id, "select_encoding without an active subscription");
            return;
        }
        let Some(track) = self.state.find_track(track_id) else {
            warn!(track_id = %track_id, "select_encoding for unknown track");
            return;
        };
        let owner_endpoint = track.owner.clone();
        let offers = track.offers_encoding(&encoding);
        let owner_peer = self.owner_peer_id(&owner_endpoint);
        if &owner_peer != claimed_owner {
            warn!(peer_id = %subscriber_peer, track_id = %track_id, "select_encoding names the wrong track owner");
            return;
        }
        if !offers {
            warn!(track_id = %track_id, encoding = %encoding, "select_encoding for an encoding the track does not offer");
            return;
        }
        let Some(route) = self.routes.get(track_id) else {
            warn!(track_id = %track_id, "select_encoding before track-ready");
            return;
        };
        if route.kind != TeeKind::Simulcast {
            warn!(track_id = %track_id, "select_encoding on a non-simulcast track");
            return;
        }
        let _ = route
            .tee
            .event_tx
            .send(TeeEvent::SelectEncoding {
                receiver_id: subscriber_endpoint.to_string(),
                encoding,
            })
            .await;
    }

    fn handle_encoding_switched(
        &mut self,
        track_id: &TrackId,
        receiver_id: &EndpointId,
        encoding: String,
    ) {
        let Some(track) = self.state.find_track(track_id) else {
            debug!(track_id = %track_id, "encoding switch for a track that is gone");
            return;
        };
        let owner_endpoint = track.owner.clone();
        let owner_peer = self.owner_peer_id(&owner_endpoint);
        let Some(receiver) = self.state.endpoint(receiver_id) else {
            debug!(endpoint_id = %receiver_id, "encoding switch for a receiver that is gone");
            return;
        };
        let to = receiver
            .peer_id
            .clone()
            .unwrap_or_else(|| PeerId::from(receiver_id.as_str()));
        self.send_event(
            EventTarget::Peer(to),
            ServerEvent::EncodingSwitched {
                peer_id: owner_peer,
                track_id: track_id.clone(),
                encoding,
            },
        );
    }

    fn handle_custom_media_event(&mut self, endpoint_id: &EndpointId, data: &Bytes) {
        let Some(endpoint) = self.state.endpoint(endpoint_id) else {
            warn!(endpoint_id = %endpoint_id, "custom media event from unknown endpoint");
            return;
        };
        let to = endpoint
            .peer_id
            .clone()
            .unwrap_or_else(|| PeerId::from(endpoint_id.as_str()));
        match serde_json::from_slice::<Value>(data) {
            Ok(value) => {
                self.send_event(EventTarget::Peer(to), ServerEvent::Custom(value));
            }
            Err(e) => {
                warn!(endpoint_id = %endpoint_id, "dropping malformed custom media event: {e}");
            }
        }
    }

    // ----- plumbing --------------------------------------------------------

    fn owner_peer_id(&self, endpoint_id: &EndpointId) -> PeerId {
        self.state
            .endpoint(endpoint_id)
            .and_then(|e| e.peer_id.clone())
            .unwrap_or_else(|| PeerId::from(endpoint_id.as_str()))
    }

    fn send_event(&self, to: EventTarget, event: ServerEvent) {
        match event.encode() {
            Ok(data) => {
                crate::metrics::MEDIA_EVENTS_TOTAL
                    .with_label_values(&["outbound"])
                    .inc();
                self.registry
                    .dispatch(EngineMessage::MediaEvent { to, data });
            }
            Err(e) => error!("failed to encode media event: {e}"),
        }
    }

    fn send_control(&self, record: &crate::state::EndpointRecord, control: EndpointControl) {
        send_control_raw(&record.id, &record.control_tx, control);
    }

    async fn teardown(&mut self) {
        let stats = self.state.stats();
        crate::metrics::ACTIVE_PEERS.sub(stats.peers as i64);
        crate::metrics::ACTIVE_ENDPOINTS.sub(stats.endpoints as i64);
        crate::metrics::ACTIVE_TRACKS.sub(stats.active_tracks as i64);

        let routes: Vec<TrackRoute> = self.routes.drain().map(|(_, route)| route).collect();
        for route in routes {
            route.shutdown().await;
        }
        let endpoint_ids: Vec<EndpointId> = self.state.endpoints().map(|e| e.id.clone()).collect();
        for endpoint_id in &endpoint_ids {
            if let Some(record) = self.state.remove_endpoint(endpoint_id) {
                record.abort.abort();
            }
        }
    }
}

/// Watch an endpoint task and report how it ended. Panics surface as
/// `JoinError`s here, so a crashing endpoint can never take the engine (or
/// any sibling endpoint) down with it.
fn spawn_exit_watcher(
    endpoint_id: EndpointId,
    join: JoinHandle<anyhow::Result<()>>,
    tx: EngineCommandSender,
) {
    tokio::spawn(async move {
        let exit = match join.await {
            Ok(Ok(())) => EndpointExit::Finished,
            Ok(Err(e)) => EndpointExit::Failed(e.to_string()),
            Err(e) if e.is_cancelled() => EndpointExit::Cancelled,
            Err(e) => EndpointExit::Panicked(e.to_string()),
        };
        let _ = tx
            .send(EngineCommand::EndpointExited { endpoint_id, exit })
            .await;
    });
}

fn send_control_raw(
    endpoint_id: &EndpointId,
    control_tx: &mpsc::Sender<EndpointControl>,
    control: EndpointControl,
) {
    match control_tx.try_send(control) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(endpoint_id = %endpoint_id, "endpoint control channel full, dropping control message");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(endpoint_id = %endpoint_id, "endpoint control channel closed");
        }
    }
}
