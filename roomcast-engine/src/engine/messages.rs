//! Engine command definitions and channel plumbing.
//!
//! Every control-API call, endpoint notification and tee notification is an
//! [`EngineCommand`] consumed by the single engine actor. RPC-style commands
//! carry a oneshot reply sender.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use roomcast_protocol::{EndpointId, PeerId, TrackId};

use crate::endpoint::{Endpoint, EndpointExit, EndpointOptions, TrackPublication};
use crate::error::SubscribeError;
use crate::graph::tee::{MediaPayloadReceiver, MediaPayloadSender, RawDepayloader};
use crate::registry::ObserverSender;
use crate::state::{DeliveryFormat, PeerInit, SessionStats, SubscribeOptions};

/// Capacity of the engine's command channel.
pub const ENGINE_COMMAND_CHANNEL_CAPACITY: usize = 4096;

/// How long a subscribe caller waits for acceptance before `Timeout`.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

pub type EngineCommandSender = mpsc::Sender<EngineCommand>;
pub type EngineCommandReceiver = mpsc::Receiver<EngineCommand>;

pub type SubscribeResult = std::result::Result<MediaPayloadReceiver, SubscribeError>;
pub type SubscribeResultSender = oneshot::Sender<SubscribeResult>;
pub type TrackReadyResultSender = oneshot::Sender<crate::Result<MediaPayloadSender>>;

pub enum EngineCommand {
    /// Insert a peer directly, bypassing the join handshake.
    AddPeer { peer: PeerInit },

    /// Remove a peer, notifying it with the given reason.
    RemovePeer {
        peer_id: PeerId,
        reason: Option<String>,
    },

    /// Admission decision for a peer awaiting one.
    AcceptPeer { peer_id: PeerId },
    DenyPeer {
        peer_id: PeerId,
        data: Option<Value>,
    },

    AddEndpoint {
        endpoint: Box<dyn Endpoint>,
        opts: EndpointOptions,
        result: oneshot::Sender<crate::Result<()>>,
    },
    RemoveEndpoint { endpoint_id: EndpointId },

    Register {
        observer_id: String,
        sender: ObserverSender,
    },
    Unregister { observer_id: String },

    /// Opaque bytes arriving from a peer's signaling channel.
    ReceiveMediaEvent { peer_id: PeerId, data: Bytes },

    Subscribe {
        endpoint_id: EndpointId,
        track_id: TrackId,
        format: DeliveryFormat,
        opts: SubscribeOptions,
        result: SubscribeResultSender,
    },

    /// A publishing endpoint reports a track (or one layer of it) streaming.
    TrackReady {
        endpoint_id: EndpointId,
        track_id: TrackId,
        rid: Option<String>,
        encoding: String,
        depayloader: Arc<dyn RawDepayloader>,
        result: TrackReadyResultSender,
    },

    /// Track publication change from an endpoint.
    Publish {
        endpoint_id: EndpointId,
        publication: TrackPublication,
    },

    /// Opaque payload an endpoint wants delivered to its peer.
    CustomMediaEvent { endpoint_id: EndpointId, data: Bytes },

    /// A simulcast tee switched the forwarded encoding for a receiver.
    EncodingSwitched {
        track_id: TrackId,
        receiver_id: EndpointId,
        encoding: String,
    },

    /// Completion-watcher report for an endpoint task.
    EndpointExited {
        endpoint_id: EndpointId,
        exit: EndpointExit,
    },

    Stats {
        result: oneshot::Sender<SessionStats>,
    },

    Shutdown,
}
