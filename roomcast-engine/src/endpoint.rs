//! Endpoint contract.
//!
//! An endpoint is a media-processing unit running as its own task: it
//! publishes tracks, subscribes to tracks, and reacts to control messages
//! from the engine. The engine never calls endpoint code directly; the
//! [`Endpoint`] trait plus [`EndpointContext`] are the whole seam.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use roomcast_protocol::{EndpointId, PeerId, TrackId};

use crate::engine::EngineHandle;
use crate::error::SubscribeError;
use crate::graph::tee::{MediaPayloadReceiver, MediaPayloadSender, RawDepayloader};
use crate::state::{DeliveryFormat, SubscribeOptions, TrackInfo, TrackInit};

/// Capacity of an endpoint's control channel. Control messages to a stalled
/// endpoint are dropped with a warning rather than blocking the engine.
pub const ENDPOINT_CONTROL_CHANNEL_CAPACITY: usize = 256;

/// Control messages the engine sends to an endpoint.
#[derive(Debug, Clone)]
pub enum EndpointControl {
    /// Whether the session runs with the display-manager policy.
    SetDisplayManager { enabled: bool },
    /// Tracks newly available for subscription.
    NewTracks { tracks: Vec<TrackInfo> },
    /// Tracks this endpoint subscribed to (or was offered) that are gone.
    RemoveTracks { track_ids: Vec<TrackId> },
    /// Opaque payload from the endpoint's peer.
    Custom { data: Bytes },
}

/// Options accepted when adding an endpoint. Specifying both `endpoint_id`
/// and `peer_id` is invalid.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    pub endpoint_id: Option<EndpointId>,
    pub peer_id: Option<PeerId>,
    /// Deployment locality hint; stored and logged, nothing else.
    pub node: Option<String>,
}

/// Publication notification from an endpoint.
#[derive(Debug, Clone)]
pub enum TrackPublication {
    Added(Vec<TrackInit>),
    Removed(Vec<TrackId>),
}

/// How an endpoint task ended. Only `Failed` and `Panicked` take the
/// crash-containment path.
#[derive(Debug, Clone)]
pub enum EndpointExit {
    Finished,
    Failed(String),
    Panicked(String),
    Cancelled,
}

/// A media-processing unit driven by the engine.
#[async_trait]
pub trait Endpoint: Send + 'static {
    /// Run until the engine tears the endpoint down (control channel closes)
    /// or the endpoint fails. An `Err` return is treated as a crash.
    async fn run(self: Box<Self>, ctx: EndpointContext) -> anyhow::Result<()>;
}

/// The endpoint side of the engine seam: the control-message receiver plus
/// the notification API.
pub struct EndpointContext {
    endpoint_id: EndpointId,
    control_rx: mpsc::Receiver<EndpointControl>,
    engine: EngineHandle,
}

impl EndpointContext {
    pub(crate) fn new(
        endpoint_id: EndpointId,
        control_rx: mpsc::Receiver<EndpointControl>,
        engine: EngineHandle,
    ) -> Self {
        Self {
            endpoint_id,
            control_rx,
            engine,
        }
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Next control message; `None` once the engine has torn this endpoint
    /// down.
    pub async fn recv_control(&mut self) -> Option<EndpointControl> {
        self.control_rx.recv().await
    }

    /// Announce inbound tracks (as inactive placeholders) or withdraw them.
    pub async fn publish(&self, publication: TrackPublication) -> crate::Result<()> {
        self.engine
            .publish(self.endpoint_id.clone(), publication)
            .await
    }

    /// Report a track (or one simulcast layer of it) ready to stream.
    /// Returns the payload sender feeding the track's tee.
    pub async fn track_ready(
        &self,
        track_id: TrackId,
        rid: Option<String>,
        encoding: impl Into<String>,
        depayloader: Arc<dyn RawDepayloader>,
    ) -> crate::Result<MediaPayloadSender> {
        self.engine
            .track_ready(
                self.endpoint_id.clone(),
                track_id,
                rid,
                encoding.into(),
                depayloader,
            )
            .await
    }

    /// Request delivery of a track in a given format.
    pub async fn subscribe(
        &self,
        track_id: TrackId,
        format: DeliveryFormat,
        opts: SubscribeOptions,
    ) -> Result<MediaPayloadReceiver, SubscribeError> {
        self.engine
            .subscribe(self.endpoint_id.clone(), track_id, format, opts)
            .await
    }

    /// Send an opaque Media Event to this endpoint's peer.
    pub async fn custom_media_event(&self, data: Bytes) -> crate::Result<()> {
        self.engine
            .custom_media_event(self.endpoint_id.clone(), data)
            .await
    }
}
