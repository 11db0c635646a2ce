//! Roomcast session engine: the control plane of an SFU.
//!
//! One [`Engine`] per session tracks who is in the room, what media tracks
//! exist, which endpoints want which tracks, and maintains the per-track
//! fan-out graph connecting publishers to subscribers.
//!
//! ## Architecture
//!
//! - **[`Engine`]**: a single actor task consuming control messages; all
//!   session state mutates there, lock-free.
//! - **[`Endpoint`]**: a media-processing unit running as its own task,
//!   publishing and/or subscribing to tracks through an [`EndpointContext`].
//!   Endpoint crashes are contained; the session survives.
//! - **Tees** (`graph`): one fan-out node per active track — push, filter,
//!   or simulcast — plus an optional raw-format branch through the track's
//!   depayloading filter.
//! - **[`registry::Registry`]**: per-engine observers receiving admission
//!   requests, departures, crashes and serialized Media Events.
//!
//! Peer admission is delegated to the application: a `join` Media Event
//! surfaces as [`EngineMessage::NewPeer`] and the application answers with
//! [`EngineHandle::accept_peer`] or [`EngineHandle::deny_peer`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_engine::{Engine, SessionOptions};
//!
//! let engine = Engine::start(SessionOptions::new("room-1"));
//! engine.register("app", observer_tx).await?;
//! engine.receive_media_event(peer_id, join_bytes).await?;
//! // ... observer sees NewPeer ...
//! engine.accept_peer(peer_id).await?;
//! ```

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod state;

pub use config::{LoggingConfig, SessionOptions};
pub use endpoint::{
    Endpoint, EndpointContext, EndpointControl, EndpointExit, EndpointOptions, TrackPublication,
};
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, Result, SubscribeError};
pub use graph::tee::{
    MediaPayload, MediaPayloadReceiver, MediaPayloadSender, NoopDepayloader, RawDepayloader,
};
pub use registry::{EngineMessage, EventTarget, ObserverSender, OBSERVER_CHANNEL_CAPACITY};
pub use state::{
    DeliveryFormat, PeerInit, SessionStats, SubscribeOptions, TrackInfo, TrackInit,
};
