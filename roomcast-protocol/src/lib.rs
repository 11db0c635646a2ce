//! Media Event wire types for the roomcast engine.
//!
//! A Media Event is the opaque control message exchanged between a client
//! library and the engine over whatever transport the application provides
//! (websocket, long polling, a channel). This crate defines both directions:
//!
//! - [`ClientEvent`] — events a peer sends to the engine (`join`, `leave`,
//!   metadata updates, encoding selection, custom pass-through).
//! - [`ServerEvent`] — events the engine sends to peers (`peerAccepted`,
//!   `tracksAdded`, `encodingSwitched`, ...).
//!
//! Events are JSON on the wire, keyed by a `type` field with a type-specific
//! `data` payload. The engine treats the transport edge as opaque bytes;
//! [`ClientEvent::decode`] and [`ServerEvent::encode`] are the only places
//! the wire format is interpreted.

mod events;
mod types;

pub use events::{ClientEvent, PeerInRoom, ProtocolError, ServerEvent};
pub use types::{EndpointId, PeerId, TrackId, TrackKind};
