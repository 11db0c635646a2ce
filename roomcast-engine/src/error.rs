use thiserror::Error;

/// Errors surfaced to control-API callers.
///
/// Everything else the engine can hit at runtime is either logged and
/// dropped (malformed media events, references to records that are already
/// gone) or handled through the crash-containment path.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The engine task is gone; no call can succeed anymore.
    #[error("engine closed")]
    Closed,
}

/// Validation and delivery failures of a subscribe call, returned
/// synchronously to the subscriber.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("unknown track id")]
    InvalidTrackId,

    #[error("format is not accepted by the track")]
    InvalidFormat,

    #[error("default simulcast encoding is not offered by the track")]
    InvalidDefaultSimulcastEncoding,

    #[error("subscribe request timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, EngineError>;
