//! Prometheus metrics for session engines.
//!
//! All metrics register against [`REGISTRY`]; the host process exposes it on
//! its own scrape endpoint.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

/// Registry holding every roomcast metric.
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Peers currently admitted across all sessions in this process.
pub static ACTIVE_PEERS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "roomcast_active_peers",
        "Current number of admitted peers",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_PEERS")
});

/// Endpoints currently alive across all sessions.
pub static ACTIVE_ENDPOINTS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "roomcast_active_endpoints",
        "Current number of live endpoints",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_ENDPOINTS")
});

/// Tracks currently active (post track-ready) across all sessions.
pub static ACTIVE_TRACKS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "roomcast_active_tracks",
        "Current number of active tracks",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_TRACKS")
});

/// Media events processed, labeled by direction (inbound/outbound).
pub static MEDIA_EVENTS_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            "roomcast_media_events_total",
            "Total media events processed",
            &["direction"],
            REGISTRY.clone()
        )
        .expect("Failed to register MEDIA_EVENTS_TOTAL")
    });

/// Endpoint crashes contained by the engine.
pub static ENDPOINT_CRASHES_TOTAL: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "roomcast_endpoint_crashes_total",
            "Total endpoint crashes contained",
            REGISTRY.clone()
        )
        .expect("Failed to register ENDPOINT_CRASHES_TOTAL")
    });
