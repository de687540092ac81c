//! Prometheus metrics for the pairing server
//!
//! The engines call these at defined points; the backing registry and the
//! text endpoint are the only observability surface the core knows about.

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram,
    IntCounter, IntGauge, TextEncoder,
};

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "parley_connections_total",
        "Connections admitted past the gateway"
    ))
    .unwrap()
});

pub static ADMISSION_REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "parley_admission_rejected_total",
        "Connections refused before a session existed"
    ))
    .unwrap()
});

pub static CHALLENGE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "parley_challenge_failures_total",
        "Proof-of-work challenges failed or timed out"
    ))
    .unwrap()
});

pub static SESSIONS_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("parley_sessions", "Connected sessions")).unwrap()
});

pub static QUEUE_LENGTH_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("parley_queue_length", "Sessions in the waiting queue")).unwrap()
});

pub static ACTIVE_PAIRS_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("parley_active_pairs", "Rooms currently chatting")).unwrap()
});

pub static MESSAGES_SENT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "parley_messages_sent_total",
        "Messages accepted for relay"
    ))
    .unwrap()
});

pub static MESSAGES_BLOCKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "parley_messages_blocked_total",
        "Messages blocked by moderation"
    ))
    .unwrap()
});

pub static VIOLATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "parley_violations_total",
        "Filter violations recorded"
    ))
    .unwrap()
});

pub static BANS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!("parley_bans_total", "Bans applied")).unwrap()
});

pub static MATCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "parley_match_latency_seconds",
        "Time from search start to pairing"
    )
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
