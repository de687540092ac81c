//! Parley pairing server library
//!
//! Exposes modules for testing and reuse

pub mod admin;
pub mod ban_cache;
pub mod breaker;
pub mod config;
pub mod db;
pub mod gateway;
pub mod handlers;
pub mod matchmaking;
pub mod metrics;
pub mod models;
pub mod moderation;
pub mod rate_limit;
pub mod relay;
pub mod scorer;
pub mod session;
pub mod state;
pub mod validation;
