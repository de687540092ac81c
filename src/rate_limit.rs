//! Rate limiting for the Parley pairing server
//!
//! Implements sliding window rate limiting per identity and action type.
//! Limits are injected from [`Config`] so every threshold stays tunable.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::Config;

/// Types of actions that can be rate limited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Connect,
    FindMatch,
    Message,
    Typing,
    Report,
}

/// Per-action limits, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct Limits {
    pub connections_per_min: usize,
    pub finds_per_min: usize,
    pub messages_per_min: usize,
    pub typing_per_sec: usize,
    pub reports_per_hour: usize,
}

impl Limits {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            connections_per_min: cfg.connections_per_min,
            finds_per_min: cfg.finds_per_min,
            messages_per_min: cfg.messages_per_min,
            typing_per_sec: cfg.typing_per_sec,
            reports_per_hour: cfg.reports_per_hour,
        }
    }

    fn limit(&self, action: ActionType) -> usize {
        match action {
            ActionType::Connect => self.connections_per_min,
            ActionType::FindMatch => self.finds_per_min,
            ActionType::Message => self.messages_per_min,
            ActionType::Typing => self.typing_per_sec,
            ActionType::Report => self.reports_per_hour,
        }
    }

    fn window(&self, action: ActionType) -> Duration {
        match action {
            ActionType::Typing => Duration::from_secs(1),
            ActionType::Report => Duration::from_secs(3600),
            _ => Duration::from_secs(60),
        }
    }
}

/// Error returned when a rate limit is exceeded
#[derive(Debug)]
pub struct RateLimitError {
    pub action: ActionType,
    pub retry_after_secs: u64,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} rate limit exceeded, retry in {}s",
            self.action, self.retry_after_secs
        )
    }
}

impl std::error::Error for RateLimitError {}

/// Rate limiter using sliding window algorithm
#[derive(Debug)]
pub struct RateLimiter {
    limits: Limits,
    /// Tracks timestamps of actions per (identity, action_type)
    windows: RwLock<HashMap<(String, ActionType), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Check if an action is allowed for an identity, counting it if so.
    pub async fn check(&self, identity: &str, action: ActionType) -> Result<(), RateLimitError> {
        let mut windows = self.windows.write().await;
        let now = Instant::now();
        let window_duration = self.limits.window(action);
        let limit = self.limits.limit(action);

        let window = windows
            .entry((identity.to_string(), action))
            .or_insert_with(VecDeque::new);

        // Drop entries older than the window
        while let Some(&front_time) = window.front() {
            if now.duration_since(front_time) > window_duration {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= limit {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = window_duration
                .saturating_sub(now.duration_since(oldest))
                .as_secs();
            return Err(RateLimitError {
                action,
                retry_after_secs: retry_after,
            });
        }

        window.push_back(now);
        Ok(())
    }

    /// Current usage and remaining capacity for an identity+action.
    pub async fn get_status(&self, identity: &str, action: ActionType) -> (usize, usize) {
        let mut windows = self.windows.write().await;
        let now = Instant::now();
        let window_duration = self.limits.window(action);
        let limit = self.limits.limit(action);

        let window = windows
            .entry((identity.to_string(), action))
            .or_insert_with(VecDeque::new);

        while let Some(&front_time) = window.front() {
            if now.duration_since(front_time) > window_duration {
                window.pop_front();
            } else {
                break;
            }
        }

        let current = window.len();
        (current, limit.saturating_sub(current))
    }

    /// Drop all windows for an identity (used at session teardown).
    pub async fn forget(&self, identity: &str) {
        let mut windows = self.windows.write().await;
        windows.retain(|(key, _), _| key != identity);
    }

    /// Clear all rate limiting data (useful for testing)
    pub async fn clear(&self) {
        self.windows.write().await.clear();
    }
}
