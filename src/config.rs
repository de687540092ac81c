//! Runtime configuration for the Parley pairing server
//!
//! Every tunable the engine consumes lives here so deployments can adjust
//! limits without touching call sites. Values come from defaults, then
//! `PARLEY_*` environment variables, then CLI flags.

use std::time::Duration;

/// Default connections allowed per identity per window.
pub const DEFAULT_CONNECTIONS_PER_MIN: usize = 10;

/// Default match-find requests per identity per window.
pub const DEFAULT_FINDS_PER_MIN: usize = 5;

/// Default messages per session per window.
pub const DEFAULT_MESSAGES_PER_MIN: usize = 15;

/// Default typing emissions per second.
pub const DEFAULT_TYPING_PER_SEC: usize = 1;

/// Default reports per identity per hour.
pub const DEFAULT_REPORTS_PER_HOUR: usize = 5;

/// Default number of trailing zero hex digits a challenge digest must carry.
pub const DEFAULT_POW_DIFFICULTY: u32 = 4;

/// Default reports before an automatic ban.
pub const DEFAULT_REPORT_BAN_THRESHOLD: i64 = 5;

/// Default severity-1 violations within the window before an automatic ban.
pub const DEFAULT_VIOLATION_BAN_THRESHOLD: i64 = 3;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Admission ──
    /// Salt mixed into the identity hash of every originating address.
    pub identity_salt: String,
    /// Trailing zero hex digits required of a challenge solution digest.
    pub pow_difficulty: u32,
    /// How long a client has to solve its challenge.
    pub challenge_timeout: Duration,
    /// Connections allowed per identity per minute.
    pub connections_per_min: usize,
    /// Largest inbound WebSocket text frame accepted, in bytes.
    pub max_payload_bytes: usize,

    // ── Matchmaking ──
    /// Match-find requests allowed per identity per minute.
    pub finds_per_min: usize,
    /// Quiet period after a successful match before the next find is honored.
    pub match_cooldown: Duration,
    /// Candidate pops attempted per find call.
    pub match_attempts: usize,

    // ── Relay ──
    /// Messages allowed per session per minute.
    pub messages_per_min: usize,
    /// Minimum spacing between two messages from one session.
    pub min_message_interval: Duration,
    /// Longest a message may sit in a room buffer before delivery.
    pub batch_window: Duration,
    /// Maximum message length in characters after trimming.
    pub max_message_chars: usize,
    /// Typing emissions allowed per session per second.
    pub typing_per_sec: usize,
    /// Stuck-indicator watchdog: force `typing=false` after this long.
    pub typing_watchdog: Duration,

    // ── Moderation ──
    /// Ban length for a severity-3 violation.
    pub ban_duration_severe: Duration,
    /// Ban length for a severity-2 violation (and report/violation-count bans).
    pub ban_duration_standard: Duration,
    /// Severity-1 violations inside `violation_window` that trigger a ban.
    pub violation_ban_threshold: i64,
    /// Rolling window for counting severity-1 violations.
    pub violation_window: Duration,
    /// Reports against one identity that trigger a ban.
    pub report_ban_threshold: i64,
    /// Reports one identity may file per hour.
    pub reports_per_hour: usize,
    /// Reputation above which messages skip all checks.
    pub reputation_fast_path: i64,
    /// Reputation assigned to identities the store has never seen. Below
    /// the fast-path threshold: a fresh identity earns no trust.
    pub reputation_default: i64,
    /// How long pending violations accumulate before a batched flush.
    pub violation_flush_interval: Duration,
    /// Filter rule / whitelist cache lifetime.
    pub rules_cache_ttl: Duration,

    // ── External scorer ──
    /// Toxicity scoring endpoint; `None` disables external scoring.
    pub scorer_url: Option<String>,
    /// Only text longer than this many characters is scored.
    pub scorer_min_chars: usize,
    /// Score above which a message is blocked.
    pub scorer_block_threshold: f64,
    /// Score at or above which a message is queued for review.
    pub scorer_review_threshold: f64,
    /// Consecutive scorer failures before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open before a half-open probe.
    pub breaker_open_duration: Duration,

    // ── Ban cache ──
    /// Cached ban status lifetime.
    pub ban_cache_ttl: Duration,
    /// Cached ban entries kept before eviction.
    pub ban_cache_capacity: usize,

    // ── Process ──
    /// Admin API bearer token; `None` disables the admin routes.
    pub admin_token: Option<String>,
    /// Hard deadline for the shutdown sequence.
    pub shutdown_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_salt: String::new(),
            pow_difficulty: DEFAULT_POW_DIFFICULTY,
            challenge_timeout: Duration::from_secs(15),
            connections_per_min: DEFAULT_CONNECTIONS_PER_MIN,
            max_payload_bytes: 10 * 1024,

            finds_per_min: DEFAULT_FINDS_PER_MIN,
            match_cooldown: Duration::from_secs(2),
            match_attempts: 3,

            messages_per_min: DEFAULT_MESSAGES_PER_MIN,
            min_message_interval: Duration::from_millis(500),
            batch_window: Duration::from_millis(100),
            max_message_chars: 1000,
            typing_per_sec: DEFAULT_TYPING_PER_SEC,
            typing_watchdog: Duration::from_secs(3),

            ban_duration_severe: Duration::from_secs(7 * 24 * 3600),
            ban_duration_standard: Duration::from_secs(24 * 3600),
            violation_ban_threshold: DEFAULT_VIOLATION_BAN_THRESHOLD,
            violation_window: Duration::from_secs(24 * 3600),
            report_ban_threshold: DEFAULT_REPORT_BAN_THRESHOLD,
            reports_per_hour: DEFAULT_REPORTS_PER_HOUR,
            reputation_fast_path: 90,
            reputation_default: 50,
            violation_flush_interval: Duration::from_secs(5),
            rules_cache_ttl: Duration::from_secs(300),

            scorer_url: None,
            scorer_min_chars: 5,
            scorer_block_threshold: 0.8,
            scorer_review_threshold: 0.6,
            breaker_failure_threshold: 5,
            breaker_open_duration: Duration::from_secs(60),

            ban_cache_ttl: Duration::from_secs(60),
            ban_cache_capacity: 10_000,

            admin_token: None,
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Build a config from defaults plus `PARLEY_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(salt) = std::env::var("PARLEY_IDENTITY_SALT") {
            cfg.identity_salt = salt;
        } else {
            // A fresh salt per process keeps identity hashes unlinkable
            // across restarts when none is pinned.
            cfg.identity_salt = random_salt();
        }
        if let Some(v) = env_parse("PARLEY_POW_DIFFICULTY") {
            cfg.pow_difficulty = v;
        }
        if let Some(v) = env_parse::<u64>("PARLEY_CHALLENGE_TIMEOUT_SECS") {
            cfg.challenge_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("PARLEY_CONNECTIONS_PER_MIN") {
            cfg.connections_per_min = v;
        }
        if let Some(v) = env_parse("PARLEY_FINDS_PER_MIN") {
            cfg.finds_per_min = v;
        }
        if let Some(v) = env_parse("PARLEY_MESSAGES_PER_MIN") {
            cfg.messages_per_min = v;
        }
        if let Some(v) = env_parse::<u64>("PARLEY_BAN_SEVERE_SECS") {
            cfg.ban_duration_severe = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("PARLEY_BAN_STANDARD_SECS") {
            cfg.ban_duration_standard = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("PARLEY_VIOLATION_BAN_THRESHOLD") {
            cfg.violation_ban_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("PARLEY_FLUSH_INTERVAL_SECS") {
            cfg.violation_flush_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("PARLEY_BAN_CACHE_TTL_SECS") {
            cfg.ban_cache_ttl = Duration::from_secs(v);
        }
        if let Ok(url) = std::env::var("PARLEY_SCORER_URL") {
            if !url.is_empty() {
                cfg.scorer_url = Some(url);
            }
        }
        if let Ok(token) = std::env::var("PARLEY_ADMIN_TOKEN") {
            if !token.is_empty() {
                cfg.admin_token = Some(token);
            }
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn random_salt() -> String {
    use rand::{distributions::Alphanumeric, Rng};

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
