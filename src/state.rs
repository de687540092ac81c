//! Shared application state for the Parley pairing server
//!
//! All mutable state is owned by one [`AppState`] instance and injected into
//! handlers, never module-global. Matchmaking queue, lock set, session table
//! and caches are mutated only through the engines held here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ban_cache::BanCache;
use crate::config::Config;
use crate::db::Database;
use crate::matchmaking::MatchmakingEngine;
use crate::metrics;
use crate::models::{ServerEvent, Session};
use crate::moderation::ModerationPipeline;
use crate::rate_limit::{Limits, RateLimiter};
use crate::relay::RelayEngine;
use crate::scorer::{HttpScorer, ToxicityScorer};

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    /// Moderation store (bans, violations, rules, blocklists)
    pub db: Database,
    /// Active sessions indexed by id
    pub sessions: RwLock<HashMap<Uuid, Session>>,
    /// Outbound event senders indexed by session id
    pub connections: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    pub rate_limiter: RateLimiter,
    pub ban_cache: BanCache,
    pub matchmaking: MatchmakingEngine,
    pub relay: RelayEngine,
    pub moderation: ModerationPipeline,
    /// Pending proof-of-work timeout tasks by session id
    pub challenge_timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Periodic background work, cancelled during shutdown.
    pub background_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cleared when shutdown begins; the gateway refuses new connections.
    pub accepting: AtomicBool,
    pub start_time: u64,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("db", &"<Database>")
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    /// Create new application state with database connection
    pub async fn new(db_path: &str, config: Config) -> anyhow::Result<Self> {
        let db = Database::new(db_path).await?;
        let scorer: Option<Arc<dyn ToxicityScorer>> = config
            .scorer_url
            .as_ref()
            .map(|url| Arc::new(HttpScorer::new(url.clone())) as Arc<dyn ToxicityScorer>);
        Ok(Self::with_parts(db, config, scorer))
    }

    /// Assemble state from already-built parts. Tests use this to inject a
    /// static scorer.
    pub fn with_parts(
        db: Database,
        config: Config,
        scorer: Option<Arc<dyn ToxicityScorer>>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(Limits::from_config(&config));
        let ban_cache = BanCache::new(config.ban_cache_ttl, config.ban_cache_capacity);
        let moderation = ModerationPipeline::new(&config, scorer);
        Self {
            config,
            db,
            sessions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            rate_limiter,
            ban_cache,
            matchmaking: MatchmakingEngine::new(),
            relay: RelayEngine::new(),
            moderation,
            challenge_timers: Mutex::new(HashMap::new()),
            background_tasks: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            start_time: now_secs() as u64,
        }
    }

    /// Create new application state with in-memory database (for testing)
    pub async fn new_in_memory(config: Config) -> anyhow::Result<Self> {
        Self::new(":memory:", config).await
    }

    // ── Connection management ──

    pub async fn add_connection(&self, session_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        let count = {
            let mut connections = self.connections.write().await;
            connections.insert(session_id, sender);
            connections.len()
        };
        metrics::SESSIONS_GAUGE.set(count as i64);
        self.broadcast(&ServerEvent::OnlineCount { count }).await;
    }

    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Serialize and enqueue an event for one session.
    pub async fn send_to_session(&self, session_id: Uuid, event: &ServerEvent) {
        let connections = self.connections.read().await;
        if let Some(sender) = connections.get(&session_id) {
            let payload = match serde_json::to_string(event) {
                Ok(p) => p,
                Err(err) => {
                    warn!("failed to serialize server event: {err}");
                    return;
                }
            };
            // A closed receiver just means the session is tearing down.
            let _ = sender.send(payload);
        }
    }

    /// Enqueue an event for every connected session.
    pub async fn broadcast(&self, event: &ServerEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(err) => {
                warn!("failed to serialize broadcast event: {err}");
                return;
            }
        };
        let connections = self.connections.read().await;
        for sender in connections.values() {
            let _ = sender.send(payload.clone());
        }
    }

    // ── Session teardown ──

    /// Full teardown of one session: pairing cleanup, queue/lock removal,
    /// timer cancellation, table and connection removal.
    ///
    /// Voluntary leave, forced disconnect, challenge failure and shutdown
    /// all funnel through here so the partner-notification path is shared.
    pub async fn teardown_session(&self, session_id: Uuid) {
        // Partner notification and room release first, while the session
        // record still exists.
        self.relay.cleanup_pairing(self, session_id).await;
        self.matchmaking.forget(session_id).await;
        self.relay.cancel_typing_watchdog(session_id).await;

        if let Some(timer) = self.challenge_timers.lock().await.remove(&session_id) {
            timer.abort();
        }

        let identity = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&session_id).map(|s| s.identity_hash)
        };

        let count = {
            let mut connections = self.connections.write().await;
            connections.remove(&session_id);
            connections.len()
        };
        metrics::SESSIONS_GAUGE.set(count as i64);

        if let Some(identity) = identity {
            // Only drop per-identity windows when no other session shares it.
            let sessions = self.sessions.read().await;
            if !sessions.values().any(|s| s.identity_hash == identity) {
                self.rate_limiter.forget(&identity).await;
            }
        }

        self.broadcast(&ServerEvent::OnlineCount { count }).await;
    }

    /// Sessions currently associated with an identity hash.
    pub async fn sessions_for_identity(&self, identity_hash: &str) -> Vec<Uuid> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.identity_hash == identity_hash)
            .map(|s| s.id)
            .collect()
    }

    pub fn uptime(&self) -> u64 {
        (now_secs() as u64).saturating_sub(self.start_time)
    }

    // ── Shutdown ──

    /// Ordered shutdown: refuse new connections, warn active sessions,
    /// flush pending violations, tear down every session. The caller
    /// cancels periodic tasks and bounds the whole sequence with the
    /// configured deadline, then closes the store.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("shutdown: admission stopped");

        self.broadcast(&ServerEvent::Shutdown {
            message: "Server is shutting down".to_string(),
        })
        .await;

        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("shutdown: background work cancelled");

        self.moderation.flush_pending(&self.db).await;
        info!("shutdown: violation batch flushed");

        let ids: Vec<Uuid> = self.sessions.read().await.keys().copied().collect();
        for id in ids {
            self.teardown_session(id).await;
        }
        info!("shutdown: sessions torn down");
    }
}

/// Shared application state type
pub type SharedState = Arc<AppState>;

pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    async fn state() -> AppState {
        AppState::new_in_memory(Config::default()).await.unwrap()
    }

    async fn attach(state: &AppState, verified: bool) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let mut session = Session::new(id, format!("identity-{id}"), 100);
        if verified {
            session.verified = true;
            session.state = SessionState::Idle;
        }
        state.sessions.write().await.insert(id, session);
        let (tx, rx) = mpsc::unbounded_channel();
        state.add_connection(id, tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_online_count_broadcast() {
        let state = state().await;
        let (_, mut rx1) = attach(&state, true).await;
        let first = rx1.recv().await.unwrap();
        assert!(first.contains("online_count"));

        let (_, _rx2) = attach(&state, true).await;
        let second = rx1.recv().await.unwrap();
        assert!(second.contains(r#""count":2"#));
    }

    #[tokio::test]
    async fn test_teardown_removes_everything() {
        let state = state().await;
        let (id, _rx) = attach(&state, true).await;

        state.teardown_session(id).await;
        assert!(state.sessions.read().await.get(&id).is_none());
        assert!(state.connections.read().await.get(&id).is_none());
        assert_eq!(state.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_all_sessions() {
        let state = state().await;
        let (_, mut rx1) = attach(&state, true).await;
        let (_, _rx2) = attach(&state, true).await;

        state.shutdown().await;
        assert!(!state.accepting.load(Ordering::SeqCst));
        assert_eq!(state.online_count().await, 0);

        // The shutdown warning reached the session before teardown.
        let mut saw_shutdown = false;
        while let Ok(msg) = rx1.try_recv() {
            if msg.contains(r#""type":"shutdown""#) {
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown);
    }
}
