//! Connection gateway: admission control and the proof-of-work gate
//!
//! Runs once per new connection, before any session capability is granted.
//! The order is fixed: connection rate limit, ban check, CIDR and country
//! blocklists, then the proof-of-work challenge. The challenge imposes
//! asymmetric cost on mass-connecting bots; it is not authentication.

use axum::http::HeaderMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::models::{AdmissionRejection, Challenge, ServerEvent, Session};
use crate::rate_limit::ActionType;
use crate::session::{self, SessionState, SessionUpdate};
use crate::state::{now_secs, AppState, SharedState};
use crate::validation::{ip_in_ranges, parse_ip, validate_challenge_candidate};

/// Salted identity hash of an originating address. The anonymous moderation
/// key: never reversible to the address, stable within one salt.
pub fn identity_hash(salt: &str, address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(address.as_bytes());
    hex::encode(hasher.finalize())
}

/// Originating address, proxy-aware: the first `x-forwarded-for` entry wins
/// over the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: &str) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.to_string())
}

/// Country code the edge proxy resolved, if any.
pub fn client_country(headers: &HeaderMap) -> Option<String> {
    for header in ["cf-ipcountry", "x-geo-country"] {
        if let Some(code) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if !code.is_empty() {
                return Some(code.to_ascii_uppercase());
            }
        }
    }
    None
}

/// Admission checks. On success returns the identity hash the session will
/// carry; on failure the connection is refused before a session exists.
pub async fn admit(
    state: &AppState,
    address: &str,
    country: Option<&str>,
) -> Result<String, AdmissionRejection> {
    let identity = identity_hash(&state.config.identity_salt, address);

    if state
        .rate_limiter
        .check(&identity, ActionType::Connect)
        .await
        .is_err()
    {
        metrics::ADMISSION_REJECTED_TOTAL.inc();
        return Err(AdmissionRejection::RateLimited);
    }

    if state.ban_cache.is_banned(&state.db, &identity).await {
        metrics::ADMISSION_REJECTED_TOTAL.inc();
        return Err(AdmissionRejection::Banned);
    }

    if let Some(ip) = parse_ip(address) {
        let ranges = state.db.get_banned_ranges().await.unwrap_or_else(|err| {
            warn!("banned-range lookup failed, skipping: {err:#}");
            Vec::new()
        });
        if ip_in_ranges(ip, &ranges) {
            metrics::ADMISSION_REJECTED_TOTAL.inc();
            return Err(AdmissionRejection::RangeBlocked);
        }
    }

    if let Some(country) = country {
        let blocked = state.db.get_banned_countries().await.unwrap_or_else(|err| {
            warn!("banned-country lookup failed, skipping: {err:#}");
            Vec::new()
        });
        if blocked.iter().any(|c| c.eq_ignore_ascii_case(country)) {
            metrics::ADMISSION_REJECTED_TOTAL.inc();
            return Err(AdmissionRejection::CountryBlocked);
        }
    }

    Ok(identity)
}

/// Create a session in `Challenging` state, register its connection, issue
/// its challenge and arm the timeout. Returns the session id.
pub async fn start_session(
    state: &SharedState,
    identity_hash: String,
    sender: tokio::sync::mpsc::UnboundedSender<String>,
) -> Uuid {
    let session_id = Uuid::new_v4();
    let challenge = generate_challenge(state.config.pow_difficulty);

    {
        let mut session = Session::new(session_id, identity_hash, state.config.reputation_default);
        session.challenge = Some(challenge.clone());
        state.sessions.write().await.insert(session_id, session);
    }
    state.add_connection(session_id, sender).await;

    state
        .send_to_session(
            session_id,
            &ServerEvent::Challenge {
                prefix: challenge.prefix.clone(),
                difficulty: challenge.difficulty,
            },
        )
        .await;

    // Hard timeout: no correct solution in time means teardown.
    let timer_state = state.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(timer_state.config.challenge_timeout).await;
        let expired = {
            let sessions = timer_state.sessions.read().await;
            sessions
                .get(&session_id)
                .map(|s| s.state == SessionState::Challenging)
                .unwrap_or(false)
        };
        if expired {
            debug!(session = %session_id, "challenge timed out");
            metrics::CHALLENGE_FAILURES_TOTAL.inc();
            timer_state.challenge_timers.lock().await.remove(&session_id);
            timer_state.teardown_session(session_id).await;
        }
    });
    state.challenge_timers.lock().await.insert(session_id, timer);

    metrics::CONNECTIONS_TOTAL.inc();
    session_id
}

/// Handle a submitted proof-of-work candidate.
///
/// Malformed candidates are dropped without consuming the timer. A
/// well-formed wrong answer is a forced disconnect with no further
/// explanation.
pub async fn solve_challenge(state: &SharedState, session_id: Uuid, candidate: &str) {
    let challenge = {
        let sessions = state.sessions.read().await;
        match sessions.get(&session_id) {
            Some(s) if s.state == SessionState::Challenging => s.challenge.clone(),
            _ => return,
        }
    };
    let Some(challenge) = challenge else {
        return;
    };

    if validate_challenge_candidate(candidate).is_err() {
        return;
    }

    if !verify_pow(&challenge.prefix, candidate, challenge.difficulty) {
        info!(session = %session_id, "wrong challenge solution");
        metrics::CHALLENGE_FAILURES_TOTAL.inc();
        state.teardown_session(session_id).await;
        return;
    }

    if let Some(timer) = state.challenge_timers.lock().await.remove(&session_id) {
        timer.abort();
    }

    // Reputation comes along now that the session is real. Unknown
    // identities and unreachable stores both get the default.
    let identity = {
        let sessions = state.sessions.read().await;
        sessions
            .get(&session_id)
            .map(|s| s.identity_hash.clone())
    };
    let reputation = if let Some(identity) = identity {
        crate::db::with_retry("get_reputation", || state.db.get_reputation(&identity))
            .await
            .ok()
            .flatten()
            .unwrap_or(state.config.reputation_default)
    } else {
        state.config.reputation_default
    };

    {
        let mut sessions = state.sessions.write().await;
        if let Some(s) = sessions.get_mut(&session_id) {
            s.challenge = None;
            s.reputation_score = reputation;
        }
        session::transition(
            &mut sessions,
            session_id,
            SessionState::Idle,
            SessionUpdate {
                verified: Some(true),
                ..Default::default()
            },
        );
    }

    state
        .send_to_session(session_id, &ServerEvent::ChallengeSuccess)
        .await;
}

/// Random challenge prefix plus the configured difficulty.
pub fn generate_challenge(difficulty: u32) -> Challenge {
    let prefix: String = {
        let mut rng = rand::thread_rng();
        (0..16)
            .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
            .collect()
    };
    Challenge {
        prefix,
        difficulty,
        issued_at: now_secs() as u64,
    }
}

/// Whether `sha256(prefix + candidate)` ends in `difficulty` zero hex digits.
pub fn verify_pow(prefix: &str, candidate: &str, difficulty: u32) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(candidate.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest
        .chars()
        .rev()
        .take(difficulty as usize)
        .all(|c| c == '0')
}

/// Brute-force a solution. Test helper; this work is the client's job.
pub fn solve_pow(prefix: &str, difficulty: u32) -> String {
    let mut n: u64 = 0;
    loop {
        let candidate = format!("{n}");
        if verify_pow(prefix, &candidate, difficulty) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn shared_state(mut mutate: impl FnMut(&mut Config)) -> SharedState {
        let mut cfg = Config::default();
        cfg.identity_salt = "test-salt".into();
        mutate(&mut cfg);
        Arc::new(AppState::new_in_memory(cfg).await.unwrap())
    }

    #[test]
    fn test_identity_hash_salted_and_stable() {
        let a = identity_hash("salt-1", "1.2.3.4");
        let b = identity_hash("salt-1", "1.2.3.4");
        let c = identity_hash("salt-2", "1.2.3.4");
        let d = identity_hash("salt-1", "1.2.3.5");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "9.8.7.6, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, "127.0.0.1"), "9.8.7.6");

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, "127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_pow_verify() {
        let candidate = solve_pow("abc123", 2);
        assert!(verify_pow("abc123", &candidate, 2));
        assert!(verify_pow("abc123", &candidate, 1));
        // Difficulty zero accepts anything.
        assert!(verify_pow("abc123", "whatever", 0));
    }

    #[tokio::test]
    async fn test_admit_allows_clean_address() {
        let state = shared_state(|_| {}).await;
        let identity = admit(&state, "1.2.3.4", None).await.unwrap();
        assert_eq!(identity, identity_hash("test-salt", "1.2.3.4"));
    }

    #[tokio::test]
    async fn test_admit_connection_rate_limit() {
        let state = shared_state(|_| {}).await;
        for _ in 0..10 {
            admit(&state, "1.2.3.4", None).await.unwrap();
        }
        assert_eq!(
            admit(&state, "1.2.3.4", None).await,
            Err(AdmissionRejection::RateLimited)
        );
        // Other addresses unaffected.
        assert!(admit(&state, "5.6.7.8", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_admit_rejects_banned_identity() {
        let state = shared_state(|_| {}).await;
        let identity = identity_hash("test-salt", "1.2.3.4");
        state
            .db
            .upsert_ban(&identity, now_secs() + 3600)
            .await
            .unwrap();

        assert_eq!(
            admit(&state, "1.2.3.4", None).await,
            Err(AdmissionRejection::Banned)
        );
    }

    #[tokio::test]
    async fn test_admit_blocks_cidr_range() {
        let state = shared_state(|_| {}).await;
        state.db.add_banned_range("10.0.0.0/8").await.unwrap();

        assert_eq!(
            admit(&state, "10.5.5.5", None).await,
            Err(AdmissionRejection::RangeBlocked)
        );
        assert!(admit(&state, "11.5.5.5", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_admit_blocks_country() {
        let state = shared_state(|_| {}).await;
        state.db.add_banned_country("XX").await.unwrap();

        assert_eq!(
            admit(&state, "1.2.3.4", Some("xx")).await,
            Err(AdmissionRejection::CountryBlocked)
        );
        assert!(admit(&state, "1.2.3.4", Some("YY")).await.is_ok());
        assert!(admit(&state, "1.2.3.4", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_challenge_flow_success() {
        let state = shared_state(|cfg| cfg.pow_difficulty = 1).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let identity = identity_hash("test-salt", "1.2.3.4");
        let session_id = start_session(&state, identity, tx).await;

        let prefix = state.sessions.read().await[&session_id]
            .challenge
            .as_ref()
            .unwrap()
            .prefix
            .clone();
        let candidate = solve_pow(&prefix, 1);
        solve_challenge(&state, session_id, &candidate).await;

        let s = state.sessions.read().await[&session_id].clone();
        assert!(s.verified);
        assert_eq!(s.state, SessionState::Idle);
        assert!(s.challenge.is_none());

        let mut saw_success = false;
        while let Ok(msg) = rx.try_recv() {
            if msg.contains("challenge_success") {
                saw_success = true;
            }
        }
        assert!(saw_success);
    }

    #[tokio::test]
    async fn test_wrong_solution_tears_down() {
        let state = shared_state(|cfg| cfg.pow_difficulty = 6).await;
        let identity = identity_hash("test-salt", "1.2.3.4");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session_id = start_session(&state, identity, tx).await;

        // Six trailing zeros is vanishingly unlikely for a fixed candidate.
        solve_challenge(&state, session_id, "notasolution").await;
        assert!(state.sessions.read().await.get(&session_id).is_none());
    }

    #[tokio::test]
    async fn test_malformed_candidate_keeps_timer_running() {
        let state = shared_state(|cfg| cfg.pow_difficulty = 1).await;
        let identity = identity_hash("test-salt", "1.2.3.4");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session_id = start_session(&state, identity, tx).await;

        // Invalid shape: dropped without teardown.
        solve_challenge(&state, session_id, "not a candidate!").await;
        let s = state.sessions.read().await[&session_id].clone();
        assert_eq!(s.state, SessionState::Challenging);

        // The real solution still works afterwards.
        let prefix = s.challenge.unwrap().prefix;
        let candidate = solve_pow(&prefix, 1);
        solve_challenge(&state, session_id, &candidate).await;
        assert!(state.sessions.read().await[&session_id].verified);
    }

    #[tokio::test]
    async fn test_challenge_timeout_tears_down() {
        let state = shared_state(|cfg| {
            cfg.pow_difficulty = 1;
            cfg.challenge_timeout = Duration::from_millis(50);
        })
        .await;
        let identity = identity_hash("test-salt", "1.2.3.4");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session_id = start_session(&state, identity, tx).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(state.sessions.read().await.get(&session_id).is_none());
    }

    #[tokio::test]
    async fn test_reputation_loaded_on_verification() {
        let state = shared_state(|cfg| cfg.pow_difficulty = 1).await;
        let identity = identity_hash("test-salt", "1.2.3.4");
        state.db.update_reputation(&identity, -30).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let session_id = start_session(&state, identity, tx).await;

        let prefix = state.sessions.read().await[&session_id]
            .challenge
            .as_ref()
            .unwrap()
            .prefix
            .clone();
        let candidate = solve_pow(&prefix, 1);
        solve_challenge(&state, session_id, &candidate).await;

        assert_eq!(state.sessions.read().await[&session_id].reputation_score, 70);
    }
}
