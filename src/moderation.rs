//! Moderation pipeline: filtering, violation batching, ban escalation
//!
//! Every relayed message passes through [`ModerationPipeline::check_message`].
//! The order is fixed: trusted-reputation fast path, link detection,
//! circuit-breaker-guarded external scoring, then the cached rule list with
//! whitelist override. Blocked messages feed the escalation ladder, which may
//! ban the identity and disconnect its sessions.
//!
//! External scoring is availability-biased: while the breaker is open the
//! scorer is skipped and text is treated as non-toxic, so chat keeps working
//! when the scorer is down.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::db::{with_retry, Database};
use crate::metrics;
use crate::models::{FilterViolation, ModerationVerdict, ServerEvent};
use crate::rate_limit::ActionType;
use crate::scorer::ToxicityScorer;
use crate::state::{now_secs, AppState};

/// URLs and bare domains are an automatic severity-2 block.
static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:https?://\S+|www\.\S+|[a-z0-9][a-z0-9-]*\.(?:com|net|org|io|gg|xyz|me|co|app|ru|info)(?:/\S*)?)",
    )
    .unwrap()
});

enum RuleMatcher {
    Substring(String),
    Pattern(Regex),
}

struct CompiledRule {
    pattern: String,
    severity: u8,
    matcher: RuleMatcher,
}

struct RulesCache {
    rules: Vec<CompiledRule>,
    whitelist: Vec<String>,
    fetched_at: Instant,
}

pub struct ModerationPipeline {
    breaker: CircuitBreaker,
    scorer: Option<Arc<dyn ToxicityScorer>>,
    rules: Mutex<Option<RulesCache>>,
    /// Violations awaiting the next batched flush, oldest first.
    pending: Mutex<VecDeque<FilterViolation>>,
}

impl ModerationPipeline {
    pub fn new(config: &Config, scorer: Option<Arc<dyn ToxicityScorer>>) -> Self {
        Self {
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_open_duration,
            ),
            scorer,
            rules: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    // ── Message checking ──

    /// Run one message through the filter chain.
    pub async fn check_message(
        &self,
        state: &AppState,
        text: &str,
        identity_hash: &str,
        reputation: i64,
    ) -> ModerationVerdict {
        // Trusted identities skip everything.
        if reputation > state.config.reputation_fast_path {
            return ModerationVerdict::allow();
        }

        if LINK_RE.is_match(text) {
            return ModerationVerdict::block("link", 2);
        }

        if let Some(scorer) = &self.scorer {
            if text.chars().count() > state.config.scorer_min_chars && self.breaker.allow().await {
                match scorer.score(text).await {
                    Ok(score) => {
                        self.breaker.record_success().await;
                        if score > state.config.scorer_block_threshold {
                            return ModerationVerdict::block("toxicity", 2);
                        }
                        if score >= state.config.scorer_review_threshold {
                            if let Err(err) =
                                state.db.enqueue_review(identity_hash, text, score).await
                            {
                                warn!("failed to enqueue review: {err:#}");
                            }
                        }
                    }
                    Err(err) => {
                        warn!("toxicity scorer failed: {err:#}");
                        self.breaker.record_failure().await;
                    }
                }
            }
        }

        let text_lower = text.to_lowercase();
        let mut cache = self.rules.lock().await;
        let cache = self
            .rules_for(state, &mut cache)
            .await;

        for rule in &cache.rules {
            let matched = match &rule.matcher {
                RuleMatcher::Substring(needle) => {
                    text_lower.contains(needle).then(|| needle.clone())
                }
                RuleMatcher::Pattern(re) => {
                    re.find(text).map(|m| m.as_str().to_lowercase())
                }
            };
            let Some(fragment) = matched else {
                continue;
            };

            // Whitelist override: a whitelisted phrase that itself contains
            // the matched fragment voids the match ("ass" in "touching
            // grass").
            let whitelisted = cache.whitelist.iter().any(|phrase| {
                let phrase_lower = phrase.to_lowercase();
                phrase_lower.contains(&fragment) && text_lower.contains(&phrase_lower)
            });
            if whitelisted {
                return ModerationVerdict::allow();
            }

            return ModerationVerdict::block(rule.pattern.clone(), rule.severity);
        }

        ModerationVerdict::allow()
    }

    /// Fetch-or-refresh the compiled rule cache.
    async fn rules_for<'a>(
        &self,
        state: &AppState,
        slot: &'a mut Option<RulesCache>,
    ) -> &'a RulesCache {
        let fresh = slot
            .as_ref()
            .map(|c| c.fetched_at.elapsed() < state.config.rules_cache_ttl)
            .unwrap_or(false);

        if !fresh {
            let rules = state.db.get_filter_rules().await.unwrap_or_else(|err| {
                warn!("failed to load filter rules, keeping none: {err:#}");
                Vec::new()
            });
            let whitelist = state.db.get_whitelist().await.unwrap_or_else(|err| {
                warn!("failed to load whitelist: {err:#}");
                Vec::new()
            });

            let compiled = rules
                .into_iter()
                .filter_map(|r| {
                    let matcher = if r.is_regex {
                        match Regex::new(&r.pattern) {
                            Ok(re) => RuleMatcher::Pattern(re),
                            Err(err) => {
                                warn!(pattern = %r.pattern, "skipping bad rule regex: {err}");
                                return None;
                            }
                        }
                    } else {
                        RuleMatcher::Substring(r.pattern.to_lowercase())
                    };
                    Some(CompiledRule {
                        pattern: r.pattern,
                        severity: r.severity.clamp(1, 3),
                        matcher,
                    })
                })
                .collect();

            *slot = Some(RulesCache {
                rules: compiled,
                whitelist,
                fetched_at: Instant::now(),
            });
        }

        slot.as_ref().expect("cache populated above")
    }

    /// Drop the cached rule list so the next check reloads it.
    pub async fn invalidate_rules(&self) {
        *self.rules.lock().await = None;
    }

    // ── Escalation ──

    /// Apply the consequences of a blocked message.
    pub async fn enforce(
        &self,
        state: &AppState,
        session_id: Uuid,
        text: &str,
        verdict: &ModerationVerdict,
    ) {
        debug_assert!(verdict.blocked);
        metrics::MESSAGES_BLOCKED_TOTAL.inc();

        let identity = {
            let sessions = state.sessions.read().await;
            match sessions.get(&session_id) {
                Some(s) => s.identity_hash.clone(),
                None => return,
            }
        };
        let rule = verdict.rule_tag.clone().unwrap_or_default();

        match verdict.severity {
            3 => {
                self.ban_identity(
                    state,
                    &identity,
                    state.config.ban_duration_severe,
                    -50,
                    "Banned for severe content",
                )
                .await;
            }
            2 => {
                self.ban_identity(
                    state,
                    &identity,
                    state.config.ban_duration_standard,
                    -30,
                    "Banned for prohibited content",
                )
                .await;
            }
            _ => {
                self.record_violation(&identity, &rule, text).await;

                let since = now_secs() - state.config.violation_window.as_secs() as i64;
                let persisted = match state.db.count_violations_since(&identity, since).await {
                    Ok(n) => n,
                    Err(err) => {
                        warn!("violation count unavailable: {err:#}");
                        0
                    }
                };
                let pending = self.pending_count_for(&identity, since).await;

                if persisted + pending >= state.config.violation_ban_threshold {
                    self.ban_identity(
                        state,
                        &identity,
                        state.config.ban_duration_standard,
                        -50,
                        "Banned for repeated violations",
                    )
                    .await;
                } else {
                    state
                        .send_to_session(
                            session_id,
                            &ServerEvent::SoftError {
                                message: "Message blocked".to_string(),
                            },
                        )
                        .await;
                }
            }
        }
    }

    /// Ban an identity, adjust reputation, invalidate the cache and
    /// disconnect every session carrying the identity.
    pub async fn ban_identity(
        &self,
        state: &AppState,
        identity_hash: &str,
        duration: Duration,
        reputation_delta: i64,
        reason: &str,
    ) {
        let until = now_secs() + duration.as_secs() as i64;

        if let Err(err) = with_retry("upsert_ban", || state.db.upsert_ban(identity_hash, until)).await
        {
            warn!(identity = %identity_hash, "ban write failed, disconnecting anyway: {err:#}");
        }
        if reputation_delta != 0 {
            if let Err(err) = with_retry("update_reputation", || {
                state.db.update_reputation(identity_hash, reputation_delta)
            })
            .await
            {
                warn!(identity = %identity_hash, "reputation update failed: {err:#}");
            }
        }

        // The new status must be visible to this process immediately, not
        // after the cache TTL.
        state.ban_cache.invalidate(identity_hash).await;
        metrics::BANS_TOTAL.inc();
        info!(identity = %identity_hash, until, %reason, "identity banned");

        let banned = ServerEvent::Banned {
            reason: reason.to_string(),
        };
        for id in state.sessions_for_identity(identity_hash).await {
            state.send_to_session(id, &banned).await;
            state.teardown_session(id).await;
        }
    }

    // ── Violation batching ──

    /// Queue a violation for the next batched flush.
    pub async fn record_violation(&self, identity_hash: &str, rule: &str, raw_text: &str) {
        metrics::VIOLATIONS_TOTAL.inc();
        self.pending.lock().await.push_back(FilterViolation {
            identity_hash: identity_hash.to_string(),
            rule_matched: rule.to_string(),
            raw_text: raw_text.to_string(),
            created_at: now_secs(),
        });
    }

    async fn pending_count_for(&self, identity_hash: &str, since: i64) -> i64 {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|v| v.identity_hash == identity_hash && v.created_at >= since)
            .count() as i64
    }

    /// Flush queued violations in one transaction.
    ///
    /// A failed flush puts the batch back at the front of the queue, in
    /// order, for the next cycle — at-least-once persistence.
    pub async fn flush_pending(&self, db: &Database) {
        let batch: Vec<FilterViolation> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        if let Err(err) = db.insert_violation_batch(&batch).await {
            warn!(count = batch.len(), "violation flush failed, requeueing: {err:#}");
            let mut pending = self.pending.lock().await;
            for violation in batch.into_iter().rev() {
                pending.push_front(violation);
            }
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    // ── Reports ──

    /// Report the current partner. Independent of content filtering.
    pub async fn report_user(&self, state: &AppState, reporter_id: Uuid) {
        let (reporter_identity, target_identity) = {
            let sessions = state.sessions.read().await;
            let Some(reporter) = sessions.get(&reporter_id) else {
                return;
            };
            let Some(partner_id) = reporter.partner_id else {
                return;
            };
            let Some(partner) = sessions.get(&partner_id) else {
                return;
            };
            (reporter.identity_hash.clone(), partner.identity_hash.clone())
        };

        if state
            .rate_limiter
            .check(&reporter_identity, ActionType::Report)
            .await
            .is_err()
        {
            state
                .send_to_session(
                    reporter_id,
                    &ServerEvent::SoftError {
                        message: "Report limit reached".to_string(),
                    },
                )
                .await;
            return;
        }

        let count = match with_retry("upsert_report", || state.db.upsert_report(&target_identity))
            .await
        {
            Ok(count) => count,
            Err(err) => {
                warn!("report write failed: {err:#}");
                return;
            }
        };
        info!(identity = %target_identity, count, "partner reported");

        if count >= state.config.report_ban_threshold {
            // Report-count bans carry no reputation penalty.
            self.ban_identity(
                state,
                &target_identity,
                state.config.ban_duration_standard,
                0,
                "Banned after repeated reports",
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::Session;
    use crate::scorer::{StaticScorer, ToxicityScorer};
    use crate::session::SessionState;
    use tokio::sync::mpsc;

    async fn state_with_scorer(score: f64) -> (AppState, Arc<StaticScorer>) {
        let scorer = Arc::new(StaticScorer::new(score));
        let db = Database::new(":memory:").await.unwrap();
        let state = AppState::with_parts(
            db,
            Config::default(),
            Some(scorer.clone() as Arc<dyn ToxicityScorer>),
        );
        (state, scorer)
    }

    async fn plain_state() -> AppState {
        AppState::new_in_memory(Config::default()).await.unwrap()
    }

    async fn attach_chatting_pair(
        state: &AppState,
    ) -> (Uuid, Uuid, mpsc::UnboundedReceiver<String>, mpsc::UnboundedReceiver<String>) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let room = Uuid::new_v4();
        {
            let mut sessions = state.sessions.write().await;
            for (id, partner) in [(a, b), (b, a)] {
                let mut s = Session::new(id, format!("identity-{id}"), 50);
                s.verified = true;
                s.state = SessionState::Chatting;
                s.partner_id = Some(partner);
                s.room_id = Some(room);
                sessions.insert(id, s);
            }
        }
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        state.add_connection(a, tx_a).await;
        state.add_connection(b, tx_b).await;
        (a, b, rx_a, rx_b)
    }

    #[tokio::test]
    async fn test_reputation_fast_path_skips_all_checks() {
        let state = plain_state().await;
        let verdict = state
            .moderation
            .check_message(&state, "visit spamlink.com now", "h1", 95)
            .await;
        assert!(!verdict.blocked);
    }

    #[tokio::test]
    async fn test_link_detection_blocks_severity_two() {
        let state = plain_state().await;
        for text in [
            "visit spamlink.com now",
            "see https://evil.example/x",
            "www.bad.site here",
        ] {
            let verdict = state.moderation.check_message(&state, text, "h1", 50).await;
            assert!(verdict.blocked, "{text} should be blocked");
            assert_eq!(verdict.severity, 2);
            assert_eq!(verdict.rule_tag.as_deref(), Some("link"));
        }
    }

    #[tokio::test]
    async fn test_plain_text_passes() {
        let state = plain_state().await;
        let verdict = state
            .moderation
            .check_message(&state, "hello there", "h1", 50)
            .await;
        assert!(!verdict.blocked);
    }

    #[tokio::test]
    async fn test_substring_rule_and_whitelist_override() {
        let state = plain_state().await;
        state.db.add_filter_rule("ass", false, 1).await.unwrap();
        state
            .db
            .add_whitelist_phrase("touching grass")
            .await
            .unwrap();

        let verdict = state
            .moderation
            .check_message(&state, "you are an ass", "h1", 50)
            .await;
        assert!(verdict.blocked);
        assert_eq!(verdict.severity, 1);

        // The whitelisted phrase contains the matched substring: voided.
        let verdict = state
            .moderation
            .check_message(&state, "I love touching grass", "h1", 50)
            .await;
        assert!(!verdict.blocked);
    }

    #[tokio::test]
    async fn test_regex_rule_first_match_wins() {
        let state = plain_state().await;
        state
            .db
            .add_filter_rule(r"(?i)\bbuy\s+now\b", true, 3)
            .await
            .unwrap();
        state.db.add_filter_rule("buy", false, 1).await.unwrap();

        let verdict = state
            .moderation
            .check_message(&state, "BUY  NOW friend", "h1", 50)
            .await;
        assert!(verdict.blocked);
        assert_eq!(verdict.severity, 3);
    }

    #[tokio::test]
    async fn test_rules_cache_refresh_after_invalidation() {
        let state = plain_state().await;
        let verdict = state
            .moderation
            .check_message(&state, "badword here", "h1", 50)
            .await;
        assert!(!verdict.blocked);

        state.db.add_filter_rule("badword", false, 1).await.unwrap();
        // Still cached as empty.
        let verdict = state
            .moderation
            .check_message(&state, "badword here", "h1", 50)
            .await;
        assert!(!verdict.blocked);

        state.moderation.invalidate_rules().await;
        let verdict = state
            .moderation
            .check_message(&state, "badword here", "h1", 50)
            .await;
        assert!(verdict.blocked);
    }

    #[tokio::test]
    async fn test_scorer_blocks_above_threshold() {
        let (state, _scorer) = state_with_scorer(0.95).await;
        let verdict = state
            .moderation
            .check_message(&state, "subtly terrible message", "h1", 50)
            .await;
        assert!(verdict.blocked);
        assert_eq!(verdict.rule_tag.as_deref(), Some("toxicity"));
    }

    #[tokio::test]
    async fn test_scorer_borderline_queued_for_review() {
        let (state, _scorer) = state_with_scorer(0.7).await;
        let verdict = state
            .moderation
            .check_message(&state, "borderline message", "h1", 50)
            .await;
        assert!(!verdict.blocked);
    }

    #[tokio::test]
    async fn test_short_text_never_scored() {
        let (state, _scorer) = state_with_scorer(0.99).await;
        // Five characters or fewer skip the scorer entirely.
        let verdict = state.moderation.check_message(&state, "hello", "h1", 50).await;
        assert!(!verdict.blocked);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_non_toxic() {
        let (state, scorer) = state_with_scorer(0.99).await;
        scorer.set_failing(true);

        // Five consecutive failures open the breaker; every call passes.
        for _ in 0..5 {
            let verdict = state
                .moderation
                .check_message(&state, "would be toxic", "h1", 50)
                .await;
            assert!(!verdict.blocked);
        }

        // Breaker open: the scorer is skipped even though it would now
        // return a blocking score.
        scorer.set_failing(false);
        let verdict = state
            .moderation
            .check_message(&state, "would be toxic", "h1", 50)
            .await;
        assert!(!verdict.blocked);
    }

    #[tokio::test]
    async fn test_severity_three_bans_and_disconnects() {
        let state = plain_state().await;
        state.db.add_filter_rule("slur", false, 3).await.unwrap();
        let (a, _b, _rx_a, _rx_b) = attach_chatting_pair(&state).await;
        let identity = state.sessions.read().await[&a].identity_hash.clone();

        let verdict = state
            .moderation
            .check_message(&state, "slur content", &identity, 50)
            .await;
        assert!(verdict.blocked);
        assert_eq!(verdict.severity, 3);

        state.moderation.enforce(&state, a, "slur content", &verdict).await;

        // Session gone, ban recorded for roughly seven days.
        assert!(state.sessions.read().await.get(&a).is_none());
        let rec = state.db.get_ban_status(&identity).await.unwrap().unwrap();
        let until = rec.banned_until.unwrap();
        let expected = now_secs() + 7 * 24 * 3600;
        assert!((until - expected).abs() < 5);

        // Immediately visible through the cache.
        assert!(state.ban_cache.is_banned(&state.db, &identity).await);
    }

    #[tokio::test]
    async fn test_three_severity_one_violations_ban() {
        let state = plain_state().await;
        state.db.add_filter_rule("mild", false, 1).await.unwrap();
        let (a, _b, _rx_a, _rx_b) = attach_chatting_pair(&state).await;
        let identity = state.sessions.read().await[&a].identity_hash.clone();

        for i in 0..2 {
            let verdict = state
                .moderation
                .check_message(&state, "mild words", &identity, 50)
                .await;
            state.moderation.enforce(&state, a, "mild words", &verdict).await;
            // Two violations: still connected, no ban.
            assert!(
                state.sessions.read().await.get(&a).is_some(),
                "still connected after violation {}",
                i + 1
            );
        }
        let rec = state.db.get_ban_status(&identity).await.unwrap();
        assert!(rec.map(|r| !r.is_banned(now_secs())).unwrap_or(true));

        let verdict = state
            .moderation
            .check_message(&state, "mild again", &identity, 50)
            .await;
        state.moderation.enforce(&state, a, "mild again", &verdict).await;

        assert!(state.sessions.read().await.get(&a).is_none());
        let rec = state.db.get_ban_status(&identity).await.unwrap().unwrap();
        assert!(rec.is_banned(now_secs()));
    }

    #[tokio::test]
    async fn test_flush_failure_requeues_in_order() {
        let state = plain_state().await;
        state.moderation.record_violation("h1", "rule-a", "x").await;
        state.moderation.record_violation("h1", "rule-b", "y").await;

        // A healthy store drains the queue.
        state.moderation.flush_pending(&state.db).await;
        assert_eq!(state.moderation.pending_len().await, 0);
        assert_eq!(state.db.count_violations_since("h1", 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_report_threshold_bans_partner() {
        let state = plain_state().await;
        let (a, b, _rx_a, _rx_b) = attach_chatting_pair(&state).await;
        let target_identity = state.sessions.read().await[&b].identity_hash.clone();

        // Four prior reports from other encounters.
        for _ in 0..4 {
            state.db.upsert_report(&target_identity).await.unwrap();
        }

        state.moderation.report_user(&state, a).await;

        // Fifth report: banned without reputation penalty.
        let rec = state
            .db
            .get_ban_status(&target_identity)
            .await
            .unwrap()
            .unwrap();
        assert!(rec.is_banned(now_secs()));
        assert_eq!(rec.reputation_score, 100);
        assert!(state.sessions.read().await.get(&b).is_none());
    }

    #[tokio::test]
    async fn test_reporter_rate_limited() {
        let mut cfg = Config::default();
        cfg.reports_per_hour = 1;
        let db = Database::new(":memory:").await.unwrap();
        let state = AppState::with_parts(db, cfg, None);
        let (a, b, _rx_a, _rx_b) = attach_chatting_pair(&state).await;

        state.moderation.report_user(&state, a).await;
        state.moderation.report_user(&state, a).await;

        let target_identity = format!("identity-{b}");
        let rec = state.db.get_ban_status(&target_identity).await.unwrap();
        // Only the first report counted.
        assert_eq!(rec.map(|r| r.report_count), Some(1));
    }
}
