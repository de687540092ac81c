//! Data models for the Parley pairing server

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionState;

/// One active anonymous connection.
///
/// Sessions exist only in process memory: created when a connection passes
/// admission, destroyed on disconnect. The salted `identity_hash` is the only
/// link to anything persistent.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    /// Salted SHA-256 of the originating address (hex). Moderation key.
    pub identity_hash: String,
    pub partner_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    /// Cached reputation, 0–100. Fetched once at admission.
    pub reputation_score: i64,
    /// Set when the proof-of-work challenge has been solved.
    pub verified: bool,
    /// Unix millis of the last accepted message.
    pub last_message_at: u64,
    /// Unix millis of the last successful match.
    pub last_match_at: u64,
    /// Unix millis when the current search began, while waiting.
    pub search_started_at: Option<u64>,
    pub typing: bool,
    /// Outstanding proof-of-work challenge, while `Challenging`.
    pub challenge: Option<Challenge>,
}

impl Session {
    pub fn new(id: Uuid, identity_hash: String, reputation_score: i64) -> Self {
        Self {
            id,
            state: SessionState::Challenging,
            identity_hash,
            partner_id: None,
            room_id: None,
            reputation_score,
            verified: false,
            last_message_at: 0,
            last_match_at: 0,
            search_started_at: None,
            typing: false,
            challenge: None,
        }
    }
}

/// Proof-of-work challenge issued at admission.
///
/// The client must find a candidate such that
/// `sha256(prefix + candidate)` ends in `difficulty` zero hex digits.
#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
    pub prefix: String,
    pub difficulty: u32,
    pub issued_at: u64,
}

/// Persisted ban / reputation record, keyed by identity hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub identity_hash: String,
    pub report_count: i64,
    /// Unix seconds; banned iff `now < banned_until`.
    pub banned_until: Option<i64>,
    pub reputation_score: i64,
}

impl BanRecord {
    pub fn is_banned(&self, now: i64) -> bool {
        matches!(self.banned_until, Some(until) if now < until)
    }
}

/// Append-only record of a filter hit, batched before persistence.
#[derive(Debug, Clone)]
pub struct FilterViolation {
    pub identity_hash: String,
    pub rule_matched: String,
    pub raw_text: String,
    /// Unix seconds.
    pub created_at: i64,
}

/// One moderation rule, ordered by position, first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: i64,
    pub pattern: String,
    pub is_regex: bool,
    /// 1–3; drives the ban escalation ladder.
    pub severity: u8,
}

/// Result of running one message through the moderation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationVerdict {
    pub blocked: bool,
    pub rule_tag: Option<String>,
    pub severity: u8,
}

impl ModerationVerdict {
    pub fn allow() -> Self {
        Self {
            blocked: false,
            rule_tag: None,
            severity: 0,
        }
    }

    pub fn block(rule_tag: impl Into<String>, severity: u8) -> Self {
        Self {
            blocked: true,
            rule_tag: Some(rule_tag.into()),
            severity,
        }
    }
}

/// Why a connection was refused before a session existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejection {
    RateLimited,
    Banned,
    RangeBlocked,
    CountryBlocked,
}

impl AdmissionRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionRejection::RateLimited => "rate_limited",
            AdmissionRejection::Banned => "banned",
            AdmissionRejection::RangeBlocked => "range_blocked",
            AdmissionRejection::CountryBlocked => "country_blocked",
        }
    }
}

// ── WebSocket event contract ──

/// Client→server events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Submit a proof-of-work candidate.
    SolveChallenge { candidate: String },
    /// Enter the waiting queue (or pair immediately).
    FindMatch,
    /// Send a message to the current partner.
    SendMessage {
        text: String,
        #[serde(default)]
        ack: Option<u64>,
    },
    /// Typing indicator update.
    Typing { is_typing: bool },
    /// Report the current partner.
    ReportUser,
    /// Leave the current chat.
    LeaveChat {
        #[serde(default)]
        ack: Option<u64>,
    },
}

/// Server→client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Challenge { prefix: String, difficulty: u32 },
    ChallengeSuccess,
    Searching,
    Matched { room_id: Uuid },
    Message { text: String },
    MessageBatch { messages: Vec<BatchedMessage> },
    PartnerTyping { is_typing: bool },
    PartnerLeft,
    SoftError { message: String },
    Banned { reason: String },
    Ack { id: u64 },
    OnlineCount { count: usize },
    Shutdown { message: String },
}

/// One entry of a `MessageBatch` delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchedMessage {
    pub text: String,
}

// ── REST payloads ──

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Live counters exposed at `/stats`
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub online: usize,
    pub waiting: usize,
    pub active_pairs: usize,
}

/// Error payload for REST rejections
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// Admin: create a filter rule
#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    pub severity: u8,
}

/// Admin: add a whitelist phrase
#[derive(Debug, Deserialize)]
pub struct CreatePhraseRequest {
    pub phrase: String,
}

/// Admin: add a blocked CIDR range
#[derive(Debug, Deserialize)]
pub struct CreateRangeRequest {
    pub cidr: String,
}
