//! Per-pair message and typing relay
//!
//! Accepted messages are buffered per room for a short window so bursty
//! typing amortizes delivery overhead: the first message in an idle buffer
//! arms a flush timer, later arrivals join the batch. Typing indicators are
//! forwarded verbatim with a watchdog that force-clears a stuck indicator.
//!
//! Voluntary leave and involuntary disconnect share one cleanup path so the
//! partner is always notified and the room always released.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::metrics;
use crate::models::{BatchedMessage, ServerEvent};
use crate::rate_limit::ActionType;
use crate::session::{self, SessionState, SessionUpdate};
use crate::state::{now_millis, AppState, SharedState};
use crate::validation::validate_message_text;

#[derive(Debug, Clone)]
struct PendingMessage {
    sender: Uuid,
    text: String,
}

#[derive(Debug, Default)]
pub struct RelayEngine {
    /// Room id → messages awaiting the next flush.
    buffers: Mutex<HashMap<Uuid, Vec<PendingMessage>>>,
    /// Session id → stuck-typing watchdog task.
    typing_watchdogs: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl RelayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Messages ──

    /// Validate, moderate and buffer one outbound message.
    pub async fn send_message(
        &self,
        state: &SharedState,
        session_id: Uuid,
        text: &str,
        ack: Option<u64>,
    ) {
        let (room_id, identity, reputation, last_message_at) = {
            let sessions = state.sessions.read().await;
            match sessions.get(&session_id) {
                Some(s) if s.state == SessionState::Chatting && s.room_id.is_some() => (
                    s.room_id.unwrap(),
                    s.identity_hash.clone(),
                    s.reputation_score,
                    s.last_message_at,
                ),
                _ => return,
            }
        };

        let trimmed = match validate_message_text(text, state.config.max_message_chars) {
            Ok(t) => t.to_string(),
            Err(_) => return,
        };

        // Sub-interval messages are dropped without feedback.
        let now = now_millis();
        if last_message_at != 0
            && now.saturating_sub(last_message_at)
                < state.config.min_message_interval.as_millis() as u64
        {
            return;
        }

        if state
            .rate_limiter
            .check(&identity, ActionType::Message)
            .await
            .is_err()
        {
            state
                .send_to_session(
                    session_id,
                    &ServerEvent::SoftError {
                        message: "Sending too fast, slow down".to_string(),
                    },
                )
                .await;
            return;
        }

        let verdict = state
            .moderation
            .check_message(state, &trimmed, &identity, reputation)
            .await;
        if verdict.blocked {
            state
                .moderation
                .enforce(state, session_id, &trimmed, &verdict)
                .await;
            return;
        }

        {
            let mut sessions = state.sessions.write().await;
            if let Some(s) = sessions.get_mut(&session_id) {
                s.last_message_at = now;
            }
        }
        metrics::MESSAGES_SENT_TOTAL.inc();

        // First message in an idle buffer arms the flush timer; later
        // arrivals within the window join the batch.
        let arm_timer = {
            let mut buffers = state.relay.buffers.lock().await;
            let buffer = buffers.entry(room_id).or_default();
            buffer.push(PendingMessage {
                sender: session_id,
                text: trimmed,
            });
            buffer.len() == 1
        };
        if arm_timer {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(state.config.batch_window).await;
                state.relay.flush_room(&state, room_id).await;
            });
        }

        // "Accepted for relay", not "received by the partner".
        if let Some(id) = ack {
            state.send_to_session(session_id, &ServerEvent::Ack { id }).await;
        }
    }

    /// Deliver everything buffered for a room.
    async fn flush_room(&self, state: &AppState, room_id: Uuid) {
        let batch = {
            let mut buffers = self.buffers.lock().await;
            buffers.remove(&room_id).unwrap_or_default()
        };
        if batch.is_empty() {
            return;
        }

        for member in state.matchmaking.room_members(room_id).await {
            let inbound: Vec<&PendingMessage> =
                batch.iter().filter(|m| m.sender != member).collect();
            match inbound.len() {
                0 => {}
                1 => {
                    state
                        .send_to_session(
                            member,
                            &ServerEvent::Message {
                                text: inbound[0].text.clone(),
                            },
                        )
                        .await;
                }
                _ => {
                    state
                        .send_to_session(
                            member,
                            &ServerEvent::MessageBatch {
                                messages: inbound
                                    .iter()
                                    .map(|m| BatchedMessage {
                                        text: m.text.clone(),
                                    })
                                    .collect(),
                            },
                        )
                        .await;
                }
            }
        }
    }

    // ── Typing ──

    /// Forward a typing indicator, rate limited to one emission a second.
    pub async fn typing(&self, state: &SharedState, session_id: Uuid, is_typing: bool) {
        let (partner_id, identity) = {
            let sessions = state.sessions.read().await;
            match sessions.get(&session_id) {
                Some(s) if s.state == SessionState::Chatting => match s.partner_id {
                    Some(p) => (p, s.identity_hash.clone()),
                    None => return,
                },
                _ => return,
            }
        };

        if state
            .rate_limiter
            .check(&identity, ActionType::Typing)
            .await
            .is_err()
        {
            return;
        }

        {
            let mut sessions = state.sessions.write().await;
            if let Some(s) = sessions.get_mut(&session_id) {
                s.typing = is_typing;
            }
        }
        state
            .send_to_session(partner_id, &ServerEvent::PartnerTyping { is_typing })
            .await;

        self.cancel_typing_watchdog(session_id).await;
        if is_typing {
            // If the typer's process dies without signalling stop, the
            // partner's indicator would stick without this.
            let state = state.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(state.config.typing_watchdog).await;
                let still_typing = {
                    let sessions = state.sessions.read().await;
                    sessions
                        .get(&session_id)
                        .map(|s| {
                            s.typing
                                && s.state == SessionState::Chatting
                                && s.partner_id == Some(partner_id)
                        })
                        .unwrap_or(false)
                };
                if still_typing {
                    debug!(session = %session_id, "typing watchdog fired");
                    {
                        let mut sessions = state.sessions.write().await;
                        if let Some(s) = sessions.get_mut(&session_id) {
                            s.typing = false;
                        }
                    }
                    state
                        .send_to_session(
                            partner_id,
                            &ServerEvent::PartnerTyping { is_typing: false },
                        )
                        .await;
                }
                state.relay.typing_watchdogs.lock().await.remove(&session_id);
            });
            self.typing_watchdogs
                .lock()
                .await
                .insert(session_id, handle);
        }
    }

    pub async fn cancel_typing_watchdog(&self, session_id: Uuid) {
        if let Some(handle) = self.typing_watchdogs.lock().await.remove(&session_id) {
            handle.abort();
        }
    }

    // ── Leaving ──

    /// Voluntary leave. Shares the cleanup path with disconnects.
    pub async fn leave_chat(&self, state: &AppState, session_id: Uuid, ack: Option<u64>) {
        self.cleanup_pairing(state, session_id).await;
        state.matchmaking.forget(session_id).await;
        self.cancel_typing_watchdog(session_id).await;

        if let Some(id) = ack {
            state.send_to_session(session_id, &ServerEvent::Ack { id }).await;
        }
    }

    /// Notify the partner, return it to idle and release the room.
    ///
    /// Restores the pair-symmetry invariant: after this runs, neither side
    /// points at the other.
    pub async fn cleanup_pairing(&self, state: &AppState, session_id: Uuid) {
        let (partner_id, room_id) = {
            let sessions = state.sessions.read().await;
            match sessions.get(&session_id) {
                Some(s) if s.state == SessionState::Chatting => (s.partner_id, s.room_id),
                _ => (None, None),
            }
        };

        if let Some(room_id) = room_id {
            state.matchmaking.remove_room(room_id).await;
            // Undelivered buffered messages die with the room.
            self.buffers.lock().await.remove(&room_id);
        }

        if let Some(partner_id) = partner_id {
            self.cancel_typing_watchdog(partner_id).await;
            state
                .send_to_session(partner_id, &ServerEvent::PartnerLeft)
                .await;
            let mut sessions = state.sessions.write().await;
            session::transition(
                &mut sessions,
                partner_id,
                SessionState::Idle,
                SessionUpdate::clear_pairing(),
            );
        }

        let mut sessions = state.sessions.write().await;
        session::transition(
            &mut sessions,
            session_id,
            SessionState::Idle,
            SessionUpdate::clear_pairing(),
        );
    }
}
