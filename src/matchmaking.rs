//! Waiting-queue pairing engine
//!
//! Owns the waiting queue, the per-session match locks and the room table,
//! all behind one mutex so every pairing step runs as an uninterrupted
//! critical section. Anything read before an await is re-validated after:
//! the post-join verification exists because another handler may have torn a
//! candidate down between two sections.
//!
//! Ordering is approximate FIFO. A candidate found lock-held by a concurrent
//! pairing attempt is requeued at the tail rather than waited on, so strict
//! arrival order is not guaranteed under load.

use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics;
use crate::models::ServerEvent;
use crate::rate_limit::ActionType;
use crate::session::{self, SessionState, SessionUpdate};
use crate::state::{now_millis, AppState};

#[derive(Debug, Default)]
struct MatchState {
    /// FIFO of sessions waiting for a partner. No duplicate ids.
    queue: VecDeque<Uuid>,
    /// Sessions with a pairing attempt in flight.
    locks: HashSet<Uuid>,
    /// Room id → members. Always exactly two once a pair commits.
    rooms: HashMap<Uuid, Vec<Uuid>>,
}

#[derive(Debug, Default)]
pub struct MatchmakingEngine {
    inner: Mutex<MatchState>,
}

enum Claim {
    Requeued,
    Joined(Uuid),
}

impl MatchmakingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to pair a session, entering the waiting queue on failure.
    ///
    /// Precondition failures are silent no-ops or a soft rejection — this
    /// path never surfaces an error to the caller.
    pub async fn find_match(&self, state: &AppState, session_id: Uuid) {
        // Preconditions, all read in one section.
        let identity = {
            let sessions = state.sessions.read().await;
            let Some(s) = sessions.get(&session_id) else {
                return;
            };
            if !s.verified || s.state == SessionState::Chatting {
                return;
            }
            // Cooldown after a successful match is a silent no-op.
            let now = now_millis();
            if s.last_match_at != 0
                && now.saturating_sub(s.last_match_at)
                    < state.config.match_cooldown.as_millis() as u64
            {
                return;
            }
            s.identity_hash.clone()
        };

        if self.inner.lock().await.locks.contains(&session_id) {
            return;
        }

        if state
            .rate_limiter
            .check(&identity, ActionType::FindMatch)
            .await
            .is_err()
        {
            state
                .send_to_session(
                    session_id,
                    &ServerEvent::SoftError {
                        message: "Searching too often, slow down".to_string(),
                    },
                )
                .await;
            return;
        }

        // Reset prior pairing remnants and mark the session waiting.
        {
            let mut sessions = state.sessions.write().await;
            session::transition(
                &mut sessions,
                session_id,
                SessionState::Waiting,
                SessionUpdate {
                    partner_id: Some(None),
                    room_id: Some(None),
                    search_started_at: Some(Some(now_millis())),
                    ..Default::default()
                },
            );
        }

        {
            let mut inner = self.inner.lock().await;
            if !inner.locks.insert(session_id) {
                return;
            }
        }

        let mut attempts = 0;
        while attempts < state.config.match_attempts {
            attempts += 1;

            let candidate = {
                let mut inner = self.inner.lock().await;
                let c = inner.queue.pop_front();
                metrics::QUEUE_LENGTH_GAUGE.set(inner.queue.len() as i64);
                c
            };
            let Some(candidate) = candidate else {
                break;
            };

            if candidate == session_id {
                continue;
            }

            // Stale candidates (gone, not waiting, already paired, or
            // disconnected) are discarded, not requeued.
            let candidate_live = {
                let sessions = state.sessions.read().await;
                let connections = state.connections.read().await;
                sessions
                    .get(&candidate)
                    .map(|c| {
                        c.state == SessionState::Waiting
                            && c.partner_id.is_none()
                            && connections.contains_key(&candidate)
                    })
                    .unwrap_or(false)
            };
            if !candidate_live {
                debug!(candidate = %candidate, "discarding stale queue entry");
                continue;
            }

            // Claim the candidate and join both into a fresh room, in one
            // critical section. A lock-held candidate goes back to the tail.
            let claim = {
                let mut inner = self.inner.lock().await;
                if inner.locks.contains(&candidate) {
                    if !inner.queue.contains(&candidate) {
                        inner.queue.push_back(candidate);
                    }
                    Claim::Requeued
                } else {
                    inner.locks.insert(candidate);
                    let room_id = Uuid::new_v4();
                    inner.rooms.insert(room_id, vec![session_id, candidate]);
                    Claim::Joined(room_id)
                }
            };
            let room_id = match claim {
                Claim::Requeued => continue,
                Claim::Joined(room_id) => room_id,
            };

            // Post-join verification: both ends still connected and the
            // room holds exactly two members. State may have shifted since
            // the candidate check above.
            let verified = {
                let connections = state.connections.read().await;
                let inner = self.inner.lock().await;
                connections.contains_key(&session_id)
                    && connections.contains_key(&candidate)
                    && inner.rooms.get(&room_id).map(|m| m.len()) == Some(2)
            };

            // Capture search starts before the commit clears them.
            let search_starts = {
                let sessions = state.sessions.read().await;
                [session_id, candidate].map(|id| {
                    sessions.get(&id).and_then(|s| s.search_started_at)
                })
            };

            let committed = verified && {
                let mut sessions = state.sessions.write().await;
                let now = now_millis();
                let own = session::transition(
                    &mut sessions,
                    session_id,
                    SessionState::Chatting,
                    SessionUpdate {
                        partner_id: Some(Some(candidate)),
                        room_id: Some(Some(room_id)),
                        last_match_at: Some(now),
                        search_started_at: Some(None),
                        ..Default::default()
                    },
                );
                let theirs = own
                    && session::transition(
                        &mut sessions,
                        candidate,
                        SessionState::Chatting,
                        SessionUpdate {
                            partner_id: Some(Some(session_id)),
                            room_id: Some(Some(room_id)),
                            last_match_at: Some(now),
                            search_started_at: Some(None),
                            ..Default::default()
                        },
                    );
                if own && !theirs {
                    // Undo the half-applied side before rolling back.
                    session::transition(
                        &mut sessions,
                        session_id,
                        SessionState::Waiting,
                        SessionUpdate::clear_pairing(),
                    );
                }
                own && theirs
            };

            if !committed {
                self.rollback(state, room_id, session_id, candidate).await;
                return;
            }

            let now = now_millis();
            for start in search_starts.into_iter().flatten() {
                metrics::MATCH_LATENCY.observe(now.saturating_sub(start) as f64 / 1000.0);
            }

            {
                let mut inner = self.inner.lock().await;
                inner.locks.remove(&session_id);
                inner.locks.remove(&candidate);
                metrics::ACTIVE_PAIRS_GAUGE.set(inner.rooms.len() as i64);
            }

            info!(a = %session_id, b = %candidate, room = %room_id, "paired");
            let matched = ServerEvent::Matched { room_id };
            state.send_to_session(session_id, &matched).await;
            state.send_to_session(candidate, &matched).await;
            return;
        }

        // Nobody suitable: enter the queue at the tail, once.
        {
            let mut inner = self.inner.lock().await;
            if !inner.queue.contains(&session_id) {
                inner.queue.push_back(session_id);
            }
            inner.locks.remove(&session_id);
            metrics::QUEUE_LENGTH_GAUGE.set(inner.queue.len() as i64);
        }
        state
            .send_to_session(session_id, &ServerEvent::Searching)
            .await;
    }

    /// Undo a failed pairing: leave the room, release both locks, requeue
    /// both sessions and let the clients keep searching silently.
    async fn rollback(&self, state: &AppState, room_id: Uuid, a: Uuid, b: Uuid) {
        debug!(room = %room_id, "rolling back failed pairing");
        {
            let mut inner = self.inner.lock().await;
            inner.rooms.remove(&room_id);
            inner.locks.remove(&a);
            inner.locks.remove(&b);
            for id in [a, b] {
                if !inner.queue.contains(&id) {
                    inner.queue.push_back(id);
                }
            }
            metrics::QUEUE_LENGTH_GAUGE.set(inner.queue.len() as i64);
        }
        {
            let mut sessions = state.sessions.write().await;
            for id in [a, b] {
                session::transition(
                    &mut sessions,
                    id,
                    SessionState::Waiting,
                    SessionUpdate::clear_pairing(),
                );
            }
        }
        state.send_to_session(a, &ServerEvent::Searching).await;
        state.send_to_session(b, &ServerEvent::Searching).await;
    }

    /// Remove a session from the queue and release its lock.
    pub async fn forget(&self, session_id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner.queue.retain(|id| *id != session_id);
        inner.locks.remove(&session_id);
        metrics::QUEUE_LENGTH_GAUGE.set(inner.queue.len() as i64);
    }

    /// Release a room. Called from the shared leave/disconnect cleanup.
    pub async fn remove_room(&self, room_id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner.rooms.remove(&room_id);
        metrics::ACTIVE_PAIRS_GAUGE.set(inner.rooms.len() as i64);
    }

    pub async fn room_members(&self, room_id: Uuid) -> Vec<Uuid> {
        let inner = self.inner.lock().await;
        inner.rooms.get(&room_id).cloned().unwrap_or_default()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn active_pairs(&self) -> usize {
        self.inner.lock().await.rooms.len()
    }

    #[cfg(test)]
    pub async fn install_room(&self, room_id: Uuid, members: Vec<Uuid>) {
        self.inner.lock().await.rooms.insert(room_id, members);
    }

    #[cfg(test)]
    pub async fn queue_contains(&self, session_id: Uuid) -> bool {
        self.inner.lock().await.queue.contains(&session_id)
    }

    #[cfg(test)]
    pub async fn hold_lock(&self, session_id: Uuid) {
        self.inner.lock().await.locks.insert(session_id);
    }

    #[cfg(test)]
    pub async fn release_lock(&self, session_id: Uuid) {
        self.inner.lock().await.locks.remove(&session_id);
    }
}
