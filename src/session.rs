//! Session lifecycle state machine
//!
//! Every session is in exactly one of four states. Transition legality is a
//! fixed table; an illegal request is logged and leaves the session untouched
//! rather than surfacing an error to the caller.

use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use crate::models::Session;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Admitted, proof-of-work still outstanding.
    Challenging,
    /// Verified, not searching.
    Idle,
    /// In the waiting queue.
    Waiting,
    /// Paired in a room.
    Chatting,
}

/// Whether `from → to` is a legal transition.
pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match from {
        Challenging => matches!(to, Idle),
        Idle => matches!(to, Waiting | Idle),
        Waiting => matches!(to, Chatting | Idle | Waiting),
        Chatting => matches!(to, Idle | Waiting | Chatting),
    }
}

/// Fields to merge into a session alongside a transition.
///
/// Shallow merge: only fields that are `Some` are written. The double
/// `Option` on clearable fields distinguishes "leave alone" from "set to
/// None".
#[derive(Debug, Default, Clone)]
pub struct SessionUpdate {
    pub partner_id: Option<Option<Uuid>>,
    pub room_id: Option<Option<Uuid>>,
    pub verified: Option<bool>,
    pub last_match_at: Option<u64>,
    pub search_started_at: Option<Option<u64>>,
    pub typing: Option<bool>,
}

impl SessionUpdate {
    /// Update that clears all pairing remnants.
    pub fn clear_pairing() -> Self {
        Self {
            partner_id: Some(None),
            room_id: Some(None),
            typing: Some(false),
            ..Default::default()
        }
    }
}

/// Apply a transition to a session in the table.
///
/// Returns `true` when the transition was legal and applied. An unknown id
/// or an illegal transition is a no-op.
pub fn transition(
    sessions: &mut HashMap<Uuid, Session>,
    id: Uuid,
    new_state: SessionState,
    update: SessionUpdate,
) -> bool {
    let Some(session) = sessions.get_mut(&id) else {
        warn!(session = %id, "transition requested for unknown session");
        return false;
    };

    if !can_transition(session.state, new_state) {
        warn!(
            session = %id,
            from = ?session.state,
            to = ?new_state,
            "illegal transition ignored"
        );
        return false;
    }

    session.state = new_state;
    if let Some(partner_id) = update.partner_id {
        session.partner_id = partner_id;
    }
    if let Some(room_id) = update.room_id {
        session.room_id = room_id;
    }
    if let Some(verified) = update.verified {
        session.verified = verified;
    }
    if let Some(last_match_at) = update.last_match_at {
        session.last_match_at = last_match_at;
    }
    if let Some(search_started_at) = update.search_started_at {
        session.search_started_at = search_started_at;
    }
    if let Some(typing) = update.typing {
        session.typing = typing;
    }
    true
}
