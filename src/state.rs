//! Conversation state owned by the turn state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Conversation states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    /// Nothing in progress
    Idle,
    /// Capturing the user's utterance
    Listening,
    /// Transcribing and generating a reply
    Processing,
    /// Assistant reply is playing
    Speaking,
    /// Reserved; the engine never enters it
    Waiting,
    /// User barged in, waiting out the grace delay
    Interrupted,
    /// A collaborator failed; the turn is over
    Error,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifier tagging every asynchronous result with the turn it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// One active conversation
#[derive(Debug)]
pub struct TurnSession {
    state: TurnState,
    turn_count: u64,
    current_turn_id: TurnId,
    next_turn_id: u64,
    started_at: Instant,
    turn_started_at: Option<Instant>,
    last_activity_at: Instant,
}

impl TurnSession {
    pub fn new(now: Instant) -> Self {
        Self {
            state: TurnState::Idle,
            turn_count: 0,
            current_turn_id: TurnId(0),
            next_turn_id: 1,
            started_at: now,
            turn_started_at: None,
            last_activity_at: now,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn current_turn_id(&self) -> TurnId {
        self.current_turn_id
    }

    pub fn turn_started_at(&self) -> Option<Instant> {
        self.turn_started_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// Milliseconds since the session started
    pub fn offset_ms(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.started_at).as_millis() as u64
    }

    pub fn is_current(&self, turn_id: TurnId) -> bool {
        self.current_turn_id == turn_id
    }

    pub(crate) fn set_state(&mut self, state: TurnState, now: Instant) {
        self.state = state;
        self.last_activity_at = now;
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity_at = now;
    }

    /// Retire the current turn id; anything still tagged with it becomes stale
    pub(crate) fn advance_turn(&mut self, now: Instant) -> TurnId {
        self.current_turn_id = TurnId(self.next_turn_id);
        self.next_turn_id += 1;
        self.turn_started_at = Some(now);
        self.current_turn_id
    }

    pub(crate) fn complete_turn(&mut self) {
        self.turn_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_turn_retires_previous_id() {
        let now = Instant::now();
        let mut session = TurnSession::new(now);
        let first = session.advance_turn(now);
        let second = session.advance_turn(now);
        assert_ne!(first, second);
        assert!(session.is_current(second));
        assert!(!session.is_current(first));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&TurnState::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }
}
