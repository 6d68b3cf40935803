//! Observable match events.

use crate::ids::PlayerId;
use crate::participant::PlayerStatus;
use crate::state::{GameState, Phase};
use std::sync::Arc;

/// Events a match publishes to spectators and transport layers.
///
/// `PhaseChanged` and `GameOver` are sent only after the state they
/// describe has been updated.
#[derive(Debug, Clone, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum MatchEvent {
    /// A participant joined (or replaced a participant with the same id).
    ParticipantRegistered {
        /// Joining participant.
        player: PlayerId,
    },
    /// Something that affects readiness changed.
    StatusChanged,
    /// The ready predicate held while organizing.
    Ready,
    /// The turn loop started.
    Begin,
    /// A participant produced a move (before validation).
    MoveMade {
        /// Moving participant.
        player: PlayerId,
        /// Zero-based turn counter.
        turn: u32,
    },
    /// The rule reported a refused move.
    ValidationFailed {
        /// Rule-supplied reason.
        reason: String,
    },
    /// Finalization completed.
    #[strum(serialize = "gameover")]
    GameOver {
        /// Final game state.
        state: Arc<GameState>,
    },
    /// The phase changed.
    PhaseChanged {
        /// New phase.
        phase: Phase,
    },
    /// A participant published a new status.
    ParticipantStatusChanged {
        /// Participant whose status changed.
        player: PlayerId,
        /// New status.
        status: PlayerStatus,
    },
}

impl MatchEvent {
    /// Kebab-case event name, e.g. `"move-made"`.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(MatchEvent::StatusChanged.name(), "status-changed");
        assert_eq!(
            MatchEvent::MoveMade { player: PlayerId::new("p1"), turn: 0 }.name(),
            "move-made"
        );
        assert_eq!(
            MatchEvent::PhaseChanged { phase: Phase::Running }.name(),
            "phase-changed"
        );
        let state = Arc::new(GameState::new(
            crate::ids::GameId::new("g1"),
            "scripted".to_string(),
            Arc::default(),
        ));
        assert_eq!(MatchEvent::GameOver { state }.name(), "gameover");
    }
}
