//! Rule capability.
//!
//! A rule is the pluggable game logic behind a match. Hooks return business
//! outcomes as values ([`Readiness`], [`Continuation`], `bool`) and reserve
//! `Err` for unexpected faults, so the two are never conflated.

use crate::engine::MatchEngine;
use crate::ids::{GameId, PlayerId};
use crate::state::{GameState, MatchState, MoveEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Weak;
use tracing::{debug, instrument};

/// Answer of the pre-requirement check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Readiness {
    /// The game may begin.
    ShallBegin,
    /// Keep organizing.
    ShallWait,
}

/// Answer of the post-move check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Continuation {
    /// Keep playing.
    ShallContinue,
    /// End the game now.
    ShallOver,
}

/// Status a rule exposes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum RuleStatus {
    /// Able to run a game.
    Ready,
    /// Backing service unavailable.
    Offline,
}

/// Game logic driving one match.
///
/// One instance serves exactly one game. Private fields of the
/// implementation are invisible to participants.
#[async_trait::async_trait]
pub trait GameRule: Send + Sync {
    /// Receives the binding to its game. Called exactly once, right after
    /// construction.
    fn bind(&mut self, _binding: RuleBinding) {}

    /// Current status.
    fn status(&self) -> RuleStatus {
        RuleStatus::Ready
    }

    /// Whether the rule's own setup is complete. Rules without a setup
    /// phase keep the default.
    async fn is_ready(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Decides whether the registered participants suffice to begin.
    ///
    /// Must be free of side effects; it is re-evaluated on every status change.
    async fn validate_pre_requirements(&self, game: &GameState) -> anyhow::Result<Readiness>;

    /// Prepares the match state before the first turn.
    async fn init(&mut self, state: &mut MatchState) -> anyhow::Result<()>;

    /// Whether `envelope` is a legal move in `state`.
    async fn validate_move(&self, state: &MatchState, envelope: &MoveEnvelope) -> anyhow::Result<bool>;

    /// Applies a validated move to `state`.
    async fn accept_move(&mut self, state: &mut MatchState, envelope: &MoveEnvelope) -> anyhow::Result<()>;

    /// Decides whether the game goes on after `envelope` was accepted.
    async fn validate_post_requirements(
        &self,
        state: &MatchState,
        envelope: &MoveEnvelope,
    ) -> anyhow::Result<Continuation>;
}

/// Creates a fresh rule for each new game.
pub trait RuleFactory: Send + Sync {
    /// Makes the rule instance for `game_id`.
    fn make(&self, game_id: &GameId) -> Box<dyn GameRule>;
}

impl<F> RuleFactory for F
where
    F: Fn(&GameId) -> Box<dyn GameRule> + Send + Sync,
{
    fn make(&self, game_id: &GameId) -> Box<dyn GameRule> {
        self(game_id)
    }
}

/// Factory for rules that need no per-game wiring.
pub struct DefaultFactory<R> {
    _rule: PhantomData<fn() -> R>,
}

impl<R> DefaultFactory<R> {
    /// Creates the factory.
    pub fn new() -> Self {
        Self { _rule: PhantomData }
    }
}

impl<R> Default for DefaultFactory<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> RuleFactory for DefaultFactory<R>
where
    R: GameRule + Default + 'static,
{
    fn make(&self, _game_id: &GameId) -> Box<dyn GameRule> {
        Box::new(R::default())
    }
}

/// A rule's connection to the game it serves.
///
/// Only the engine can create one, and it hands it out once per game.
#[derive(Debug, Clone)]
pub struct RuleBinding {
    game_id: GameId,
    engine: Weak<MatchEngine>,
}

impl RuleBinding {
    pub(crate) fn new(game_id: GameId, engine: Weak<MatchEngine>) -> Self {
        Self { game_id, engine }
    }

    /// Game this rule is bound to.
    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    /// Tells the engine the rule became ready; readiness is re-evaluated.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub fn announce_ready(&self) {
        if let Some(engine) = self.engine.upgrade() {
            debug!("Rule announced readiness");
            engine.signal_status_changed();
        }
    }

    /// Reports a refused move to event subscribers.
    #[instrument(skip(self, reason), fields(game_id = %self.game_id))]
    pub fn validation_failed(&self, reason: impl Into<String>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.report_validation_failure(reason.into());
        }
    }

    /// Records the winner in the game state.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub fn declare_winner(&self, winner: PlayerId) {
        if let Some(engine) = self.engine.upgrade() {
            engine.record_winner(winner);
        }
    }

    /// Records a description of the final position in the game state.
    #[instrument(skip(self, context), fields(game_id = %self.game_id))]
    pub fn set_gameover_context(&self, context: Value) {
        if let Some(engine) = self.engine.upgrade() {
            engine.record_gameover_context(context);
        }
    }

    /// Snapshot of the bound game, while it is alive.
    pub fn game_state(&self) -> Option<GameState> {
        self.engine.upgrade().map(|engine| engine.game_state())
    }
}
