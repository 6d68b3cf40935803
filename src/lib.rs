//! Strictly Arena library - a host for turn-based games
//!
//! A game is played under a pluggable [`GameRule`] by any number of
//! [`Participant`]s. The engine owns the lifecycle: it waits until the rule
//! and every participant are ready, runs the turn loop in registration order
//! and finalizes the game exactly once.
//!
//! # Architecture
//!
//! - **Registry**: named rule factories and the games created from them
//! - **Engine**: phase machine, readiness transition and turn loop
//! - **Rule**: validation and state-change hooks supplied by the game author
//! - **Participant**: anything that can produce a move (bot, remote client)
//! - **Deadlines**: per-step time limits
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strictly_arena::testing::{Journal, ScriptedPlayer, ScriptedRule};
//! use strictly_arena::{GameId, GameRule, MatchConfig, Registry};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Registry::new(MatchConfig::default());
//! let journal = Journal::new();
//!
//! let rule_journal = journal.clone();
//! registry.register_rule("counting", move |_: &GameId| {
//!     Box::new(ScriptedRule::new(rule_journal.clone()).with_over_after(3)) as Box<dyn GameRule>
//! });
//!
//! let game = registry.new_game("counting")?;
//! game.register_participant(Arc::new(ScriptedPlayer::new("p1", journal.clone()).ready()))
//!     .await?;
//!
//! let final_state = game.wait_finished().await;
//! println!("{:?}", final_state.ending());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Private module declarations
mod config;
mod deadline;
mod engine;
mod error;
mod events;
mod ids;
mod participant;
mod registry;
mod rule;
mod state;

pub mod testing;

// Crate-level exports - Identifiers
pub use ids::{GameId, PlayerId};

// Crate-level exports - Errors
pub use error::{MatchError, MatchErrorKind};

// Crate-level exports - Configuration
pub use config::{
    ConfigError, DeadlineConfig, ENV_AUTO_BEGIN, ENV_MAX_TURNS, ENV_THINK_MS, MAX_EVENT_CAPACITY,
    MatchConfig,
};
pub use deadline::{Deadlines, Step};

// Crate-level exports - Game state
pub use state::{
    Ending, GameState, MatchState, MatchView, MoveEnvelope, Outcome, Phase, SharedMatchState,
};

// Crate-level exports - Capabilities
pub use participant::{Participant, PlayerStatus, StatusCell};
pub use rule::{
    Continuation, DefaultFactory, GameRule, Readiness, RuleBinding, RuleFactory, RuleStatus,
};

// Crate-level exports - Hosting
pub use engine::{MatchBrief, MatchEngine};
pub use events::MatchEvent;
pub use registry::Registry;
