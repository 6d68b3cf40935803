//! Match state, move envelopes and the read-side game aggregate.

use crate::error::MatchError;
use crate::ids::{GameId, PlayerId};
use chrono::{DateTime, Utc};
use derive_getters::Getters;
use derive_new::new;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Authoritative, rule-owned game state.
///
/// Only the rule writes it (through `init` and `accept_move`); the engine
/// never mutates it and participants only ever see a [`MatchView`] copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchState(Map<String, Value>);

impl MatchState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a mutable reference to the value stored under `key`.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Removes `key`.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of top-level entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the state has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrows the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Reads an integer entry, treating absence as zero.
    pub fn counter(&self, key: &str) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(0)
    }
}

/// Handle to the single match state instance of one game.
pub type SharedMatchState = Arc<RwLock<MatchState>>;

/// Read-only snapshot handed to a participant when it is asked to move.
#[derive(Debug, Clone, Getters, new)]
pub struct MatchView {
    /// Game being played.
    game_id: GameId,
    /// Zero-based turn counter.
    turn: u32,
    /// Participant being asked.
    player: PlayerId,
    /// Copy of the match state at the time of asking.
    state: MatchState,
}

/// A submitted move plus rule-defined metadata.
///
/// On the wire an envelope is a JSON object that must carry a `"move"`
/// field; every other top-level field is kept as metadata.
#[derive(Debug, Clone, PartialEq, Getters, Serialize)]
pub struct MoveEnvelope {
    /// Participant that submitted the move.
    player: PlayerId,
    /// The move itself.
    payload: Value,
    /// Remaining envelope fields.
    metadata: Map<String, Value>,
}

impl MoveEnvelope {
    /// Name of the required payload field.
    pub const MOVE_FIELD: &'static str = "move";

    /// Parses a raw envelope submitted by `player`.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if `raw` is not an object or lacks the
    /// `"move"` field.
    #[track_caller]
    pub fn parse(player: PlayerId, raw: Value) -> Result<Self, MatchError> {
        let Value::Object(mut fields) = raw else {
            return Err(MatchError::protocol(player, "move envelope is not a JSON object"));
        };

        let Some(payload) = fields.remove(Self::MOVE_FIELD) else {
            return Err(MatchError::protocol(player, "move envelope has no \"move\" field"));
        };

        Ok(Self {
            player,
            payload,
            metadata: fields,
        })
    }

    /// Builds the wire form of an envelope around `payload`.
    pub fn wrap(payload: Value) -> Value {
        let mut fields = Map::new();
        fields.insert(Self::MOVE_FIELD.to_string(), payload);
        Value::Object(fields)
    }

    /// Looks up a metadata field.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Lifecycle phase of a match.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepting participants, waiting for readiness.
    Organizing,
    /// Turn loop in progress.
    Running,
    /// Finalized.
    GameOver,
    /// Set by whoever supervises `run()` after it returned a fault.
    Faulted,
}

/// How a match ended, as recorded in the [`GameState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ending {
    /// The rule signaled the end.
    Completed,
    /// An external abort was honored.
    Aborted {
        /// Caller-supplied reason.
        reason: String,
    },
    /// A fatal error ended the match.
    Faulted {
        /// Rendered error.
        error: String,
    },
}

impl Ending {
    /// Human-readable reason stored as the gameover reason.
    pub fn reason(&self) -> String {
        match self {
            Ending::Completed => "completed".to_string(),
            Ending::Aborted { reason } => reason.clone(),
            Ending::Faulted { error } => error.clone(),
        }
    }
}

/// Expected result of a finished run. Faults are returned as errors instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The rule ended the game.
    Completed {
        /// Winner declared by the rule, if any.
        winner: Option<PlayerId>,
    },
    /// The game was aborted externally.
    Aborted {
        /// Caller-supplied reason.
        reason: String,
    },
}

/// Read-side aggregate describing one game.
///
/// Snapshots are cheap to clone; every snapshot of a game shares the same
/// [`SharedMatchState`] handle.
#[derive(Debug, Clone, Getters, Serialize)]
pub struct GameState {
    /// Game identifier.
    game_id: GameId,
    /// Name the rule was registered under.
    rule: String,
    /// Participants in registration order, which is the turn order.
    players: Vec<PlayerId>,
    /// Phase at snapshot time.
    phase: Phase,
    /// Zero-based turn counter.
    turn: u32,
    /// Whether the game has ended.
    gameover: bool,
    /// Winner declared by the rule.
    winner: Option<PlayerId>,
    /// Why the game ended.
    gameover_reason: Option<String>,
    /// Rule-supplied description of the final position.
    gameover_context: Option<Value>,
    /// Termination cause.
    ending: Option<Ending>,
    /// When the turn loop began.
    started_at: Option<DateTime<Utc>>,
    /// When finalization ran.
    ended_at: Option<DateTime<Utc>>,
    /// The live match state.
    #[serde(skip)]
    match_state: SharedMatchState,
}

impl GameState {
    pub(crate) fn new(game_id: GameId, rule: String, match_state: SharedMatchState) -> Self {
        Self {
            game_id,
            rule,
            players: Vec::new(),
            phase: Phase::Organizing,
            turn: 0,
            gameover: false,
            winner: None,
            gameover_reason: None,
            gameover_context: None,
            ending: None,
            started_at: None,
            ended_at: None,
            match_state,
        }
    }

    /// Whether `player` takes part in this game.
    pub fn has_player(&self, player: &PlayerId) -> bool {
        self.players.contains(player)
    }

    pub(crate) fn players_mut(&mut self) -> &mut Vec<PlayerId> {
        &mut self.players
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn set_turn(&mut self, turn: u32) {
        self.turn = turn;
    }

    pub(crate) fn set_winner(&mut self, winner: PlayerId) {
        self.winner = Some(winner);
    }

    pub(crate) fn set_gameover_context(&mut self, context: Value) {
        self.gameover_context = Some(context);
    }

    pub(crate) fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_ended(&mut self, ending: Ending) {
        self.gameover = true;
        self.gameover_reason = Some(ending.reason());
        self.ending = Some(ending);
        self.ended_at = Some(Utc::now());
    }
}
