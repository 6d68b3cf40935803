//! Scripted rules and players for tests and simulations.
//!
//! [`ScriptedRule`] counts accepted moves in the match state and ends the
//! game after a configured number of them. [`ScriptedPlayer`] answers every
//! request with a sequence-numbered move. Both write what happened into a
//! shared [`Journal`] so tests can assert on ordering.

use crate::ids::PlayerId;
use crate::participant::{Participant, PlayerStatus, StatusCell};
use crate::rule::{Continuation, GameRule, Readiness, RuleBinding, RuleStatus};
use crate::state::{GameState, MatchState, MatchView, MoveEnvelope};
use serde_json::{Value, json};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, instrument};

/// Match state key holding the number of accepted moves.
pub const MOVES_KEY: &str = "moves";
/// Match state key holding the accepted move history.
pub const HISTORY_KEY: &str = "history";

/// Something that happened during a scripted match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Pre-requirements were evaluated.
    PreRequirements,
    /// The rule initialized the match state.
    Init,
    /// A participant was asked for a move.
    Asked {
        /// Asked participant.
        player: PlayerId,
        /// Zero-based turn.
        turn: u32,
    },
    /// A move was validated.
    Validated(PlayerId),
    /// A move was accepted.
    Accepted(PlayerId),
    /// The post-move check ran.
    PostChecked(PlayerId),
    /// A participant was told the game ended.
    Notified(PlayerId),
}

/// Shared, append-only record of [`Entry`] values.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Journal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry`.
    pub fn push(&self, entry: Entry) {
        self.lock().push(entry);
    }

    /// Copy of every entry so far.
    pub fn entries(&self) -> Vec<Entry> {
        self.lock().clone()
    }

    /// Participants asked for a move, with the turn, in asking order.
    pub fn asked(&self) -> Vec<(PlayerId, u32)> {
        self.lock()
            .iter()
            .filter_map(|entry| match entry {
                Entry::Asked { player, turn } => Some((player.clone(), *turn)),
                _ => None,
            })
            .collect()
    }

    /// Participants whose moves were accepted, in order.
    pub fn accepted(&self) -> Vec<PlayerId> {
        self.lock()
            .iter()
            .filter_map(|entry| match entry {
                Entry::Accepted(player) => Some(player.clone()),
                _ => None,
            })
            .collect()
    }

    /// Participants notified of the game end, in order.
    pub fn notified(&self) -> Vec<PlayerId> {
        self.lock()
            .iter()
            .filter_map(|entry| match entry {
                Entry::Notified(player) => Some(player.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of entries equal to `entry`.
    pub fn count(&self, entry: &Entry) -> usize {
        self.lock().iter().filter(|e| *e == entry).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rule hooks a [`ScriptedRule`] can be told to fail or stall in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// `init`.
    Init,
    /// `validate_move`.
    Validate,
    /// `accept_move`.
    Accept,
    /// `validate_post_requirements`.
    Post,
}

/// Remote control for a [`ScriptedRule`]'s own readiness.
#[derive(Debug, Clone, Default)]
pub struct RuleSwitch {
    ready: Arc<AtomicBool>,
    binding: Arc<Mutex<Option<RuleBinding>>>,
}

impl RuleSwitch {
    /// A switch that starts in the given position.
    pub fn new(ready: bool) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(ready)),
            binding: Arc::default(),
        }
    }

    /// Whether the rule reports itself ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Flips the rule to ready and announces it to the bound game.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        let binding = self.binding.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(binding) = binding {
            binding.announce_ready();
        }
    }

    /// Flips the rule to ready without notifying the game. The change is
    /// seen on the next readiness evaluation.
    pub fn set_ready_quietly(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    fn attach(&self, binding: RuleBinding) {
        *self.binding.lock().unwrap_or_else(PoisonError::into_inner) = Some(binding);
    }
}

/// Rule that ends the game after a number of accepted moves.
#[derive(Debug)]
pub struct ScriptedRule {
    journal: Journal,
    switch: RuleSwitch,
    over_after: Option<u64>,
    min_players: usize,
    rejected: Option<PlayerId>,
    stall: Option<(Hook, Duration)>,
    failure: Option<Hook>,
    declares_winner: bool,
    binding: Option<RuleBinding>,
}

impl ScriptedRule {
    /// A ready rule that never ends the game and needs one participant.
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            switch: RuleSwitch::new(true),
            over_after: None,
            min_players: 1,
            rejected: None,
            stall: None,
            failure: None,
            declares_winner: false,
            binding: None,
        }
    }

    /// Ends the game once `moves` moves have been accepted in total.
    pub fn with_over_after(mut self, moves: u64) -> Self {
        self.over_after = Some(moves);
        self
    }

    /// Begins only once at least `count` participants registered.
    pub fn with_min_players(mut self, count: usize) -> Self {
        self.min_players = count;
        self
    }

    /// Refuses every move `player` makes.
    pub fn rejecting(mut self, player: impl Into<PlayerId>) -> Self {
        self.rejected = Some(player.into());
        self
    }

    /// Sleeps for `delay` inside `hook`.
    pub fn stalling_at(mut self, hook: Hook, delay: Duration) -> Self {
        self.stall = Some((hook, delay));
        self
    }

    /// Makes `hook` return an error.
    pub fn failing_at(mut self, hook: Hook) -> Self {
        self.failure = Some(hook);
        self
    }

    /// Declares the last mover the winner when the game ends.
    pub fn declaring_winner(mut self) -> Self {
        self.declares_winner = true;
        self
    }

    /// Puts the rule's own readiness under `switch`.
    pub fn with_switch(mut self, switch: RuleSwitch) -> Self {
        self.switch = switch;
        self
    }

    async fn enter(&self, hook: Hook) -> anyhow::Result<()> {
        if let Some((stalled, delay)) = self.stall {
            if stalled == hook {
                tokio::time::sleep(delay).await;
            }
        }
        if self.failure == Some(hook) {
            anyhow::bail!("scripted failure in {:?}", hook);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl GameRule for ScriptedRule {
    fn bind(&mut self, binding: RuleBinding) {
        debug!(game_id = %binding.game_id(), "Scripted rule bound");
        self.switch.attach(binding.clone());
        self.binding = Some(binding);
    }

    fn status(&self) -> RuleStatus {
        if self.switch.is_ready() {
            RuleStatus::Ready
        } else {
            RuleStatus::Offline
        }
    }

    async fn is_ready(&self) -> anyhow::Result<bool> {
        Ok(self.switch.is_ready())
    }

    async fn validate_pre_requirements(&self, game: &GameState) -> anyhow::Result<Readiness> {
        self.journal.push(Entry::PreRequirements);
        if game.players().len() >= self.min_players {
            Ok(Readiness::ShallBegin)
        } else {
            Ok(Readiness::ShallWait)
        }
    }

    #[instrument(skip_all)]
    async fn init(&mut self, state: &mut MatchState) -> anyhow::Result<()> {
        self.enter(Hook::Init).await?;
        self.journal.push(Entry::Init);
        state.insert(MOVES_KEY, json!(0));
        state.insert(HISTORY_KEY, json!([]));
        Ok(())
    }

    async fn validate_move(&self, _state: &MatchState, envelope: &MoveEnvelope) -> anyhow::Result<bool> {
        self.enter(Hook::Validate).await?;
        self.journal.push(Entry::Validated(envelope.player().clone()));

        if self.rejected.as_ref() == Some(envelope.player()) {
            if let Some(binding) = &self.binding {
                binding.validation_failed(format!("{} may not move", envelope.player()));
            }
            return Ok(false);
        }

        Ok(true)
    }

    async fn accept_move(&mut self, state: &mut MatchState, envelope: &MoveEnvelope) -> anyhow::Result<()> {
        self.enter(Hook::Accept).await?;
        self.journal.push(Entry::Accepted(envelope.player().clone()));

        let moves = state.counter(MOVES_KEY) + 1;
        state.insert(MOVES_KEY, json!(moves));

        let record = json!({ "player": envelope.player(), "move": envelope.payload() });
        match state.get_mut(HISTORY_KEY) {
            Some(Value::Array(history)) => history.push(record),
            _ => {
                state.insert(HISTORY_KEY, json!([record]));
            }
        }

        Ok(())
    }

    async fn validate_post_requirements(
        &self,
        state: &MatchState,
        envelope: &MoveEnvelope,
    ) -> anyhow::Result<Continuation> {
        self.enter(Hook::Post).await?;
        self.journal.push(Entry::PostChecked(envelope.player().clone()));

        let moves = state.counter(MOVES_KEY);
        let over = self.over_after.is_some_and(|limit| moves >= limit);
        if !over {
            return Ok(Continuation::ShallContinue);
        }

        if let Some(binding) = &self.binding {
            if self.declares_winner {
                binding.declare_winner(envelope.player().clone());
            }
            binding.set_gameover_context(json!({ "moves": moves }));
        }

        Ok(Continuation::ShallOver)
    }
}

type MoveHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Bot that answers every request with a numbered move.
pub struct ScriptedPlayer {
    id: PlayerId,
    status: StatusCell,
    journal: Journal,
    think_time: Duration,
    omits_move_field: bool,
    failure: Option<String>,
    on_move: Option<MoveHook>,
    moves: AtomicU32,
    final_state: Mutex<Option<GameState>>,
}

impl ScriptedPlayer {
    /// A player that is not ready yet.
    pub fn new(id: impl Into<PlayerId>, journal: Journal) -> Self {
        Self {
            id: id.into(),
            status: StatusCell::default(),
            journal,
            think_time: Duration::ZERO,
            omits_move_field: false,
            failure: None,
            on_move: None,
            moves: AtomicU32::new(0),
            final_state: Mutex::new(None),
        }
    }

    /// Starts out ready.
    pub fn ready(self) -> Self {
        self.status.set(PlayerStatus::Ready);
        self
    }

    /// Sleeps for `think_time` before answering.
    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    /// Answers with an envelope lacking the `"move"` field.
    pub fn omitting_move_field(mut self) -> Self {
        self.omits_move_field = true;
        self
    }

    /// Fails every move request with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Calls `hook` with the 1-based move count after every move produced.
    pub fn on_move(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_move = Some(Arc::new(hook));
        self
    }

    /// Publishes a new status.
    pub fn set_status(&self, status: PlayerStatus) {
        self.status.set(status);
    }

    /// Moves produced so far.
    pub fn moves_made(&self) -> u32 {
        self.moves.load(Ordering::SeqCst)
    }

    /// Game state received with the game-over notification.
    pub fn final_state(&self) -> Option<GameState> {
        self.final_state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl fmt::Debug for ScriptedPlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedPlayer")
            .field("id", &self.id)
            .field("status", &self.status.get())
            .field("moves", &self.moves_made())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Participant for ScriptedPlayer {
    fn id(&self) -> &PlayerId {
        &self.id
    }

    fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    fn status_updates(&self) -> Option<watch::Receiver<PlayerStatus>> {
        Some(self.status.subscribe())
    }

    #[instrument(skip_all, fields(player_id = %self.id, turn = view.turn()))]
    async fn make_move(&self, view: &MatchView) -> anyhow::Result<Value> {
        self.journal.push(Entry::Asked {
            player: self.id.clone(),
            turn: *view.turn(),
        });

        if !self.think_time.is_zero() {
            tokio::time::sleep(self.think_time).await;
        }

        let seq = self.moves.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.on_move {
            hook(seq);
        }

        if let Some(message) = &self.failure {
            anyhow::bail!("{}", message);
        }

        let payload = json!({ "player": self.id, "seq": seq });
        if self.omits_move_field {
            return Ok(json!({ "payload": payload }));
        }

        Ok(MoveEnvelope::wrap(payload))
    }

    async fn notify_game_over(&self, state: &GameState) {
        self.journal.push(Entry::Notified(self.id.clone()));
        *self.final_state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
    }
}
