//! The match engine: phase machine, readiness transition and turn loop.
//!
//! A match moves `Organizing -> Running -> GameOver`. The one-time move to
//! `Running` is decided under a single async mutex so concurrent readiness
//! signals cannot both start the game. The turn loop then asks every
//! participant for a move, strictly in registration order, with each step
//! raced against its deadline.

use crate::config::{MAX_EVENT_CAPACITY, MatchConfig};
use crate::deadline::{Deadlines, Step};
use crate::error::MatchError;
use crate::events::MatchEvent;
use crate::ids::{GameId, PlayerId};
use crate::participant::{Participant, PlayerStatus};
use crate::rule::{Continuation, GameRule, Readiness, RuleBinding};
use crate::state::{
    Ending, GameState, MatchState, MatchView, MoveEnvelope, Outcome, Phase, SharedMatchState,
};
use derive_getters::Getters;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock as StdRwLock, Weak};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Result of one participant-move cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Flow {
    Continue,
    Completed,
    Aborted(String),
}

/// Who asked for the organizing -> running transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// A status-changed signal; launches the turn loop when `auto_begin` is set.
    Signal,
    /// The host; it drives `run()` itself.
    Host,
}

/// Serializable summary of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Getters)]
pub struct MatchBrief {
    /// Game identifier.
    game_id: GameId,
    /// Rule name.
    rule: String,
    /// Participants in turn order.
    players: Vec<PlayerId>,
    /// Current phase.
    phase: Phase,
}

struct Seat {
    participant: Arc<dyn Participant>,
    subscription: Option<JoinHandle<()>>,
}

impl Seat {
    fn cancel(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.abort();
        }
    }
}

/// One hosted game.
pub struct MatchEngine {
    game_id: GameId,
    config: MatchConfig,
    deadlines: Deadlines,
    rule: Mutex<Box<dyn GameRule>>,
    seats: StdRwLock<Vec<Seat>>,
    record: StdMutex<GameState>,
    match_state: SharedMatchState,
    phase: watch::Sender<Phase>,
    begun: watch::Sender<bool>,
    finished: watch::Sender<Option<Arc<GameState>>>,
    abort_reason: watch::Sender<Option<String>>,
    events: broadcast::Sender<MatchEvent>,
    transition: Mutex<()>,
    started: AtomicBool,
    me: Weak<MatchEngine>,
}

impl MatchEngine {
    /// Creates a match around a freshly made rule and binds the rule to it.
    #[instrument(skip(rule, config), fields(game_id = %game_id))]
    pub fn new(
        game_id: GameId,
        rule_name: String,
        rule: Box<dyn GameRule>,
        config: MatchConfig,
    ) -> Arc<Self> {
        let deadlines = Deadlines::from_config(config.deadlines());
        deadlines.describe();

        let match_state: SharedMatchState = Arc::new(RwLock::new(MatchState::new()));
        let record = GameState::new(game_id.clone(), rule_name, Arc::clone(&match_state));
        let (events, _) = broadcast::channel((*config.event_capacity()).clamp(1, MAX_EVENT_CAPACITY));

        info!(rule = %record.rule(), "Creating match");

        Arc::new_cyclic(|me| {
            let mut rule = rule;
            rule.bind(RuleBinding::new(game_id.clone(), me.clone()));

            Self {
                game_id,
                config,
                deadlines,
                rule: Mutex::new(rule),
                seats: StdRwLock::new(Vec::new()),
                record: StdMutex::new(record),
                match_state,
                phase: watch::channel(Phase::Organizing).0,
                begun: watch::channel(false).0,
                finished: watch::channel(None).0,
                abort_reason: watch::channel(None).0,
                events,
                transition: Mutex::new(()),
                started: AtomicBool::new(false),
                me: me.clone(),
            }
        })
    }

    /// Game identifier.
    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    /// Configuration the match was created with.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Step deadlines in force.
    pub fn deadlines(&self) -> &Deadlines {
        &self.deadlines
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver observing phase changes.
    pub fn phase_updates(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Subscribes to match events.
    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.events.subscribe()
    }

    /// Handle to the live match state. The engine never writes through it.
    pub fn match_state(&self) -> SharedMatchState {
        Arc::clone(&self.match_state)
    }

    /// Snapshot of the game.
    pub fn game_state(&self) -> GameState {
        self.record().clone()
    }

    /// Participant ids in turn order.
    pub fn participant_ids(&self) -> Vec<PlayerId> {
        self.record().players().clone()
    }

    /// Abort reason, once an abort was requested.
    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.borrow().clone()
    }

    /// Serializable summary.
    pub fn brief(&self) -> MatchBrief {
        let record = self.record();
        MatchBrief {
            game_id: record.game_id().clone(),
            rule: record.rule().clone(),
            players: record.players().clone(),
            phase: *record.phase(),
        }
    }

    /// Adds a participant to the game.
    ///
    /// A participant whose id is already registered replaces the old one in
    /// place, keeping its turn position. Registration is refused once the
    /// game has left `Organizing`.
    #[instrument(skip(self, participant), fields(game_id = %self.game_id, player_id = %participant.id()))]
    pub async fn register_participant(
        &self,
        participant: Arc<dyn Participant>,
    ) -> Result<(), MatchError> {
        let _guard = self.transition.lock().await;

        let phase = self.phase();
        if phase != Phase::Organizing {
            warn!(%phase, "Registration refused");
            return Err(MatchError::configuration(format!(
                "game {} is {} and no longer accepts participants",
                self.game_id, phase
            )));
        }

        let player = participant.id().clone();
        let subscription = participant
            .status_updates()
            .map(|rx| self.forward_status(player.clone(), rx));
        let seat = Seat {
            participant,
            subscription,
        };

        {
            let mut seats = self.seats_write();
            match seats.iter_mut().find(|s| s.participant.id() == &player) {
                Some(existing) => {
                    warn!("Replacing participant with duplicate id");
                    existing.cancel();
                    *existing = seat;
                }
                None => {
                    seats.push(seat);
                    self.record().players_mut().push(player.clone());
                }
            }
        }

        info!("Participant registered");
        self.emit(MatchEvent::ParticipantRegistered { player });
        self.signal_status_changed();
        Ok(())
    }

    /// Handles a status-changed signal.
    ///
    /// Re-checks the phase under the transition lock, evaluates the ready
    /// predicate and, when `auto_begin` is set, moves to `Running` and spawns
    /// the turn loop. Returns true only for the call that made the transition.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn on_status_changed(&self) -> Result<bool, MatchError> {
        self.transition_if_ready(Trigger::Signal).await
    }

    /// Moves a ready game to `Running` without launching the turn loop.
    ///
    /// For hosts that disabled `auto_begin` and call [`MatchEngine::run`]
    /// themselves. Returns false if the game is not ready or already left
    /// `Organizing`.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn start(&self) -> Result<bool, MatchError> {
        self.transition_if_ready(Trigger::Host).await
    }

    async fn transition_if_ready(&self, trigger: Trigger) -> Result<bool, MatchError> {
        let _guard = self.transition.lock().await;

        // Must be read after acquiring the lock.
        if self.phase() != Phase::Organizing {
            return Ok(false);
        }

        if !self.is_ready().await? {
            debug!("Not ready yet");
            return Ok(false);
        }

        self.emit(MatchEvent::Ready);

        match trigger {
            Trigger::Signal if !*self.config.auto_begin() => {
                info!("Game ready, waiting for host to start it");
                Ok(false)
            }
            Trigger::Signal => {
                info!("Game ready, starting");
                self.set_phase(Phase::Running);
                self.launch();
                Ok(true)
            }
            Trigger::Host => {
                info!("Game ready, started by host");
                self.set_phase(Phase::Running);
                Ok(true)
            }
        }
    }

    /// The ready predicate: the rule is ready, every participant is ready
    /// and the rule's pre-requirements say the game shall begin.
    ///
    /// Free of side effects. A game without participants is never ready.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn is_ready(&self) -> Result<bool, MatchError> {
        let rule = self.rule.lock().await;

        let rule_ready = self
            .deadlines
            .bound(Step::Validate, async {
                rule.is_ready().await.map_err(|e| MatchError::rule("is_ready", &e))
            })
            .await?;
        if !rule_ready {
            return Ok(false);
        }

        let participants = self.participants();
        if participants.is_empty() || !participants.iter().all(|p| p.is_ready()) {
            return Ok(false);
        }

        let snapshot = self.game_state();
        let readiness = self
            .deadlines
            .bound(Step::Validate, async {
                rule.validate_pre_requirements(&snapshot)
                    .await
                    .map_err(|e| MatchError::rule("validate_pre_requirements", &e))
            })
            .await?;

        Ok(readiness == Readiness::ShallBegin)
    }

    /// Runs the match to its end.
    ///
    /// Requires the game to be `Running` (see [`MatchEngine::start`]) and may
    /// be entered only once. Finalization always runs; afterwards the
    /// termination cause is returned: an [`Outcome`] for expected endings,
    /// the error for faults. The engine never sets [`Phase::Faulted`] itself.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn run(&self) -> Result<Outcome, MatchError> {
        let phase = self.phase();
        if phase != Phase::Running {
            return Err(MatchError::configuration(format!(
                "game {} is {}, not running",
                self.game_id, phase
            )));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MatchError::configuration(format!(
                "game {} already started",
                self.game_id
            )));
        }

        let result = self.deadlines.bound(Step::Match, self.play()).await;
        self.finalize(result).await
    }

    async fn play(&self) -> Result<Flow, MatchError> {
        self.deadlines
            .bound(Step::Init, async {
                let mut rule = self.rule.lock().await;
                let mut state = self.match_state.write().await;
                rule.init(&mut state).await.map_err(|e| MatchError::rule("init", &e))
            })
            .await?;

        self.record().mark_started();
        info!(players = self.participants().len(), "Match begins");
        self.emit(MatchEvent::Begin);
        self.begun.send_replace(true);

        let max_turns = *self.config.max_turns();
        let mut turn: u32 = 0;
        loop {
            if turn > max_turns {
                error!(turn, max_turns, "Turn ceiling exceeded");
                return Err(MatchError::configuration(format!(
                    "game {} exceeded {} turns",
                    self.game_id, max_turns
                )));
            }

            self.record().set_turn(turn);
            debug!(turn, "Turn begins");

            for participant in self.participants() {
                match self.play_move(turn, participant.as_ref()).await? {
                    Flow::Continue => {}
                    ended => return Ok(ended),
                }
            }

            turn = next_turn(turn).ok_or_else(|| {
                error!(turn, "Turn counter exhausted");
                MatchError::configuration(format!(
                    "game {} exhausted the turn counter",
                    self.game_id
                ))
            })?;
        }
    }

    #[instrument(skip(self, participant), fields(player_id = %participant.id()))]
    async fn play_move(&self, turn: u32, participant: &dyn Participant) -> Result<Flow, MatchError> {
        let player = participant.id().clone();
        let view = MatchView::new(
            self.game_id.clone(),
            turn,
            player.clone(),
            self.match_state.read().await.clone(),
        );

        let raw = self
            .deadlines
            .bound(Step::Think, async {
                participant
                    .make_move(&view)
                    .await
                    .map_err(|e| MatchError::participant(&player, &e))
            })
            .await?;

        let envelope = MoveEnvelope::parse(player.clone(), raw)?;
        self.emit(MatchEvent::MoveMade {
            player: player.clone(),
            turn,
        });

        let valid = self
            .deadlines
            .bound(Step::Validate, async {
                let rule = self.rule.lock().await;
                let state = self.match_state.read().await;
                rule.validate_move(&state, &envelope)
                    .await
                    .map_err(|e| MatchError::rule("validate_move", &e))
            })
            .await?;

        if !valid {
            warn!(payload = %envelope.payload(), "Move rejected by rule");
            return Err(MatchError::protocol(
                player,
                format!("invalid move {}", envelope.payload()),
            ));
        }

        self.deadlines
            .bound(Step::Accept, async {
                let mut rule = self.rule.lock().await;
                let mut state = self.match_state.write().await;
                rule.accept_move(&mut state, &envelope)
                    .await
                    .map_err(|e| MatchError::rule("accept_move", &e))
            })
            .await?;

        if let Some(reason) = self.abort_reason() {
            warn!(%reason, "Match aborted");
            return Ok(Flow::Aborted(reason));
        }

        let continuation = self
            .deadlines
            .bound(Step::Post, async {
                let rule = self.rule.lock().await;
                let state = self.match_state.read().await;
                rule.validate_post_requirements(&state, &envelope)
                    .await
                    .map_err(|e| MatchError::rule("validate_post_requirements", &e))
            })
            .await?;

        if continuation == Continuation::ShallOver {
            info!("Rule ended the match");
            return Ok(Flow::Completed);
        }

        Ok(Flow::Continue)
    }

    async fn finalize(&self, result: Result<Flow, MatchError>) -> Result<Outcome, MatchError> {
        let ending = match &result {
            Ok(Flow::Aborted(reason)) => Ending::Aborted {
                reason: reason.clone(),
            },
            Ok(_) => Ending::Completed,
            Err(error) => Ending::Faulted {
                error: error.kind().to_string(),
            },
        };
        self.record().mark_ended(ending);

        let closing = self.game_state();
        for participant in self.participants() {
            let notified = self
                .deadlines
                .bound(Step::Think, async {
                    participant.notify_game_over(&closing).await;
                    Ok::<(), MatchError>(())
                })
                .await;
            if let Err(error) = notified {
                warn!(player_id = %participant.id(), %error, "Participant did not acknowledge game over");
            }
        }

        self.set_phase(Phase::GameOver);
        let final_state = Arc::new(self.game_state());
        self.emit(MatchEvent::GameOver {
            state: Arc::clone(&final_state),
        });
        self.finished.send_replace(Some(Arc::clone(&final_state)));
        self.cancel_subscriptions();

        info!(ending = ?final_state.ending(), turn = final_state.turn(), "Match over");

        match result {
            Ok(Flow::Aborted(reason)) => Ok(Outcome::Aborted { reason }),
            Ok(_) => Ok(Outcome::Completed {
                winner: final_state.winner().clone(),
            }),
            Err(error) => Err(error),
        }
    }

    /// Requests the match to stop.
    ///
    /// Honored after the current move has been accepted; a move already being
    /// thought about is not interrupted. The reason is recorded as the
    /// gameover reason.
    #[instrument(skip(self, reason), fields(game_id = %self.game_id))]
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(%reason, "Abort requested");
        self.abort_reason.send_replace(Some(reason));
    }

    /// Marks the match as faulted.
    ///
    /// For whoever supervises [`MatchEngine::run`] after it returned an error.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub fn mark_faulted(&self) {
        self.set_phase(Phase::Faulted);
    }

    /// Resolves once the turn loop has begun.
    ///
    /// Returns false if the game was finalized without ever beginning (its
    /// rule failed to initialize). Late callers get the answer immediately.
    pub async fn wait_begun(&self) -> bool {
        let mut begun = self.begun.subscribe();
        let mut finished = self.finished.subscribe();

        let began = async move { begun.wait_for(|b| *b).await.is_ok() };
        let ended = async move { finished.wait_for(Option::is_some).await.is_ok() };

        tokio::select! {
            ok = began => ok,
            _ = ended => *self.begun.borrow(),
        }
    }

    /// Resolves with the final game state once finalization completed.
    ///
    /// Every caller, before or after the end, receives the same `Arc`.
    pub async fn wait_finished(&self) -> Arc<GameState> {
        let mut finished = self.finished.subscribe();
        let resolved = finished
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|state| (*state).clone());

        resolved.unwrap_or_else(|| Arc::new(self.game_state()))
    }

    pub(crate) fn signal_status_changed(&self) {
        self.emit(MatchEvent::StatusChanged);

        let Some(engine) = self.me.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(game_id = %self.game_id, "No async runtime, readiness not evaluated");
            return;
        };

        runtime.spawn(async move {
            if let Err(error) = engine.on_status_changed().await {
                warn!(game_id = %engine.game_id, %error, "Readiness evaluation failed");
            }
        });
    }

    pub(crate) fn report_validation_failure(&self, reason: String) {
        warn!(game_id = %self.game_id, %reason, "Rule reported a validation failure");
        self.emit(MatchEvent::ValidationFailed { reason });
    }

    pub(crate) fn record_winner(&self, winner: PlayerId) {
        info!(game_id = %self.game_id, winner = %winner, "Winner declared");
        self.record().set_winner(winner);
    }

    pub(crate) fn record_gameover_context(&self, context: Value) {
        self.record().set_gameover_context(context);
    }

    fn launch(&self) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            match engine.run().await {
                Ok(outcome) => info!(game_id = %engine.game_id, ?outcome, "Match finished"),
                Err(error) => {
                    error!(game_id = %engine.game_id, %error, "Match faulted");
                    engine.mark_faulted();
                }
            }
        });
    }

    fn forward_status(&self, player: PlayerId, mut rx: watch::Receiver<PlayerStatus>) -> JoinHandle<()> {
        let engine = self.me.clone();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                debug!(game_id = %engine.game_id, player_id = %player, %status, "Participant status changed");
                engine.signal_status_changed();
                engine.emit(MatchEvent::ParticipantStatusChanged {
                    player: player.clone(),
                    status,
                });
            }
        })
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        self.record().set_phase(phase);
        debug!(game_id = %self.game_id, %previous, %phase, "Phase changed");
        self.emit(MatchEvent::PhaseChanged { phase });
    }

    fn emit(&self, event: MatchEvent) {
        debug!(game_id = %self.game_id, event = event.name(), "Event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn participants(&self) -> Vec<Arc<dyn Participant>> {
        self.seats_read()
            .iter()
            .map(|seat| Arc::clone(&seat.participant))
            .collect()
    }

    fn cancel_subscriptions(&self) {
        for seat in self.seats_write().iter_mut() {
            seat.cancel();
        }
    }

    fn record(&self) -> MutexGuard<'_, GameState> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seats_read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Seat>> {
        self.seats.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn seats_write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Seat>> {
        self.seats.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Turn following `turn`, or `None` once the counter is exhausted.
fn next_turn(turn: u32) -> Option<u32> {
    turn.checked_add(1)
}

impl Drop for MatchEngine {
    fn drop(&mut self) {
        let seats = self.seats.get_mut().unwrap_or_else(PoisonError::into_inner);
        for seat in seats.iter_mut() {
            seat.cancel();
        }
    }
}

impl fmt::Debug for MatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchEngine")
            .field("game_id", &self.game_id)
            .field("phase", &self.phase())
            .field("players", &self.participant_ids())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for MatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.brief()).map_err(|_| fmt::Error)?;
        write!(f, "{}", json)
    }
}
