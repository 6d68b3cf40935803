//! Participant capability.

use crate::ids::PlayerId;
use crate::state::{GameState, MatchView};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, instrument};

/// Readiness status a participant publishes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    /// Connected but not ready to play.
    Waiting,
    /// Ready to play.
    Ready,
    /// Unreachable.
    Offline,
}

/// Something that can take part in a match (a bot, a remote client, ...).
///
/// Implementations are shared between the engine and whatever transport
/// feeds them, so every method takes `&self`.
#[async_trait::async_trait]
pub trait Participant: Send + Sync {
    /// Identifier, unique within one game.
    fn id(&self) -> &PlayerId;

    /// Whether the participant is ready for the game to begin.
    fn is_ready(&self) -> bool;

    /// Channel publishing status changes.
    ///
    /// The engine re-evaluates readiness on every change. Participants whose
    /// readiness never changes may return `None`.
    fn status_updates(&self) -> Option<watch::Receiver<PlayerStatus>> {
        None
    }

    /// Produces a move envelope: a JSON object with a `"move"` field.
    async fn make_move(&self, view: &MatchView) -> anyhow::Result<Value>;

    /// Called once when the game ends, with the final game state.
    async fn notify_game_over(&self, _state: &GameState) {}
}

/// Status cell a participant can embed to publish readiness changes.
#[derive(Debug)]
pub struct StatusCell {
    tx: watch::Sender<PlayerStatus>,
}

impl StatusCell {
    /// Creates a cell holding `initial`.
    pub fn new(initial: PlayerStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current status.
    pub fn get(&self) -> PlayerStatus {
        *self.tx.borrow()
    }

    /// Whether the current status is [`PlayerStatus::Ready`].
    pub fn is_ready(&self) -> bool {
        self.get() == PlayerStatus::Ready
    }

    /// Publishes `status`. Returns false when it was already current.
    #[instrument(skip(self))]
    pub fn set(&self, status: PlayerStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        debug!(%status, changed, "Participant status set");
        changed
    }

    /// New receiver observing future changes.
    pub fn subscribe(&self) -> watch::Receiver<PlayerStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(PlayerStatus::Waiting)
    }
}
