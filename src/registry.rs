//! Registry of rule factories and active games.

use crate::config::MatchConfig;
use crate::engine::MatchEngine;
use crate::error::MatchError;
use crate::ids::GameId;
use crate::rule::RuleFactory;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, instrument, warn};

/// Holds named rule factories and the games created from them.
///
/// Cloning is cheap; clones share the same maps.
#[derive(Clone)]
pub struct Registry {
    rules: Arc<RwLock<HashMap<String, Arc<dyn RuleFactory>>>>,
    games: Arc<RwLock<HashMap<GameId, Arc<MatchEngine>>>>,
    config: MatchConfig,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    /// Creates a registry whose games use `config`.
    #[instrument(skip(config))]
    pub fn new(config: MatchConfig) -> Self {
        info!("Creating game registry");
        Self {
            rules: Arc::new(RwLock::new(HashMap::new())),
            games: Arc::new(RwLock::new(HashMap::new())),
            config,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Configuration handed to new games.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Registers `factory` under `name`, replacing any previous one.
    ///
    /// Must happen before [`Registry::new_game`] is called with that name.
    #[instrument(skip(self, name, factory), fields(rule = %name.as_ref()))]
    pub fn register_rule(&self, name: impl AsRef<str>, factory: impl RuleFactory + 'static) {
        let name = name.as_ref().to_string();
        let previous = self
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(factory));

        if previous.is_some() {
            warn!("Replaced existing rule factory");
        } else {
            info!("Registered rule");
        }
    }

    /// Names of all registered rules, sorted.
    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Creates a game played under the rule registered as `rule_name`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no rule is registered under that name.
    #[instrument(skip(self))]
    pub fn new_game(&self, rule_name: &str) -> Result<Arc<MatchEngine>, MatchError> {
        let factory = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rule_name)
            .cloned()
            .ok_or_else(|| {
                warn!("Unknown rule requested");
                MatchError::configuration(format!("rule {} not found", rule_name))
            })?;

        let game_id = self.next_game_id();
        let rule = factory.make(&game_id);
        let engine = MatchEngine::new(game_id.clone(), rule_name.to_string(), rule, self.config.clone());

        self.games
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(game_id.clone(), Arc::clone(&engine));

        info!(game_id = %game_id, "Created game");
        Ok(engine)
    }

    /// Whether a game with `game_id` is held.
    pub fn has_game(&self, game_id: &GameId) -> bool {
        self.games
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(game_id)
    }

    /// Looks up a game.
    #[instrument(skip(self))]
    pub fn get_game(&self, game_id: &GameId) -> Option<Arc<MatchEngine>> {
        let game = self
            .games
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(game_id)
            .cloned();

        if game.is_none() {
            debug!("Game not found");
        }

        game
    }

    /// Ids of all held games, sorted.
    pub fn list_games(&self) -> Vec<GameId> {
        let mut ids: Vec<_> = self
            .games
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Discards a game, returning it if it was held.
    #[instrument(skip(self))]
    pub fn remove_game(&self, game_id: &GameId) -> Option<Arc<MatchEngine>> {
        let removed = self
            .games
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(game_id);

        if removed.is_some() {
            info!("Removed game");
        }

        removed
    }

    fn next_game_id(&self) -> GameId {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        GameId::new(format!("game-{:06}", seq))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("rules", &self.rule_names())
            .field("games", &self.list_games())
            .finish_non_exhaustive()
    }
}
