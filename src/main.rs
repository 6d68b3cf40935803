//! Strictly Arena - Unified CLI
//!
//! Runs simulated matches and checks configuration files.

#![warn(missing_docs)]

mod cli;

use anyhow::{Result, bail};
use clap::Parser;
use cli::{Cli, Command};
use std::path::PathBuf;
use std::sync::Arc;
use strictly_arena::testing::{Journal, ScriptedPlayer, ScriptedRule};
use strictly_arena::{GameId, GameRule, GameState, MatchConfig, MatchEvent, Registry};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::EnvFilter;

/// Rule name the simulation registers.
const SIMULATION_RULE: &str = "scripted";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            players,
            moves,
            config,
            max_turns,
        } => run_simulation(players, moves, config, max_turns).await,
        Command::CheckConfig { config } => check_config(config),
    }
}

/// Loads the config file if given, then applies environment overrides.
fn load_config(path: Option<PathBuf>) -> Result<MatchConfig> {
    let config = match path {
        Some(path) => MatchConfig::from_file(path)?,
        None => MatchConfig::default(),
    };
    Ok(config.apply_env()?)
}

/// Play one match between scripted bots and print the final state.
#[instrument(skip(config_path))]
async fn run_simulation(
    players: usize,
    moves: u64,
    config_path: Option<PathBuf>,
    max_turns: Option<u32>,
) -> Result<()> {
    if players == 0 {
        bail!("a simulation needs at least one player");
    }

    let mut config = load_config(config_path)?;
    if let Some(max_turns) = max_turns {
        config = config.with_max_turns(max_turns);
    }
    let auto_begin = *config.auto_begin();

    let registry = Registry::new(config);
    let journal = Journal::new();

    let rule_journal = journal.clone();
    registry.register_rule(SIMULATION_RULE, move |_: &GameId| {
        Box::new(
            ScriptedRule::new(rule_journal.clone())
                .with_over_after(moves)
                .with_min_players(players)
                .declaring_winner(),
        ) as Box<dyn GameRule>
    });

    let game = registry.new_game(SIMULATION_RULE)?;
    info!(game_id = %game.game_id(), players, moves, "Starting simulation");

    let mut events = game.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MatchEvent::MoveMade { player, turn }) => info!(%player, turn, "Move made"),
                Ok(MatchEvent::GameOver { .. }) => break,
                Ok(event) => debug!(event = event.name(), "Event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for seat in 1..=players {
        let bot = ScriptedPlayer::new(format!("bot-{}", seat), journal.clone()).ready();
        game.register_participant(Arc::new(bot)).await?;
    }

    let final_state: Arc<GameState> = if auto_begin {
        game.wait_finished().await
    } else {
        if !game.start().await? {
            bail!("game {} is not ready to start", game.game_id());
        }
        let outcome = game.run().await;
        if let Err(error) = &outcome {
            game.mark_faulted();
            warn!(%error, "Simulation faulted");
        }
        game.wait_finished().await
    };

    if let Err(error) = logger.await {
        warn!(%error, "Event logger stopped abnormally");
    }

    info!(
        accepted = journal.accepted().len(),
        ending = ?final_state.ending(),
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(final_state.as_ref())?);
    Ok(())
}

/// Print the effective configuration.
#[instrument]
fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(Some(path))?;
    info!("Configuration is valid");
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
