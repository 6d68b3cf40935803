//! Command-line interface for strictly_arena.

use clap::{Parser, Subcommand};

/// Strictly Arena - host for turn-based games
#[derive(Parser, Debug)]
#[command(name = "strictly_arena")]
#[command(about = "Host turn-based games between pluggable rules and participants", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a simulated match between scripted bots
    Simulate {
        /// Number of bots
        #[arg(short, long, default_value = "2")]
        players: usize,

        /// Accepted moves after which the rule ends the game
        #[arg(short, long, default_value = "6")]
        moves: u64,

        /// Path to match configuration file
        #[arg(short, long)]
        config: Option<std::path::PathBuf>,

        /// Override the turn ceiling
        #[arg(long)]
        max_turns: Option<u32>,
    },

    /// Load a configuration file and print the effective settings
    CheckConfig {
        /// Path to match configuration file
        #[arg(short, long, default_value = "arena.toml")]
        config: std::path::PathBuf,
    },
}
