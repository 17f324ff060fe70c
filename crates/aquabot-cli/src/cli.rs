use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aquabot")]
#[command(version, about = "Aquabot - chat assistant with self-rotating OpenRouter credentials")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.config/aquabot/config.toml)
    #[arg(long, global = true, env = "AQUABOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify a message into a business intent
    Classify {
        /// Message text
        message: String,
    },

    /// Answer a general question
    Ask {
        /// Question text
        question: String,
    },

    /// Mint a fresh credential now
    Rotate,

    /// Show the stored credential (masked)
    Show,
}
