//! turnloop: Tool-calling chat agent for the command line
//!
//! Drives a model through tool requests until it answers.

mod commands;
mod repl;
mod tools;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "turnloop")]
#[command(about = "Tool-calling chat agent", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the nearest turnloop.toml)
    #[arg(short, long, global = true, env = "TURNLOOP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start interactive chat REPL
    Chat {
        /// Session key (defaults to a fresh session)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// One-shot query (non-interactive)
    Ask {
        /// The prompt to send
        #[arg(required = true)]
        prompt: Vec<String>,

        /// Session key (defaults to a fresh session)
        #[arg(short, long)]
        session: Option<String>,

        /// Output reply and metrics as JSON
        #[arg(long)]
        json: bool,
    },

    /// List built-in tools
    Tools,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Write a default turnloop.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,

        /// Write to the user config directory instead of the current directory
        #[arg(long)]
        global: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Some(Commands::Chat { session }) => repl::run(config_path, session).await,
        Some(Commands::Ask {
            prompt,
            session,
            json,
        }) => {
            let prompt_text = prompt.join(" ");
            commands::ask(config_path, &prompt_text, session, json).await
        }
        Some(Commands::Tools) => commands::tools(),
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { force, global } => commands::config_init(force, global),
            ConfigAction::Show => commands::config_show(config_path),
        },
        None => {
            // Default to chat REPL when no command specified
            repl::run(config_path, None).await
        }
    }
}
