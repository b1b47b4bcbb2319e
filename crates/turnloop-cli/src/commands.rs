//! Command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{debug, info};

use turnloop_core::config::CONFIG_FILE_NAME;
use turnloop_core::{
    AgentConfig, AgentLoop, AnthropicClient, Config, InMemoryConversationStore, InMemoryMetrics,
    Outcome, RateLimiter, ToolDefinition,
};

use crate::tools::create_default_registry;

// ANSI colors
const YELLOW: &str = "\x1b[93m";
const CYAN: &str = "\x1b[96m";
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Load the explicit config file or search for one, then validate it
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Wire the Anthropic client, in-memory store, built-in tools and metrics
pub fn build_agent(config: &Config) -> Result<AgentLoop> {
    let api_key = config.api_key()?;
    let client = AnthropicClient::new(
        api_key,
        config.model.base_url.clone(),
        Duration::from_secs(config.model.timeout_secs),
    )?;

    let registry = Arc::new(create_default_registry());
    debug!(tools = ?registry.list_names(), "Registered built-in tools");

    let agent = AgentLoop::new(
        Arc::new(client),
        Arc::new(InMemoryConversationStore::new()),
        registry,
        config.generation_params(),
        AgentConfig::from_config(config),
    )
    .with_rate_limiter(Arc::new(RateLimiter::from_config(&config.rate_limit)))
    .with_metrics(Arc::new(InMemoryMetrics::new()));

    Ok(agent)
}

pub fn new_session_key() -> String {
    format!("session-{}", uuid::Uuid::new_v4())
}

/// One-shot question
pub async fn ask(
    config_path: Option<&Path>,
    prompt: &str,
    session: Option<String>,
    json_output: bool,
) -> Result<()> {
    if prompt.trim().is_empty() {
        bail!("Prompt must not be empty");
    }

    let config = load_config(config_path)?;
    let agent = build_agent(&config)?;
    let session = session.unwrap_or_else(new_session_key);

    info!(session = %session, model = %config.model.model, "Asking");
    let reply = agent.process_message(&session, prompt).await?;

    if json_output {
        let snapshot = agent.metrics_snapshot().await?;
        let output = json!({
            "session": session,
            "reply": reply,
            "metrics": snapshot,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", reply.text);
    if let Some(note) = outcome_note(&reply.outcome) {
        eprintln!("{}Note:{} {}", YELLOW, RESET, note);
    }
    Ok(())
}

/// Explanation for answers that are not final
pub fn outcome_note(outcome: &Outcome) -> Option<String> {
    match outcome {
        Outcome::Final => None,
        Outcome::IterationLimit => {
            Some("iteration limit reached, the answer may be incomplete".to_string())
        }
        Outcome::UnexpectedStop(reason) => {
            Some(format!("model stopped early ({}), the answer may be incomplete", reason))
        }
    }
}

/// Print the built-in tool catalog
pub fn tools() -> Result<()> {
    let registry = create_default_registry();
    for def in registry.list_definitions() {
        print!("{}", format_tool(&def));
    }
    Ok(())
}

pub fn format_tool(def: &ToolDefinition) -> String {
    let mut out = format!("{}{}{}\n  {}\n", BOLD, def.name, RESET, def.description);
    for (name, prop) in &def.input_schema.properties {
        let required = if def.input_schema.required.contains(name) {
            " (required)"
        } else {
            ""
        };
        out.push_str(&format!(
            "  {}{}{}: {}{} {}{}{}\n",
            CYAN, name, RESET, prop.param_type, required, DIM, prop.description, RESET
        ));
    }
    out
}

/// Write the default config file
pub fn config_init(force: bool, global: bool) -> Result<()> {
    let path = if global {
        Config::user_config_path().context("Could not determine the user config directory")?
    } else {
        std::env::current_dir()?.join(CONFIG_FILE_NAME)
    };

    write_default_config(&path, force)?;
    println!("Wrote {}", path.display());
    Ok(())
}

pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, Config::default_file_contents())
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Print the effective configuration
pub fn config_show(config_path: Option<&Path>) -> Result<()> {
    let source: Option<PathBuf> = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => Config::find_config_path(),
    };
    let config = match &source {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };

    match &source {
        Some(path) => println!("{}# Loaded from {}{}", DIM, path.display(), RESET),
        None => println!("{}# No config file found, using defaults{}", DIM, RESET),
    }
    print!("{}", render_config(&config)?);

    if let Err(e) = config.validate() {
        eprintln!("{}Warning:{} {}", YELLOW, RESET, e);
    }
    Ok(())
}

/// TOML view of the config plus API key presence; the key itself is never printed
pub fn render_config(config: &Config) -> Result<String> {
    let mut out = toml::to_string_pretty(config).context("Failed to serialize config")?;
    let key_state = if config.api_key().is_ok() { "set" } else { "not set" };
    out.push_str(&format!(
        "\n# {} is {}\n",
        config.model.api_key_env, key_state
    ));
    Ok(out)
}
