//! Configuration management for turnloop.toml

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::anthropic::DEFAULT_BASE_URL;
use crate::client::GenerationParams;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "turnloop.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Upstream model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-request timeout
    pub timeout_secs: u64,
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            timeout_secs: 120,
            system_prompt: None,
        }
    }
}

/// Agent loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Model calls allowed per `process_message`
    pub max_iterations: usize,
    /// Queue concurrent calls that target the same session
    pub serialize_sessions: bool,
    pub tool_timeout_secs: u64,
    /// Directory tools resolve relative paths against (defaults to cwd)
    pub working_dir: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            serialize_sessions: true,
            tool_timeout_secs: 60,
            working_dir: None,
        }
    }
}

impl Config {
    /// Load from the nearest turnloop.toml, then the user config dir, else defaults
    pub fn load() -> Result<Self> {
        match Self::find_config_path() {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    /// Search the current directory and its parents, then the user config dir
    pub fn find_config_path() -> Option<PathBuf> {
        if let Ok(mut current) = std::env::current_dir() {
            for _ in 0..10 {
                let candidate = current.join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    return Some(candidate);
                }
                if !current.pop() {
                    break;
                }
            }
        }

        Self::user_config_path().filter(|p| p.exists())
    }

    /// ~/.config/turnloop/config.toml (or platform equivalent)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("turnloop").join("config.toml"))
    }

    /// Reject settings the core would misbehave with
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            bail!("agent.max_iterations must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.rate_limit.max_requests == 0 {
            bail!("rate_limit.max_requests must be at least 1");
        }
        if self.rate_limit.window_ms == 0 {
            bail!("rate_limit.window_ms must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.model.temperature) {
            bail!("model.temperature must be within 0.0..=1.0");
        }
        if self.model.model.trim().is_empty() {
            bail!("model.model must not be empty");
        }
        Ok(())
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.model.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .with_context(|| format!("Environment variable {} is not set", self.model.api_key_env))
    }

    pub fn generation_params(&self) -> GenerationParams {
        let params = GenerationParams::new(&self.model.model)
            .with_max_tokens(self.model.max_tokens)
            .with_temperature(self.model.temperature);
        match &self.model.system_prompt {
            Some(system) => params.with_system(system),
            None => params,
        }
    }

    /// Commented default file written by `turnloop config init`
    pub fn default_file_contents() -> &'static str {
        r#"# turnloop configuration

[model]
base_url = "https://api.anthropic.com"
# Environment variable that holds the API key
api_key_env = "ANTHROPIC_API_KEY"
model = "claude-sonnet-4-20250514"
max_tokens = 4096
temperature = 0.7
timeout_secs = 120
# system_prompt = "You are a helpful assistant."

[agent]
# Model calls allowed per message before giving up with a partial answer
max_iterations = 10
# Queue concurrent messages for the same session instead of interleaving them
serialize_sessions = true
tool_timeout_secs = 60
# working_dir = "/path/to/workspace"

[retry]
max_attempts = 3
base_delay_ms = 1000
max_delay_ms = 30000

[rate_limit]
max_requests = 50
window_ms = 60000
"#
    }
}
