//! Agent state management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::StopReason;
use crate::config::Config;
use crate::retry::RetryPolicy;

/// Runtime options for the agent loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum model calls per message
    pub max_iterations: usize,
    /// Serialize concurrent calls on the same session key
    pub serialize_sessions: bool,
    /// Per-invocation tool time limit
    pub tool_timeout: Duration,
    /// Working directory handed to tools
    pub working_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            serialize_sessions: true,
            tool_timeout: Duration::from_secs(60),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            retry: RetryPolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            serialize_sessions: config.agent.serialize_sessions,
            tool_timeout: Duration::from_secs(config.agent.tool_timeout_secs),
            working_dir: config
                .agent
                .working_dir
                .clone()
                .unwrap_or_else(|| Self::default().working_dir),
            retry: config.retry,
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_serialize_sessions(mut self, serialize: bool) -> Self {
        self.serialize_sessions = serialize;
        self
    }
}

/// Controller state for one `process_message` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    ExecutingTools,
    Done,
    Aborted,
}

/// How a `process_message` call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// The model produced a final answer
    Final,
    /// The iteration budget ran out; text is best effort
    IterationLimit,
    /// The model stopped for a reason the loop does not handle
    UnexpectedStop(String),
}

impl Outcome {
    pub fn is_final(&self) -> bool {
        matches!(self, Outcome::Final)
    }

    pub(crate) fn unexpected(reason: &StopReason) -> Self {
        Outcome::UnexpectedStop(reason.to_string())
    }
}

/// Answer returned by `AgentLoop::process_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    /// Final or partial text (possibly empty)
    pub text: String,
    pub outcome: Outcome,
    /// Model calls made
    pub iterations: usize,
    /// Tool requests dispatched, including unknown tools
    pub tool_calls: usize,
}

/// Mutable bookkeeping while the loop runs
#[derive(Debug)]
pub(crate) struct RunState {
    pub state: LoopState,
    pub iteration: usize,
    pub tool_calls: usize,
    /// Text of the most recent model response
    pub last_text: String,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            state: LoopState::AwaitingModel,
            iteration: 0,
            tool_calls: 0,
            last_text: String::new(),
        }
    }

    pub fn transition(&mut self, next: LoopState) {
        tracing::trace!(from = ?self.state, to = ?next, "Loop state transition");
        self.state = next;
    }

    pub fn into_reply(self, outcome: Outcome) -> AgentReply {
        AgentReply {
            text: self.last_text,
            outcome,
            iterations: self.iteration,
            tool_calls: self.tool_calls,
        }
    }
}
