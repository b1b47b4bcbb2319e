//! Agent framework: the model/tool conversation loop

mod agent_loop;
mod state;

pub use agent_loop::AgentLoop;
pub use state::{AgentConfig, AgentReply, LoopState, Outcome};
