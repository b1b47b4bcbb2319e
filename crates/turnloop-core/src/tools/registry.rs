//! Tool registry for managing available tools

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{Tool, ToolDefinition};

/// Registry of available tools, shareable across concurrent loops.
///
/// Catalog order is registration order. When a name is registered again the
/// new tool replaces the old one in its original catalog position.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register<T: Tool + 'static>(&self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register an already shared tool
    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write();
        match tools.iter().position(|t| t.name() == tool.name()) {
            Some(index) => {
                debug!(tool = %tool.name(), "Replacing registered tool");
                tools[index] = tool;
            }
            None => {
                debug!(tool = %tool.name(), "Registered tool");
                tools.push(tool);
            }
        }
    }

    /// Get a tool by name
    pub fn get_executor(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().iter().find(|t| t.name() == name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().iter().any(|t| t.name() == name)
    }

    /// Catalog snapshot for the model
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.read().iter().map(|t| t.definition()).collect()
    }

    /// List all registered tool names
    pub fn list_names(&self) -> Vec<String> {
        self.tools.read().iter().map(|t| t.name().to_string()).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list_names())
            .finish()
    }
}
