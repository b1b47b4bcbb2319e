//! Built-in tools shipped with the binary

mod file_write;
mod web_search;

pub use file_write::FileWriteTool;
pub use web_search::WebSearchTool;

use turnloop_core::ToolRegistry;

/// Create a registry with all built-in tools
pub fn create_default_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(WebSearchTool);
    registry.register(FileWriteTool);
    registry
}
