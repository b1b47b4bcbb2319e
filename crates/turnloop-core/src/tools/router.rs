//! Tool routing and dispatch

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::registry::ToolRegistry;
use super::{invoke, ToolContext, ToolResult};
use crate::message::{ContentBlock, ToolInvocationRequest};

/// Result of routing a tool call
#[derive(Debug, Clone, PartialEq)]
pub enum RouteResult {
    /// Tool ran; the result may still be a failure
    Completed(ToolResult),
    /// No tool registered under this name; nothing was executed
    NotFound(String),
}

impl RouteResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RouteResult::Completed(result) if result.success)
    }

    /// Result block answering `request`
    pub fn into_block(self, request: &ToolInvocationRequest) -> ContentBlock {
        match self {
            RouteResult::Completed(result) => {
                ContentBlock::tool_result(&request.id, result.content(), !result.success)
            }
            RouteResult::NotFound(name) => ContentBlock::tool_result(
                &request.id,
                format!("Tool not found: {}", name),
                true,
            ),
        }
    }
}

/// Router for dispatching tool calls against a shared registry
#[derive(Debug, Clone)]
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
}

impl ToolRouter {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Route a single tool call
    #[instrument(skip(self, request, ctx), fields(tool = %request.name, id = %request.id))]
    pub async fn route(&self, request: &ToolInvocationRequest, ctx: &ToolContext) -> RouteResult {
        let tool = match self.registry.get_executor(&request.name) {
            Some(t) => t,
            None => {
                warn!(tool = %request.name, "Tool not found");
                return RouteResult::NotFound(request.name.clone());
            }
        };

        let result = invoke(tool.as_ref(), &request.input, ctx).await;
        if result.success {
            info!(
                tool = %request.name,
                duration_ms = result.duration.as_millis() as u64,
                "Tool executed successfully"
            );
        } else {
            warn!(tool = %request.name, error = ?result.error, "Tool execution failed");
        }
        RouteResult::Completed(result)
    }

    /// Route calls sequentially, one result per request, in request order
    pub async fn route_all(
        &self,
        requests: &[ToolInvocationRequest],
        ctx: &ToolContext,
    ) -> Vec<RouteResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.route(request, ctx).await);
        }
        results
    }

    /// Get a reference to the registry
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}
