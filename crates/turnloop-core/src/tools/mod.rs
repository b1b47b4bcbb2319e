//! Tool framework for model-requested function calls

pub mod registry;
pub mod router;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use registry::ToolRegistry;
pub use router::ToolRouter;

/// Result of a single tool execution. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,
    /// Payload produced by the tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time from invocation start to completion or failure
    pub duration: Duration,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(output: Value, duration: Duration) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            duration,
        }
    }

    /// Create a failed result
    pub fn error(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            duration,
        }
    }

    /// Text fed back to the model for this result
    pub fn content(&self) -> String {
        if self.success {
            match &self.output {
                Some(Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => String::new(),
            }
        } else {
            self.error
                .clone()
                .unwrap_or_else(|| "Tool execution failed".to_string())
        }
    }
}

/// Context provided to tools during execution
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Directory relative paths resolve against
    pub working_dir: PathBuf,
    /// Per-invocation time limit
    pub timeout: Duration,
    /// Maximum output length (truncate if exceeded)
    pub max_output_len: usize,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: Duration::from_secs(60),
            max_output_len: 50_000,
        }
    }
}

impl ToolContext {
    /// Create a new context with the given working directory
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Schema for a tool parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterProperty {
    /// Parameter type (string, number, integer, boolean, array, object)
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterProperty {
    fn of_type(param_type: &str, description: impl Into<String>) -> Self {
        Self {
            param_type: param_type.to_string(),
            description: description.into(),
            enum_values: None,
            default: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::of_type("string", description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::of_type("number", description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::of_type("integer", description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::of_type("boolean", description)
    }

    pub fn array(description: impl Into<String>) -> Self {
        Self::of_type("array", description)
    }

    pub fn object(description: impl Into<String>) -> Self {
        Self::of_type("object", description)
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_enum(mut self, values: Vec<String>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// JSON-schema style description of a tool's input object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Always "object"
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: BTreeMap<String, ParameterProperty>,
    /// Required parameter names
    #[serde(default)]
    pub required: Vec<String>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    /// Add an optional parameter
    pub fn with_property(mut self, name: impl Into<String>, prop: ParameterProperty) -> Self {
        self.properties.insert(name.into(), prop);
        self
    }

    /// Add a required parameter
    pub fn with_required(mut self, name: impl Into<String>, prop: ParameterProperty) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), prop);
        self.required.push(name);
        self
    }
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Catalog entry sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: ParameterSchema,
}

/// The trait every invocable tool implements
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within a registry
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> ParameterSchema;

    /// Run the tool. Errors are reported back to the model, not to the caller.
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

/// Execute a tool, converting errors, panics and timeouts into a failed result
pub async fn invoke(tool: &dyn Tool, args: &Value, ctx: &ToolContext) -> ToolResult {
    let started = Instant::now();
    let run = AssertUnwindSafe(tool.execute(args, ctx)).catch_unwind();

    match tokio::time::timeout(ctx.timeout, run).await {
        Ok(Ok(Ok(output))) => {
            ToolResult::success(truncate_output(output, ctx.max_output_len), started.elapsed())
        }
        Ok(Ok(Err(e))) => ToolResult::error(format!("{:#}", e), started.elapsed()),
        Ok(Err(panic)) => ToolResult::error(
            format!("Tool '{}' panicked: {}", tool.name(), panic_message(panic.as_ref())),
            started.elapsed(),
        ),
        Err(_) => ToolResult::error(
            format!("Tool '{}' timed out after {:?}", tool.name(), ctx.timeout),
            started.elapsed(),
        ),
    }
}

fn truncate_output(output: Value, max_len: usize) -> Value {
    match output {
        Value::String(s) if s.len() > max_len => {
            let mut end = max_len;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            Value::String(format!("{}\n... [truncated {} bytes]", &s[..end], s.len() - end))
        }
        other => other,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
