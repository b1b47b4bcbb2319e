//! File write tool

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use turnloop_core::{ParameterProperty, ParameterSchema, Tool, ToolContext};

/// Tool for writing files inside the working directory
pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the working directory. Creates the file if it doesn't \
         exist, overwrites if it does. Creates parent directories as needed."
    }

    fn parameters_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with_required(
                "path",
                ParameterProperty::string("Path to write to, relative to the working directory"),
            )
            .with_required("content", ParameterProperty::string("The content to write to the file"))
            .with_property(
                "append",
                ParameterProperty::boolean("Append to file instead of overwriting (default: false)")
                    .with_default(Value::Bool(false)),
            )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value> {
        let path_str = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: path"))?;

        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: content"))?;

        let append = args.get("append").and_then(|v| v.as_bool()).unwrap_or(false);

        let path = resolve_within(&ctx.working_dir, path_str)?;
        debug!(path = %path.display(), append, bytes = content.len(), "Writing file");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directories for {}", path.display()))?;
        }

        if append {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            file.write_all(content.as_bytes())
                .await
                .with_context(|| format!("Failed to append to {}", path.display()))?;
            file.flush().await?;
        } else {
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        Ok(json!({
            "path": path.display().to_string(),
            "bytes": content.len(),
            "mode": if append { "appended" } else { "written" },
        }))
    }
}

/// Resolve `requested` against `root`, refusing anything that lands outside it
fn resolve_within(root: &Path, requested: &str) -> Result<PathBuf> {
    if requested.trim().is_empty() {
        bail!("Path must not be empty");
    }

    let root = normalize(root);
    let requested_path = Path::new(requested);
    let joined = if requested_path.is_absolute() {
        requested_path.to_path_buf()
    } else {
        root.join(requested_path)
    };
    let path = normalize(&joined);

    if !path.starts_with(&root) || path == root {
        bail!("Access denied: {} is outside the working directory", requested);
    }
    Ok(path)
}

/// Lexically collapse `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
