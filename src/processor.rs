//! Work item processors: the pluggable per-item execution strategies
//! handed to endpoint managers.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::utils::write_json_file_atomic;
use crate::work_item::{WorkItemRequest, WorkItemResult};

/// Everything a processor may need beyond the work item itself.
#[derive(Clone)]
pub struct ProcessContext {
    pub endpoint_name: String,
    pub endpoint_config: EndpointConfig,
    /// Folder offered for processor-specific log artifacts.
    pub log_folder: PathBuf,
    /// Directories to search for cached prior results.
    pub cache_search_dirs: Vec<PathBuf>,
    /// Orchestrator-wide lock for work items that need a cross-endpoint
    /// critical section.
    pub global_workitem_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Executes one work item against one endpoint.
///
/// Results report attempts made in this call (normally 1); the
/// orchestrator accumulates totals across retries.
#[async_trait]
pub trait WorkItemProcessor: Send + Sync {
    /// Stable processor family name. Hot-swap keeps an endpoint manager
    /// only if the manager's processor kind matches the incoming batch's.
    fn kind(&self) -> &'static str;

    async fn process(&self, item: &WorkItemRequest, ctx: &ProcessContext) -> WorkItemResult;
}

/// Placeholder installed while no batch is active. Endpoint managers
/// created on an idle hot-swap carry it until the next batch replaces
/// them; it should never actually run.
pub struct StubWorkItemProcessor;

#[async_trait]
impl WorkItemProcessor for StubWorkItemProcessor {
    fn kind(&self) -> &'static str {
        "stub"
    }

    async fn process(&self, item: &WorkItemRequest, ctx: &ProcessContext) -> WorkItemResult {
        warn!(
            "Stub processor asked to handle {} on {}; no batch is active",
            item.filepath, ctx.endpoint_name
        );
        WorkItemResult::failure(
            item.filepath.clone(),
            ctx.endpoint_name.clone(),
            false,
            "no active batch processor",
        )
    }
}

/// Runs a templated shell command per work item.
///
/// The template may reference `{input}` (the item's filepath) and
/// `{output_dir}` (the batch's base path, carried in the item payload).
/// A zero exit status succeeds and writes a small `<stem>.json` artifact
/// into the output directory for the combined-results pass; a non-zero
/// exit is a retriable failure; an unresolvable program is permanent.
pub struct CommandWorkItemProcessor {
    template: String,
}

impl CommandWorkItemProcessor {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    fn render(&self, item: &WorkItemRequest, output_dir: &str) -> String {
        self.template
            .replace("{input}", &item.filepath)
            .replace("{output_dir}", output_dir)
    }
}

#[async_trait]
impl WorkItemProcessor for CommandWorkItemProcessor {
    fn kind(&self) -> &'static str {
        "command"
    }

    async fn process(&self, item: &WorkItemRequest, ctx: &ProcessContext) -> WorkItemResult {
        let output_dir = item
            .payload
            .get("output_dir")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ctx.log_folder.display().to_string());
        let rendered = self.render(item, &output_dir);

        // A missing program will never start working; fail permanently
        // instead of burning the retry budget.
        if let Some(program) = rendered.split_whitespace().next() {
            if !program.contains('/') && which::which(program).is_err() {
                return WorkItemResult::failure(
                    item.filepath.clone(),
                    ctx.endpoint_name.clone(),
                    false,
                    format!("program '{program}' not found in PATH"),
                );
            }
        }

        debug!("[{}] running: {}", ctx.endpoint_name, rendered);
        let started = Instant::now();
        let output = Command::new("sh")
            .arg("-c")
            .arg(&rendered)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        let latency = started.elapsed().as_secs_f64();

        match output {
            Ok(output) if output.status.success() => {
                let artifact = serde_json::json!({
                    "filepath": item.filepath,
                    "endpoint": ctx.endpoint_name,
                    "command": rendered,
                    "duration_secs": latency,
                });
                if let Some(stem) = stem_of(&item.filepath) {
                    let path = PathBuf::from(&output_dir).join(format!("{stem}.json"));
                    if let Err(e) = write_json_file_atomic(&artifact, &path, 3).await {
                        warn!("Failed to write result artifact for {}: {}", item.filepath, e);
                    }
                }
                WorkItemResult::success(item.filepath.clone(), ctx.endpoint_name.clone())
                    .with_latency(latency)
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = format!(
                    "exit status {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.lines().last().unwrap_or("").trim()
                );
                WorkItemResult::failure(item.filepath.clone(), ctx.endpoint_name.clone(), true, reason)
                    .with_latency(latency)
            }
            Err(e) => WorkItemResult::failure(
                item.filepath.clone(),
                ctx.endpoint_name.clone(),
                false,
                format!("failed to spawn command: {e}"),
            ),
        }
    }
}

fn stem_of(filepath: &str) -> Option<&str> {
    std::path::Path::new(filepath).file_stem()?.to_str()
}
