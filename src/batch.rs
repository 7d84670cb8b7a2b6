//! Batch requests and run summarization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::endpoint::{EndpointStatusChecker, UnknownEndpointStatusChecker};
use crate::processor::{CommandWorkItemProcessor, WorkItemProcessor};
use crate::work_item::{WorkItemRequest, WorkItemResult};

/// One submitted unit of batch work.
///
/// Concrete request types pick the processor and status checker for their
/// endpoint flavor; the orchestrator only sees this surface.
pub trait BatchRequest: Send + Sync {
    fn batch_id(&self) -> i64;

    /// Whether to concatenate per-item result artifacts into a single
    /// file once the batch completes.
    fn combine_results(&self) -> bool;

    /// Materialize the work items for this batch.
    fn make_work_items(
        &self,
        base_path: &Path,
        cache_search_dirs: &[PathBuf],
        log_folder: &Path,
    ) -> Vec<WorkItemRequest>;

    fn endpoint_status_checker(&self) -> Arc<dyn EndpointStatusChecker>;

    fn work_item_processor(&self) -> Arc<dyn WorkItemProcessor>;

    fn run_summarizer(&self) -> Arc<dyn BatchRunSummarizer>;

    /// Source files of the batch, used by the combined-results helper.
    fn files(&self) -> Vec<PathBuf>;
}

/// Batch that runs a templated shell command over a set of files.
pub struct CommandBatchRequest {
    pub batch_id: i64,
    pub files: Vec<PathBuf>,
    pub language: Option<String>,
    pub combine_results: bool,
    pub command_template: String,
}

impl CommandBatchRequest {
    /// Build a request over every regular file in `input_dir`.
    pub fn from_dir(
        batch_id: i64,
        input_dir: &Path,
        command_template: impl Into<String>,
        language: Option<String>,
        combine_results: bool,
    ) -> std::io::Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(input_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(Self {
            batch_id,
            files,
            language,
            combine_results,
            command_template: command_template.into(),
        })
    }
}

impl BatchRequest for CommandBatchRequest {
    fn batch_id(&self) -> i64 {
        self.batch_id
    }

    fn combine_results(&self) -> bool {
        self.combine_results
    }

    fn make_work_items(
        &self,
        base_path: &Path,
        _cache_search_dirs: &[PathBuf],
        _log_folder: &Path,
    ) -> Vec<WorkItemRequest> {
        self.files
            .iter()
            .map(|file| {
                WorkItemRequest::new(file.display().to_string())
                    .with_language(self.language.clone())
                    .with_payload(serde_json::json!({
                        "output_dir": base_path.display().to_string(),
                    }))
            })
            .collect()
    }

    fn endpoint_status_checker(&self) -> Arc<dyn EndpointStatusChecker> {
        Arc::new(UnknownEndpointStatusChecker)
    }

    fn work_item_processor(&self) -> Arc<dyn WorkItemProcessor> {
        Arc::new(CommandWorkItemProcessor::new(self.command_template.clone()))
    }

    fn run_summarizer(&self) -> Arc<dyn BatchRunSummarizer> {
        Arc::new(DefaultRunSummarizer)
    }

    fn files(&self) -> Vec<PathBuf> {
        self.files.clone()
    }
}

/// Consistent snapshot of a run, taken under the accounting lock and
/// summarized outside it.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub batch_id: Option<i64>,
    /// Per-item results; `None` means no attempt has concluded yet.
    pub work_results: HashMap<String, Option<WorkItemResult>>,
    pub queued: usize,
    pub running: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub endpoint_managers: usize,
}

/// Turns a run snapshot into the summary document that gets persisted.
pub trait BatchRunSummarizer: Send + Sync {
    fn run_summary(&self, snapshot: &RunSnapshot, log_conclusion: bool) -> serde_json::Value;
}

/// Summarizer used when a request type has no special reporting needs:
/// per-item entries plus aggregate counters.
pub struct DefaultRunSummarizer;

impl BatchRunSummarizer for DefaultRunSummarizer {
    fn run_summary(&self, snapshot: &RunSnapshot, log_conclusion: bool) -> serde_json::Value {
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut pending = 0usize;
        let mut total_attempts = 0u64;
        let mut failures: Vec<(&str, &str)> = Vec::new();

        let mut items = serde_json::Map::new();
        for (filepath, result) in &snapshot.work_results {
            match result {
                Some(result) => {
                    total_attempts += u64::from(result.attempts);
                    if result.succeeded {
                        succeeded += 1;
                    } else {
                        failed += 1;
                        failures.push((filepath, result.error.as_deref().unwrap_or("unknown")));
                    }
                    items.insert(
                        filepath.clone(),
                        serde_json::to_value(result).unwrap_or_default(),
                    );
                }
                None => {
                    pending += 1;
                    items.insert(filepath.clone(), serde_json::json!({"status": "pending"}));
                }
            }
        }

        let now = chrono::Utc::now();
        let elapsed = (now - snapshot.started_at).num_milliseconds() as f64 / 1000.0;

        if log_conclusion {
            info!(
                "Batch {} concluded: {} succeeded, {} failed, {} never attempted (of {})",
                snapshot.batch_id.unwrap_or(-1),
                succeeded,
                failed,
                pending,
                snapshot.work_results.len()
            );
            for (filepath, error) in &failures {
                warn!("  failed: {} ({})", filepath, error);
            }
        }

        serde_json::json!({
            "batch_id": snapshot.batch_id,
            "generated_at": now.to_rfc3339(),
            "started_at": snapshot.started_at.to_rfc3339(),
            "elapsed_secs": elapsed,
            "endpoint_managers": snapshot.endpoint_managers,
            "overall": {
                "total": snapshot.work_results.len(),
                "succeeded": succeeded,
                "failed": failed,
                "pending": pending,
                "queued": snapshot.queued,
                "running": snapshot.running,
                "total_attempts": total_attempts,
            },
            "items": items,
        })
    }
}
