//! Run-summary publishing.
//!
//! A long-running task gated by a binary open/closed signal: open while a
//! batch runs (and once a stop is requested, so the task can observe it),
//! closed between batches. Snapshots are taken under the accounting lock;
//! the summary is computed and written without holding it.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::batch::RunSnapshot;
use crate::status::StatusError;
use crate::utils::write_json_file_atomic;

use super::OrchestratorInner;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("Summary write I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Status(#[from] StatusError),
}

/// How one summary write should behave.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SummaryWrite {
    /// Whether to persist the summary document at all.
    pub write_run_summary: bool,
    pub write_retries: u32,
    /// Log a conclusion message with final stats and failures.
    pub log_conclusion: bool,
    /// Log write failures instead of returning them.
    pub allow_fail: bool,
}

impl OrchestratorInner {
    pub(crate) async fn run_summary_loop(self: Arc<Self>) {
        let mut gate = self.summary_gate_tx.subscribe();
        loop {
            // Nothing can change between batches; sleep on the gate.
            if gate.wait_for(|open| *open).await.is_err() {
                return;
            }
            if self.stop_requested().await {
                return;
            }

            let batch_active = {
                let acct = self.accounting.lock().await;
                acct.on_batch_id.is_some() && acct.summarizer.is_some()
            };
            if batch_active {
                // This task is too important to die; log and let the
                // repetitive failure loop surface in the logs.
                if let Err(e) = self
                    .write_summary_information(SummaryWrite {
                        write_run_summary: true,
                        write_retries: 5,
                        log_conclusion: false,
                        allow_fail: false,
                    })
                    .await
                {
                    error!("Periodic run summary write failed: {}", e);
                }
            }

            tokio::time::sleep(self.settings.run_summary_interval).await;
        }
    }

    /// Summarize individual item results along with overall progress and
    /// persist them.
    pub(crate) async fn write_summary_information(
        &self,
        opts: SummaryWrite,
    ) -> Result<(), SummaryError> {
        // History serialization: writers queue up here and nowhere else.
        let _write_guard = self.run_summary_lock.lock().await;

        // Consistent snapshot, then report on the snapshot without
        // holding back forward progress.
        let (snapshot, summarizer) = {
            let acct = self.accounting.lock().await;
            (
                RunSnapshot {
                    batch_id: acct.on_batch_id,
                    work_results: acct.work_results.clone(),
                    queued: acct.queue.len(),
                    running: acct.in_progress.len(),
                    started_at: self.started_at,
                    endpoint_managers: acct.managers.len(),
                },
                acct.summarizer.clone(),
            )
        };

        // A summarizer can be missing if termination was signaled before
        // the first batch installed one.
        let summary = match summarizer {
            Some(summarizer) => summarizer.run_summary(&snapshot, opts.log_conclusion),
            None => serde_json::Value::Object(Default::default()),
        };

        if !opts.write_run_summary {
            return Ok(());
        }

        let write_result: Result<(), SummaryError> =
            if let Some(path) = &self.settings.singleton_run_summary_path {
                debug!("Updating singleton run summary: {}", path.display());
                write_json_file_atomic(&summary, path, opts.write_retries)
                    .await
                    .map_err(SummaryError::from)
            } else if let Some(batch_id) = snapshot.batch_id {
                match self.status_provider.set_run_summary(batch_id, &summary).await {
                    // Benign race: the batch directory was deleted very
                    // recently.
                    Err(StatusError::BatchNotFound(_)) => Ok(()),
                    other => other.map_err(SummaryError::from),
                }
            } else {
                Ok(())
            };

        match write_result {
            Ok(()) => {
                // Minimal throttle on repeated writes; we hold the write
                // guard so history stays ordered.
                tokio::time::sleep(self.settings.summary_write_throttle).await;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to write run summary: {}", e);
                if opts.allow_fail {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}
