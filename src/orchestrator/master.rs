//! The master loop: one batch at a time from the submission stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::status::BatchStatus;
use crate::utils::combine_result_files;

use super::summary::SummaryWrite;
use super::{OrchestratorInner, Submission};

impl OrchestratorInner {
    /// Keep doing batches until the stop sentinel arrives.
    pub(crate) async fn master_loop(
        self: Arc<Self>,
        mut submissions: mpsc::UnboundedReceiver<Submission>,
    ) {
        loop {
            let request = match submissions.recv().await {
                Some(Submission::Batch(request)) => request,
                Some(Submission::Stop) | None => {
                    self.master_finalize().await;
                    return;
                }
            };
            let batch_id = request.batch_id();

            // Record the request type first; hot-swap derives the
            // processor and status checker from it.
            {
                let mut acct = self.accounting.lock().await;
                acct.current_request = Some(Arc::clone(&request));
            }

            // The batch may have been deleted while waiting.
            if self.status_provider.is_deleted(batch_id).await {
                info!("Skipping batch {} because it was marked deleted", batch_id);
                continue;
            }

            // Recreate endpoints on start of a new batch; the previous
            // batch may have retired some (language mismatch or cancel).
            self.hotswap_endpoint_managers().await;

            {
                let mut acct = self.accounting.lock().await;
                if acct.stop_requested {
                    drop(acct);
                    self.master_finalize().await;
                    return;
                }

                // Per-batch record keeping resets unless results roll up
                // into a singleton summary.
                if self.settings.singleton_run_summary_path.is_none() {
                    acct.work_results.clear();
                }
                acct.summarizer = Some(request.run_summarizer());

                info!("Starting batch {}", batch_id);
                acct.on_batch_id = Some(batch_id);
                self.completion_tx.send_replace(false);
                self.summary_gate_tx.send_replace(true);
                assert!(
                    acct.in_progress.is_empty(),
                    "work still tracked as in progress at batch start"
                );
                assert!(acct.queue.is_empty(), "work still queued at batch start");

                let base_path = self.status_provider.batch_base_path(batch_id);
                for work in request.make_work_items(
                    &base_path,
                    &self.settings.cache_search_dirs,
                    &self.settings.log_folder,
                ) {
                    acct.work_results.insert(work.filepath.clone(), None);
                    acct.queue.push_back(work);
                }
                self.queue_notify.notify_waiters();

                // A batch that materialized no work items is already done.
                if acct.quiescent() {
                    self.completion_tx.send_replace(true);
                }
            }

            // Ensure the batch has not since been canceled, and commit the
            // transition to running. The provider lock serializes this
            // against external deleters.
            let canceled = {
                let _status_guard = self.status_provider.status_lock().lock().await;
                if self.status_provider.is_deleted(batch_id).await {
                    true
                } else {
                    if let Err(e) = self
                        .status_provider
                        .change_status(batch_id, BatchStatus::Running)
                        .await
                    {
                        warn!("Could not mark batch {} running: {}", batch_id, e);
                    }
                    false
                }
            };
            if canceled {
                self.cancel_running_batch(batch_id).await;
            }

            // Wait for completion or early stop. Either way, nothing is
            // queued and nothing is in progress when we wake.
            let mut completion = self.completion_tx.subscribe();
            let _ = completion.wait_for(|done| *done).await;

            let canceled = self.status_provider.is_deleted(batch_id).await;
            if canceled {
                info!("Canceled processing batch {}", batch_id);
            } else {
                info!("Completed batch {}", batch_id);
            }

            // Per-batch terminal summary; in singleton mode the file is
            // refreshed but the conclusion is saved for finalization.
            let _ = self
                .write_summary_information(SummaryWrite {
                    write_run_summary: true,
                    write_retries: 10,
                    log_conclusion: self.settings.singleton_run_summary_path.is_none(),
                    allow_fail: true,
                })
                .await;

            if !canceled && request.combine_results() {
                info!("Concatenating batch {} results to a single file", batch_id);
                let base_path = self.status_provider.batch_base_path(batch_id);
                if let Err(e) = combine_result_files(&request.files(), &base_path).await {
                    warn!("Combining results for batch {} failed: {}", batch_id, e);
                }
            }

            // Status flips last so results are committed first for any
            // event-driven observers.
            {
                let _status_guard = self.status_provider.status_lock().lock().await;
                if self.status_provider.is_deleted(batch_id).await {
                    // Remove artifacts that may have been created after
                    // deletion was requested.
                    if let Err(e) = self.status_provider.delete_batch(batch_id).await {
                        warn!("Deleting batch {} failed: {}", batch_id, e);
                    }
                } else {
                    match self
                        .status_provider
                        .change_status(batch_id, BatchStatus::Done)
                        .await
                    {
                        Ok(()) => info!("Updated batch status to done: {}", batch_id),
                        Err(e) => warn!("Could not mark batch {} done: {}", batch_id, e),
                    }
                }
            }

            // Another batch may not show up for a while (or ever); stop
            // the periodic summary until one does.
            self.summary_gate_tx.send_replace(false);
        }
    }

    /// Work to be done before the master task exits.
    async fn master_finalize(&self) {
        if self.settings.singleton_run_summary_path.is_some() {
            let _ = self
                .write_summary_information(SummaryWrite {
                    write_run_summary: false,
                    write_retries: 3,
                    log_conclusion: true,
                    allow_fail: true,
                })
                .await;
        }
    }
}
