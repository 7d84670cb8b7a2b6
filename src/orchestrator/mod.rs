//! The orchestrator: supervises batches, distributes work items to the
//! endpoint fleet, and owns the stop/cancel lifecycle.
//!
//! One orchestrator serves a stream of batch requests. Each batch is
//! decomposed into work items that endpoint managers pull via the
//! [`WorkSource`] callbacks; outcomes flow back through the same surface
//! and are folded into the accounting state.

mod accounting;
mod debug;
mod hotswap;
mod master;
mod summary;

pub use summary::SummaryError;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::BatchRequest;
use crate::config::OrchestratorSettings;
use crate::endpoint::{ManagerId, WorkSource};
use crate::status::StatusProvider;
use crate::watcher::{ConfigWatcher, NotifyConfigWatcher, WatchError};
use crate::work_item::{StolenWork, WorkItemResult};

use accounting::Accounting;

/// One message on the submission stream.
pub enum Submission {
    Batch(Arc<dyn BatchRequest>),
    /// Terminate the orchestrator once received.
    Stop,
}

/// Point-in-time view of the orchestrator's accounting, for status
/// commands and tests.
#[derive(Debug, Clone)]
pub struct OrchestratorSnapshot {
    pub batch_id: Option<i64>,
    pub queued: usize,
    pub in_progress: Vec<String>,
    pub managers: Vec<String>,
    pub old_managers: Vec<String>,
    pub stop_requested: bool,
}

pub(crate) struct OrchestratorInner {
    pub(crate) settings: OrchestratorSettings,
    pub(crate) status_provider: Arc<dyn StatusProvider>,
    pub(crate) accounting: Mutex<Accounting>,
    /// Wakes managers blocked in `steal_work`.
    pub(crate) queue_notify: Notify,
    /// Completion event for the batch currently running: `true` once
    /// nothing is queued and nothing is in progress (or the batch was
    /// canceled or the orchestrator stopped).
    pub(crate) completion_tx: watch::Sender<bool>,
    /// Gate for the run-summary task: open while a batch runs and once a
    /// stop is requested, closed between batches.
    pub(crate) summary_gate_tx: watch::Sender<bool>,
    pub(crate) submission_tx: mpsc::UnboundedSender<Submission>,
    /// Serializes summary writes so history ordering is preserved.
    pub(crate) run_summary_lock: Mutex<()>,
    pub(crate) watcher: Mutex<Option<Box<dyn ConfigWatcher>>>,
    /// Offered to work items that need a cross-endpoint critical section.
    pub(crate) global_workitem_lock: Arc<Mutex<()>>,
    pub(crate) started_at: chrono::DateTime<chrono::Utc>,
}

impl OrchestratorInner {
    pub(crate) async fn stop_requested(&self) -> bool {
        self.accounting.lock().await.stop_requested
    }

    /// Arrange for a fast conclusion of any ongoing batch without
    /// finishing its remaining work, and for the master task to exit.
    /// Idempotent; safe to call from any task.
    pub(crate) async fn request_stop(&self) {
        // Stop the config watcher first so no further hot-swaps arrive.
        {
            let mut watcher = self.watcher.lock().await;
            if let Some(mut w) = watcher.take() {
                match w.stop() {
                    Ok(()) | Err(WatchError::AlreadyStopped) => {}
                    Err(e) => warn!("Stopping config watcher failed: {}", e),
                }
            }
        }

        let mut acct = self.accounting.lock().await;
        acct.stop_requested = true;
        acct.drain_queue();
        // Unblock the master loop whether it waits on the stream or on
        // batch completion.
        let _ = self.submission_tx.send(Submission::Stop);
        self.queue_notify.notify_waiters();
        self.completion_tx.send_replace(true);
        for manager in &acct.managers {
            manager.request_stop();
        }
        // Open the gate so the summary task can observe the stop.
        self.summary_gate_tx.send_replace(true);
    }

    /// Finish `batch_id` prematurely, skipping remaining work items.
    /// Returns false if that batch is not the one currently running.
    pub(crate) async fn cancel_running_batch(&self, batch_id: i64) -> bool {
        let mut acct = self.accounting.lock().await;
        if acct.on_batch_id != Some(batch_id) {
            return false;
        }
        info!("Canceling running batch {}", batch_id);
        acct.drain_queue();
        self.queue_notify.notify_waiters();
        // Drop anything tracked as in progress; whatever the workers are
        // still doing finishes or tears down asynchronously and their
        // reports are rejected below.
        acct.in_progress.clear();
        acct.in_progress_owner.clear();
        // The fleet is terminally retired; a new batch recreates it.
        acct.retire_all_managers();
        self.completion_tx.send_replace(true);
        true
    }

    pub(crate) async fn snapshot(&self) -> OrchestratorSnapshot {
        let acct = self.accounting.lock().await;
        OrchestratorSnapshot {
            batch_id: acct.on_batch_id,
            queued: acct.queue.len(),
            in_progress: acct.in_progress.keys().cloned().collect(),
            managers: acct.managers.iter().map(|m| m.name().to_string()).collect(),
            old_managers: acct.old_managers.iter().cloned().collect(),
            stop_requested: acct.stop_requested,
        }
    }
}

#[async_trait]
impl WorkSource for OrchestratorInner {
    async fn steal_work(&self, manager: &ManagerId) -> StolenWork {
        loop {
            // Arm the wakeup before checking state so a notification
            // between the check and the await is never lost.
            let notified = self.queue_notify.notified();
            {
                let mut acct = self.accounting.lock().await;
                if acct.old_managers.contains(&manager.name) || acct.stop_requested {
                    return StolenWork::Retire;
                }
                if let Some(item) = acct.queue.pop_front() {
                    if language_mismatch(&item, manager) {
                        // Put the item back for someone qualified and
                        // retire this manager; a new batch recreates it.
                        debug!(
                            "Manager {} cannot serve {:?} item {}; retiring",
                            manager.name, item.language, item.filepath
                        );
                        acct.queue.push_back(item);
                        self.queue_notify.notify_one();
                        acct.old_managers.insert(manager.name.clone());
                        if let Some(m) = acct
                            .managers
                            .iter()
                            .find(|m| m.name() == manager.name)
                        {
                            m.request_stop();
                        }
                        return StolenWork::Retire;
                    }
                    acct.in_progress
                        .insert(item.filepath.clone(), item.clone());
                    acct.in_progress_owner
                        .insert(item.filepath.clone(), manager.clone());
                    return StolenWork::Item(item);
                }
            }
            // Nothing to do; sleep until an enqueue or a broadcast.
            notified.await;
        }
    }

    async fn notify_work_success(
        &self,
        filepath: &str,
        manager: &ManagerId,
        result: WorkItemResult,
    ) {
        let mut acct = self.accounting.lock().await;
        acct.cnt_success_cb += 1;
        if acct.old_managers.contains(&manager.name) {
            // The item is already back in pending, owned by someone else,
            // or finished. Covers an uncommon race.
            return;
        }
        if acct.stop_requested {
            return;
        }
        acct.in_progress.remove(filepath);
        acct.in_progress_owner.remove(filepath);
        acct.merge_result(result);

        if acct.quiescent() {
            self.completion_tx.send_replace(true);
        }
    }

    async fn notify_work_failure(
        &self,
        filepath: &str,
        manager: &ManagerId,
        result: WorkItemResult,
    ) {
        let mut acct = self.accounting.lock().await;
        acct.cnt_failure_cb += 1;
        if acct.old_managers.contains(&manager.name) {
            return;
        }
        if acct.stop_requested {
            return;
        }

        let can_retry = result.can_retry;
        acct.merge_result(result);

        // Another chance? Retries burned so far are total attempts - 1.
        if can_retry
            && acct.recorded_attempts(filepath).saturating_sub(1) < self.settings.max_retries
        {
            if let Some(item) = acct.in_progress.get(filepath).cloned() {
                debug!("Placed work item {} back into queue since retriable", filepath);
                acct.queue.push_back(item);
                self.queue_notify.notify_one();
            }
        }
        // Either way the item is no longer in progress.
        acct.in_progress.remove(filepath);
        acct.in_progress_owner.remove(filepath);

        // Giving up on the last item also finishes the batch.
        if acct.quiescent() {
            self.completion_tx.send_replace(true);
        }
    }
}

fn language_mismatch(item: &crate::work_item::WorkItemRequest, manager: &ManagerId) -> bool {
    match (&item.language, &manager.language) {
        (Some(want), Some(have)) => !want.eq_ignore_ascii_case(have),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Handle to a running orchestrator.
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
    master: Mutex<Option<JoinHandle<()>>>,
    debug_task: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Spawn the orchestrator task family. Must be called within a tokio
    /// runtime.
    pub fn start(settings: OrchestratorSettings, status_provider: Arc<dyn StatusProvider>) -> Self {
        let (submission_tx, submission_rx) = mpsc::unbounded_channel();
        let (completion_tx, _) = watch::channel(false);
        let (summary_gate_tx, _) = watch::channel(false);

        let inner = Arc::new(OrchestratorInner {
            settings,
            status_provider,
            accounting: Mutex::new(Accounting::new()),
            queue_notify: Notify::new(),
            completion_tx,
            summary_gate_tx,
            submission_tx,
            run_summary_lock: Mutex::new(()),
            watcher: Mutex::new(None),
            global_workitem_lock: Arc::new(Mutex::new(())),
            started_at: chrono::Utc::now(),
        });

        match NotifyConfigWatcher::spawn(
            &inner.settings.config_file,
            Arc::downgrade(&inner),
            tokio::runtime::Handle::current(),
        ) {
            Ok(watcher) => {
                *inner.watcher.try_lock().expect("watcher lock free at startup") =
                    Some(Box::new(watcher));
            }
            Err(e) => warn!(
                "Endpoint configuration will not be watched for changes: {}",
                e
            ),
        }

        let master = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                inner.master_loop(submission_rx).await;
            })
        };
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                inner.run_summary_loop().await;
            });
        }
        let debug_task = inner.settings.debug_loop_interval.map(|interval| {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                inner.debug_loop(interval).await;
            })
        });

        Self {
            inner,
            master: Mutex::new(Some(master)),
            debug_task,
        }
    }

    /// Queue a batch request for processing.
    pub fn submit(&self, request: Arc<dyn BatchRequest>) {
        let _ = self.submission_tx().send(Submission::Batch(request));
    }

    /// Queue the stop sentinel: the master task exits after finishing
    /// whatever batch precedes it on the stream.
    pub fn submit_stop(&self) {
        let _ = self.submission_tx().send(Submission::Stop);
    }

    /// Sender for external batch producers.
    pub fn submission_tx(&self) -> mpsc::UnboundedSender<Submission> {
        self.inner.submission_tx.clone()
    }

    /// Abort any running batch and stop all tasks. Idempotent.
    pub async fn request_stop(&self) {
        self.inner.request_stop().await;
    }

    /// Finish `batch_id` prematurely with remaining work skipped.
    pub async fn cancel_running_batch(&self, batch_id: i64) -> bool {
        self.inner.cancel_running_batch(batch_id).await
    }

    /// Reconcile the endpoint fleet against the configuration file.
    /// Invoked automatically at batch start and on config file changes.
    pub async fn hotswap_endpoint_managers(&self) {
        self.inner.hotswap_endpoint_managers().await;
    }

    pub async fn snapshot(&self) -> OrchestratorSnapshot {
        self.inner.snapshot().await
    }

    pub async fn is_alive(&self) -> bool {
        self.master
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the master task to exit (it only does so after a stop
    /// sentinel or `request_stop`).
    pub async fn join(&self) {
        let handle = self.master.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Master task ended abnormally: {}", e);
            }
        }
        if let Some(debug_task) = &self.debug_task {
            debug_task.abort();
        }
    }
}
