//! Shared accounting state: the pending-work queue, in-progress
//! ownership, and per-item results, all guarded by one coarse lock.
//!
//! The transitions are tightly coupled (dequeue must atomically register
//! in-progress; a retry re-enqueue must atomically drop the in-progress
//! entry), and contention is dwarfed by work-item durations, so one lock
//! covers everything.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::batch::{BatchRequest, BatchRunSummarizer};
use crate::endpoint::{EndpointManager, ManagerId};
use crate::work_item::{WorkItemRequest, WorkItemResult};

#[derive(Default)]
pub(crate) struct Accounting {
    /// FIFO of pending work items.
    pub queue: VecDeque<WorkItemRequest>,
    /// filepath -> the request currently being worked somewhere.
    pub in_progress: HashMap<String, WorkItemRequest>,
    /// filepath -> identity of the manager working it. Key set always
    /// matches `in_progress`.
    pub in_progress_owner: HashMap<String, ManagerId>,
    /// filepath -> most recent merged result; `None` until a first
    /// attempt concludes.
    pub work_results: HashMap<String, Option<WorkItemResult>>,
    pub stop_requested: bool,
    /// Names of retired managers. Anything they report is dropped, and
    /// their next steal returns the retire sentinel.
    pub old_managers: HashSet<String>,
    pub on_batch_id: Option<i64>,
    /// The request currently (or most recently) being processed; drives
    /// processor/checker selection during hot-swap.
    pub current_request: Option<Arc<dyn BatchRequest>>,
    pub summarizer: Option<Arc<dyn BatchRunSummarizer>>,
    /// The live endpoint fleet.
    pub managers: Vec<Arc<EndpointManager>>,
    /// Bumped per hot-swap; used only for naming manager generations.
    pub endpoint_generation: u64,
    // Callback entry counts, surfaced by the debug loop.
    pub cnt_success_cb: u64,
    pub cnt_failure_cb: u64,
}

impl Accounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing queued and nothing in progress: the batch is finished
    /// (or was never populated).
    pub fn quiescent(&self) -> bool {
        self.queue.is_empty() && self.in_progress.is_empty()
    }

    pub fn drain_queue(&mut self) {
        self.queue.clear();
    }

    /// Fold a result into the record for its filepath. The incoming
    /// `attempts` counts attempts since the last merge, so it is added to
    /// the stored total rather than replacing it; everything else is
    /// taken from the newest result.
    pub fn merge_result(&mut self, mut result: WorkItemResult) {
        let entry = self
            .work_results
            .entry(result.filepath.clone())
            .or_insert(None);
        if let Some(prior) = entry {
            result.attempts += prior.attempts;
        }
        *entry = Some(result);
    }

    /// Total attempts recorded so far for a filepath.
    pub fn recorded_attempts(&self, filepath: &str) -> u32 {
        self.work_results
            .get(filepath)
            .and_then(|r| r.as_ref())
            .map(|r| r.attempts)
            .unwrap_or(0)
    }

    /// Retire every current manager: request stop and record the names so
    /// pending callbacks are dropped.
    pub fn retire_all_managers(&mut self) {
        for manager in &self.managers {
            manager.request_stop();
        }
        let names: Vec<String> = self.managers.iter().map(|m| m.name().to_string()).collect();
        self.old_managers.extend(names);
    }
}
