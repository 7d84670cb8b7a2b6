//! Periodic introspection dump.
//!
//! Development and stuck-run forensics only; the reported numbers are
//! sampled without coordination and may be mutually inconsistent.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::OrchestratorInner;

impl OrchestratorInner {
    pub(crate) async fn debug_loop(self: Arc<Self>, interval: Duration) {
        let mut last_cnt_success = 0u64;
        loop {
            // Probe before taking the lock: a persistently-taken lock is
            // the first thing to look for in a stall.
            let lock_taken = self.accounting.try_lock().is_err();
            debug!("Accounting lock taken: {}", lock_taken);

            {
                let acct = self.accounting.lock().await;
                debug!("Stop requested: {}", acct.stop_requested);
                debug!("On batch id: {:?}", acct.on_batch_id);
                debug!("Work queue size: {}", acct.queue.len());
                debug!("Num in progress: {}", acct.in_progress.len());
                debug!("Success callback entries: {}", acct.cnt_success_cb);
                debug!(
                    "Work items completed since last debug print: {}",
                    acct.cnt_success_cb - last_cnt_success
                );
                last_cnt_success = acct.cnt_success_cb;
                debug!("Failure callback entries: {}", acct.cnt_failure_cb);
                debug!("Number of old endpoint managers: {}", acct.old_managers.len());
                for manager in &acct.managers {
                    manager.log_debug_state();
                }
            }

            tokio::time::sleep(interval).await;
        }
    }
}
