//! Endpoint fleet reconciliation ("hot-swap").
//!
//! Invoked on configuration file changes and at batch start. Managers
//! whose configuration survived unchanged keep running; everything else
//! is retired and replaced, and work in progress on retired managers
//! goes back on the queue. At no point is a work item both queued and in
//! progress.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::load_configuration;
use crate::endpoint::{
    EndpointManager, EndpointStatusChecker, UnknownEndpointStatusChecker, WorkSource,
};
use crate::processor::{StubWorkItemProcessor, WorkItemProcessor};

use super::OrchestratorInner;

impl OrchestratorInner {
    pub(crate) async fn hotswap_endpoint_managers(self: &Arc<Self>) {
        let config_data =
            match load_configuration(&self.settings.config_file, self.settings.strict_config) {
                Ok(config) => config,
                Err(e) => {
                    // Keep the old fleet; it is all we have to go on.
                    // Overwriting the file triggers another attempt.
                    error!(
                        "Invalid endpoint configuration file {}: {}",
                        self.settings.config_file.display(),
                        e
                    );
                    return;
                }
            };

        let mut acct = self.accounting.lock().await;
        if acct.stop_requested {
            return;
        }

        // Unique generation for this fleet, for naming and log forensics.
        let gen = acct.endpoint_generation;
        acct.endpoint_generation += 1;

        // Checker and processor follow the type of batch being processed;
        // stub instances serve until a first batch arrives.
        let (checker, processor): (Arc<dyn EndpointStatusChecker>, Arc<dyn WorkItemProcessor>) =
            match &acct.current_request {
                Some(request) => (request.endpoint_status_checker(), request.work_item_processor()),
                None => (
                    Arc::new(UnknownEndpointStatusChecker),
                    Arc::new(StubWorkItemProcessor),
                ),
            };

        // Start by assuming every manager is going away; rescue the ones
        // whose endpoint is preserved verbatim in the new configuration.
        let mut deleted: HashMap<String, Arc<EndpointManager>> = acct
            .managers
            .iter()
            .map(|m| (m.endpoint_name().to_string(), Arc::clone(m)))
            .collect();

        let mut new_managers = Vec::new();
        for (endpoint_name, endpoint_config) in &config_data {
            if let Some(existing) = deleted.get(endpoint_name) {
                if existing.config() == endpoint_config
                    && existing.processor_kind() == processor.kind()
                    && !existing.is_stop_requested()
                {
                    // Untouched endpoint and the processor still fits:
                    // neither delete nor recreate.
                    deleted.remove(endpoint_name);
                    continue;
                }
            }
            new_managers.push(EndpointManager::new(
                format!("HotswapGen{gen}_{endpoint_name}"),
                endpoint_name.clone(),
                endpoint_config.clone(),
                self.settings.log_folder.clone(),
                self.settings.cache_search_dirs.clone(),
                Arc::clone(self) as Arc<dyn WorkSource>,
                Arc::clone(&checker),
                Arc::clone(&self.global_workitem_lock),
                Arc::clone(&processor),
            ));
        }

        if acct.stop_requested {
            return;
        }

        // Stop the managers being deleted. Once their names are recorded,
        // anything they might still call back with is rejected, so work
        // in progress can be moved safely.
        let retired_now: Vec<String> = acct
            .managers
            .iter()
            .filter(|m| deleted.contains_key(m.endpoint_name()))
            .map(|m| m.name().to_string())
            .collect();
        for manager in &acct.managers {
            if deleted.contains_key(manager.endpoint_name()) {
                manager.request_stop();
            }
        }
        acct.old_managers.extend(retired_now.iter().cloned());

        // Free up work items owned by deleted managers.
        let orphaned: Vec<String> = acct
            .in_progress_owner
            .iter()
            .filter(|(_, owner)| retired_now.contains(&owner.name))
            .map(|(filepath, _)| filepath.clone())
            .collect();
        for filepath in orphaned {
            acct.in_progress_owner.remove(&filepath);
            if let Some(item) = acct.in_progress.remove(&filepath) {
                acct.queue.push_back(item);
            }
        }

        // The queue may have been repopulated, and retired managers
        // blocked waiting for work must wake to learn of their
        // termination.
        self.queue_notify.notify_waiters();

        for manager in &new_managers {
            manager.start();
        }

        let survivors: Vec<Arc<EndpointManager>> = acct
            .managers
            .iter()
            .filter(|m| !deleted.contains_key(m.endpoint_name()))
            .cloned()
            .collect();
        acct.managers = survivors;
        acct.managers.extend(new_managers);

        // All managers track the checker for the current request type.
        for manager in &acct.managers {
            manager.set_status_checker(Arc::clone(&checker)).await;
        }
        drop(acct);

        info!(
            "Endpoint fleet after hot-swap (generation {}): {:?}",
            gen,
            config_data.keys().collect::<Vec<_>>()
        );
    }
}
