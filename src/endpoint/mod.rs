//! Endpoint managers: per-endpoint worker pools that pull work from the
//! orchestrator and report outcomes.
//!
//! Managers never hold a reference to the orchestrator itself; they see
//! only the narrow [`WorkSource`] callback surface, which breaks the
//! manager/orchestrator reference cycle.

mod status;

pub use status::{EndpointStatusChecker, UnknownEndpointStatusChecker};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::EndpointConfig;
use crate::processor::{ProcessContext, WorkItemProcessor};
use crate::work_item::{StolenWork, WorkItemResult};

/// How long a worker waits before re-probing an unhealthy endpoint.
const HEALTH_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Identity a manager presents when calling back into the work source.
#[derive(Debug, Clone)]
pub struct ManagerId {
    /// Generation-tagged unique name.
    pub name: String,
    /// Logical endpoint this manager serves.
    pub endpoint_name: String,
    /// Language the endpoint is configured for.
    pub language: Option<String>,
}

/// The orchestrator-side callbacks offered to endpoint managers.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Block until there is a work item for this manager, or until the
    /// manager should give up (retired, or the orchestrator is stopping).
    async fn steal_work(&self, manager: &ManagerId) -> StolenWork;

    async fn notify_work_success(&self, filepath: &str, manager: &ManagerId, result: WorkItemResult);

    async fn notify_work_failure(&self, filepath: &str, manager: &ManagerId, result: WorkItemResult);
}

/// Wraps one endpoint with `concurrency` worker tasks that steal work,
/// run it through the processor, and report outcomes.
///
/// Created by the hot-swap engine; destroyed (logically) by retiring its
/// name, after which the work source ignores everything it says.
pub struct EndpointManager {
    name: String,
    endpoint_name: String,
    config: EndpointConfig,
    log_folder: PathBuf,
    cache_search_dirs: Vec<PathBuf>,
    source: Arc<dyn WorkSource>,
    status_checker: RwLock<Arc<dyn EndpointStatusChecker>>,
    global_workitem_lock: Arc<tokio::sync::Mutex<()>>,
    processor: Arc<dyn WorkItemProcessor>,
    stop_requested: AtomicBool,
    // Introspection counters for the debug loop.
    cnt_steals: AtomicU64,
    cnt_success: AtomicU64,
    cnt_failure: AtomicU64,
    current_requests: AtomicUsize,
    in_steal: AtomicBool,
}

impl EndpointManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        endpoint_name: String,
        config: EndpointConfig,
        log_folder: PathBuf,
        cache_search_dirs: Vec<PathBuf>,
        source: Arc<dyn WorkSource>,
        status_checker: Arc<dyn EndpointStatusChecker>,
        global_workitem_lock: Arc<tokio::sync::Mutex<()>>,
        processor: Arc<dyn WorkItemProcessor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            endpoint_name,
            config,
            log_folder,
            cache_search_dirs,
            source,
            status_checker: RwLock::new(status_checker),
            global_workitem_lock,
            processor,
            stop_requested: AtomicBool::new(false),
            cnt_steals: AtomicU64::new(0),
            cnt_success: AtomicU64::new(0),
            cnt_failure: AtomicU64::new(0),
            current_requests: AtomicUsize::new(0),
            in_steal: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn processor_kind(&self) -> &'static str {
        self.processor.kind()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Ask the workers to wind down. Workers blocked in `steal_work`
    /// return once the source wakes them with a retire sentinel.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub async fn set_status_checker(&self, checker: Arc<dyn EndpointStatusChecker>) {
        *self.status_checker.write().await = checker;
    }

    /// Spawn the worker tasks. Workers are detached; they exit on stop or
    /// when the source retires them.
    pub fn start(self: &Arc<Self>) {
        let workers = self.config.concurrency.max(1);
        debug!(
            "Starting endpoint manager {} with {} worker(s)",
            self.name, workers
        );
        for worker_id in 0..workers {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.worker_loop(worker_id).await;
            });
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let id = ManagerId {
            name: self.name.clone(),
            endpoint_name: self.endpoint_name.clone(),
            language: self.config.language.clone(),
        };
        let ctx = ProcessContext {
            endpoint_name: self.endpoint_name.clone(),
            endpoint_config: self.config.clone(),
            log_folder: self.log_folder.clone(),
            cache_search_dirs: self.cache_search_dirs.clone(),
            global_workitem_lock: Arc::clone(&self.global_workitem_lock),
        };

        loop {
            if self.is_stop_requested() {
                break;
            }

            // Wait out an unhealthy endpoint rather than feed it work.
            let checker = self.status_checker.read().await.clone();
            if !checker.is_healthy(&self.endpoint_name, &self.config).await {
                debug!(
                    "Endpoint {} unhealthy; worker {} backing off",
                    self.endpoint_name, worker_id
                );
                tokio::time::sleep(HEALTH_RECHECK_INTERVAL).await;
                continue;
            }

            self.in_steal.store(true, Ordering::SeqCst);
            let stolen = self.source.steal_work(&id).await;
            self.in_steal.store(false, Ordering::SeqCst);

            let item = match stolen {
                StolenWork::Item(item) => item,
                StolenWork::Retire => break,
            };

            self.cnt_steals.fetch_add(1, Ordering::SeqCst);
            self.current_requests.fetch_add(1, Ordering::SeqCst);
            let result = self.processor.process(&item, &ctx).await;
            self.current_requests.fetch_sub(1, Ordering::SeqCst);

            if result.succeeded {
                self.cnt_success.fetch_add(1, Ordering::SeqCst);
                self.source
                    .notify_work_success(&item.filepath, &id, result)
                    .await;
            } else {
                self.cnt_failure.fetch_add(1, Ordering::SeqCst);
                self.source
                    .notify_work_failure(&item.filepath, &id, result)
                    .await;
            }
        }
        debug!("Endpoint manager {} worker {} exited", self.name, worker_id);
    }

    /// Dump introspection state; debug loop only, numbers are racy.
    pub(crate) fn log_debug_state(&self) {
        debug!("Endpoint manager: {}", self.name);
        debug!("   steals: {}", self.cnt_steals.load(Ordering::SeqCst));
        debug!("   successes: {}", self.cnt_success.load(Ordering::SeqCst));
        debug!("   failures: {}", self.cnt_failure.load(Ordering::SeqCst));
        debug!(
            "   in flight: {}",
            self.current_requests.load(Ordering::SeqCst)
        );
        debug!(
            "   stealing now: {}",
            self.in_steal.load(Ordering::SeqCst)
        );
        debug!("   stop requested: {}", self.is_stop_requested());
    }
}
