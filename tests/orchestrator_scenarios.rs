//! End-to-end orchestrator scenarios driven by scripted processors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use batchmill::batch::{BatchRequest, BatchRunSummarizer, DefaultRunSummarizer};
use batchmill::config::OrchestratorSettings;
use batchmill::endpoint::{EndpointStatusChecker, UnknownEndpointStatusChecker};
use batchmill::orchestrator::{Orchestrator, OrchestratorSnapshot};
use batchmill::processor::{ProcessContext, WorkItemProcessor};
use batchmill::status::{BatchStatus, FsStatusProvider, StatusProvider};
use batchmill::work_item::{WorkItemRequest, WorkItemResult};

#[derive(Clone)]
enum Outcome {
    Success,
    RetriableFailure,
    PermanentFailure,
}

#[derive(Clone)]
struct Step {
    outcome: Outcome,
    /// Wait for this gate before concluding (simulates long work).
    hold: Option<Arc<Notify>>,
}

impl Step {
    fn ok() -> Self {
        Step {
            outcome: Outcome::Success,
            hold: None,
        }
    }

    fn retriable() -> Self {
        Step {
            outcome: Outcome::RetriableFailure,
            hold: None,
        }
    }

    fn permanent() -> Self {
        Step {
            outcome: Outcome::PermanentFailure,
            hold: None,
        }
    }

    fn held(gate: &Arc<Notify>) -> Self {
        Step {
            outcome: Outcome::Success,
            hold: Some(Arc::clone(gate)),
        }
    }
}

#[derive(Debug, Clone)]
enum ProcEvent {
    Started {
        filepath: String,
        endpoint: String,
    },
    #[allow(dead_code)]
    Finished {
        filepath: String,
        endpoint: String,
        succeeded: bool,
    },
}

/// Deterministic processor: consumes a per-filepath script of steps,
/// emits start/finish events, and records language routing observations.
struct ScriptedProcessor {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    events: mpsc::UnboundedSender<ProcEvent>,
    /// (endpoint language, item language) pairs actually observed.
    routings: Mutex<Vec<(Option<String>, Option<String>)>>,
}

impl ScriptedProcessor {
    fn new(
        scripts: HashMap<String, Vec<Step>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                scripts: Mutex::new(scripts),
                events,
                routings: Mutex::new(Vec::new()),
            }),
            events_rx,
        )
    }

    fn next_step(&self, filepath: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(filepath) {
            Some(steps) if !steps.is_empty() => steps.remove(0),
            _ => Step::ok(),
        }
    }

    fn assert_language_routing(&self) {
        for (endpoint_language, item_language) in self.routings.lock().unwrap().iter() {
            if let Some(item_language) = item_language {
                let endpoint_language = endpoint_language
                    .as_deref()
                    .expect("endpoint without language observed a routed item");
                assert!(
                    endpoint_language.eq_ignore_ascii_case(item_language),
                    "endpoint for {endpoint_language} observed {item_language} item"
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl WorkItemProcessor for ScriptedProcessor {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn process(&self, item: &WorkItemRequest, ctx: &ProcessContext) -> WorkItemResult {
        self.routings.lock().unwrap().push((
            ctx.endpoint_config.language.clone(),
            item.language.clone(),
        ));
        // Claim the script step before announcing the start so observers
        // acting on the event cannot race this attempt's outcome.
        let step = self.next_step(&item.filepath);
        let _ = self.events.send(ProcEvent::Started {
            filepath: item.filepath.clone(),
            endpoint: ctx.endpoint_name.clone(),
        });

        if let Some(gate) = &step.hold {
            gate.notified().await;
        }

        let result = match step.outcome {
            Outcome::Success => WorkItemResult::success(item.filepath.clone(), ctx.endpoint_name.clone()),
            Outcome::RetriableFailure => WorkItemResult::failure(
                item.filepath.clone(),
                ctx.endpoint_name.clone(),
                true,
                "scripted transient failure",
            ),
            Outcome::PermanentFailure => WorkItemResult::failure(
                item.filepath.clone(),
                ctx.endpoint_name.clone(),
                false,
                "scripted permanent failure",
            ),
        };
        let _ = self.events.send(ProcEvent::Finished {
            filepath: item.filepath.clone(),
            endpoint: ctx.endpoint_name.clone(),
            succeeded: result.succeeded,
        });
        result
    }
}

/// Batch request over in-memory items, wired to a scripted processor.
struct TestBatchRequest {
    batch_id: i64,
    items: Vec<WorkItemRequest>,
    processor: Arc<ScriptedProcessor>,
}

impl BatchRequest for TestBatchRequest {
    fn batch_id(&self) -> i64 {
        self.batch_id
    }

    fn combine_results(&self) -> bool {
        false
    }

    fn make_work_items(
        &self,
        _base_path: &Path,
        _cache_search_dirs: &[PathBuf],
        _log_folder: &Path,
    ) -> Vec<WorkItemRequest> {
        self.items.clone()
    }

    fn endpoint_status_checker(&self) -> Arc<dyn EndpointStatusChecker> {
        Arc::new(UnknownEndpointStatusChecker)
    }

    fn work_item_processor(&self) -> Arc<dyn WorkItemProcessor> {
        self.processor.clone()
    }

    fn run_summarizer(&self) -> Arc<dyn BatchRunSummarizer> {
        Arc::new(DefaultRunSummarizer)
    }

    fn files(&self) -> Vec<PathBuf> {
        self.items.iter().map(|i| PathBuf::from(&i.filepath)).collect()
    }
}

struct Harness {
    _tempdir: tempfile::TempDir,
    config_path: PathBuf,
    provider: Arc<FsStatusProvider>,
    settings: OrchestratorSettings,
}

impl Harness {
    fn new(config_yaml: &str) -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let config_path = tempdir.path().join("endpoints.yaml");
        std::fs::write(&config_path, config_yaml).unwrap();
        let log_folder = tempdir.path().join("logs");
        std::fs::create_dir_all(&log_folder).unwrap();
        let provider = Arc::new(FsStatusProvider::new(tempdir.path().join("batches")).unwrap());

        let mut settings = OrchestratorSettings::new(&config_path, &log_folder);
        settings.run_summary_interval = Duration::from_millis(50);
        settings.summary_write_throttle = Duration::from_millis(5);

        Self {
            _tempdir: tempdir,
            config_path,
            provider,
            settings,
        }
    }

    fn rewrite_config(&self, config_yaml: &str) {
        std::fs::write(&self.config_path, config_yaml).unwrap();
    }
}

fn items(names: &[&str]) -> Vec<WorkItemRequest> {
    names.iter().map(|name| WorkItemRequest::new(*name)).collect()
}

async fn wait_until<F>(orchestrator: &Orchestrator, what: &str, pred: F) -> OrchestratorSnapshot
where
    F: Fn(&OrchestratorSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = orchestrator.snapshot().await;
        if pred(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}; last snapshot: {snapshot:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_started(
    events: &mut mpsc::UnboundedReceiver<ProcEvent>,
    filepath: &str,
) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {filepath} to start"))
            .expect("event stream closed");
        if let ProcEvent::Started {
            filepath: started,
            endpoint,
        } = event
        {
            if started == filepath {
                return endpoint;
            }
        }
    }
}

#[tokio::test]
async fn happy_path_records_every_item_once() {
    let harness = Harness::new("ep1:\n  concurrency: 2\n");
    let (processor, _events) = ScriptedProcessor::new(HashMap::new());
    harness.provider.create_batch(1).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 1,
        items: items(&["a.wav", "b.wav", "c.wav"]),
        processor: processor.clone(),
    }));
    orchestrator.submit_stop();
    orchestrator.join().await;

    assert_eq!(
        harness.provider.read_status(1).await,
        Some(BatchStatus::Done)
    );
    let summary = harness.provider.read_run_summary(1).await.unwrap();
    assert_eq!(summary["overall"]["total"], 3);
    assert_eq!(summary["overall"]["succeeded"], 3);
    assert_eq!(summary["overall"]["failed"], 0);
    for file in ["a.wav", "b.wav", "c.wav"] {
        assert_eq!(summary["items"][file]["attempts"], 1, "{file}");
        assert_eq!(summary["items"][file]["succeeded"], true, "{file}");
    }
    processor.assert_language_routing();
}

#[tokio::test]
async fn transient_failure_retries_and_accumulates_attempts() {
    let harness = Harness::new("ep1: {}\n");
    let mut scripts = HashMap::new();
    scripts.insert("x.wav".to_string(), vec![Step::retriable(), Step::ok()]);
    let (processor, _events) = ScriptedProcessor::new(scripts);
    harness.provider.create_batch(2).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 2,
        items: items(&["x.wav"]),
        processor,
    }));
    orchestrator.submit_stop();
    orchestrator.join().await;

    let summary = harness.provider.read_run_summary(2).await.unwrap();
    assert_eq!(summary["items"]["x.wav"]["attempts"], 2);
    assert_eq!(summary["items"]["x.wav"]["succeeded"], true);
}

#[tokio::test]
async fn retry_budget_exhaustion_records_failure_and_completes() {
    let mut harness = Harness::new("ep1: {}\n");
    harness.settings.max_retries = 2;
    let mut scripts = HashMap::new();
    scripts.insert(
        "y.wav".to_string(),
        vec![Step::retriable(), Step::retriable(), Step::retriable()],
    );
    let (processor, _events) = ScriptedProcessor::new(scripts);
    harness.provider.create_batch(3).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 3,
        items: items(&["y.wav"]),
        processor,
    }));
    orchestrator.submit_stop();
    orchestrator.join().await;

    assert_eq!(
        harness.provider.read_status(3).await,
        Some(BatchStatus::Done)
    );
    let summary = harness.provider.read_run_summary(3).await.unwrap();
    // Budget of 2 retries means at most 3 attempts.
    assert_eq!(summary["items"]["y.wav"]["attempts"], 3);
    assert_eq!(summary["items"]["y.wav"]["succeeded"], false);
    assert_eq!(summary["overall"]["failed"], 1);
}

#[tokio::test]
async fn permanent_failure_is_never_retried() {
    let harness = Harness::new("ep1: {}\n");
    let mut scripts = HashMap::new();
    scripts.insert("z.wav".to_string(), vec![Step::permanent()]);
    let (processor, _events) = ScriptedProcessor::new(scripts);
    harness.provider.create_batch(4).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 4,
        items: items(&["z.wav"]),
        processor,
    }));
    orchestrator.submit_stop();
    orchestrator.join().await;

    let summary = harness.provider.read_run_summary(4).await.unwrap();
    assert_eq!(summary["items"]["z.wav"]["attempts"], 1);
    assert_eq!(summary["items"]["z.wav"]["succeeded"], false);
}

#[tokio::test]
async fn hotswap_moves_in_progress_work_to_replacement_endpoint() {
    let harness = Harness::new("e1:\n  concurrency: 1\n");
    let gate = Arc::new(Notify::new());
    let mut scripts = HashMap::new();
    scripts.insert("a.wav".to_string(), vec![Step::held(&gate), Step::ok()]);
    let (processor, mut events) = ScriptedProcessor::new(scripts);
    harness.provider.create_batch(5).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 5,
        items: items(&["a.wav"]),
        processor: processor.clone(),
    }));

    // The item is being worked by the first-generation manager.
    let first_endpoint = wait_started(&mut events, "a.wav").await;
    assert_eq!(first_endpoint, "e1");

    // Reconfigure: e1 disappears, e2 takes over.
    harness.rewrite_config("e2:\n  concurrency: 1\n");
    orchestrator.hotswap_endpoint_managers().await;

    let snapshot = wait_until(&orchestrator, "e1 retirement", |s| {
        s.old_managers.iter().any(|name| name.ends_with("_e1"))
    })
    .await;
    assert!(snapshot.managers.iter().any(|name| name.ends_with("_e2")));

    // e2 steals the reassigned item and completes it.
    let second_endpoint = wait_started(&mut events, "a.wav").await;
    assert_eq!(second_endpoint, "e2");

    orchestrator.submit_stop();
    orchestrator.join().await;

    // The first manager finishes late; its report must change nothing.
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let summary = harness.provider.read_run_summary(5).await.unwrap();
    assert_eq!(summary["overall"]["total"], 1);
    assert_eq!(summary["items"]["a.wav"]["succeeded"], true);
    // Only the replacement's attempt is recorded.
    assert_eq!(summary["items"]["a.wav"]["attempts"], 1);
    assert_eq!(summary["items"]["a.wav"]["endpoint"], "e2");
}

#[tokio::test]
async fn hotswap_keeps_unchanged_endpoints_and_their_work() {
    let harness = Harness::new("e1:\n  concurrency: 1\ne2:\n  concurrency: 1\n");
    let gate_a = Arc::new(Notify::new());
    let gate_b = Arc::new(Notify::new());
    let mut scripts = HashMap::new();
    scripts.insert("a.wav".to_string(), vec![Step::held(&gate_a), Step::ok()]);
    scripts.insert("b.wav".to_string(), vec![Step::held(&gate_b), Step::ok()]);
    let (processor, mut events) = ScriptedProcessor::new(scripts);
    harness.provider.create_batch(6).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 6,
        items: items(&["a.wav", "b.wav"]),
        processor: processor.clone(),
    }));

    // Both items in flight, one per endpoint (either assignment).
    let mut started: HashMap<String, String> = HashMap::new();
    while started.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for both items to start")
            .expect("event stream closed");
        if let ProcEvent::Started { filepath, endpoint } = event {
            started.insert(filepath, endpoint);
        }
    }
    let first = started["a.wav"].clone();
    let second = started["b.wav"].clone();
    assert_ne!(first, second);

    // Drop e2 from the fleet; e1 is untouched.
    harness.rewrite_config("e1:\n  concurrency: 1\n");
    orchestrator.hotswap_endpoint_managers().await;

    let survivor_item = if first == "e1" { "a.wav" } else { "b.wav" };
    let snapshot = wait_until(&orchestrator, "e2 retirement", |s| {
        s.old_managers.iter().any(|name| name.ends_with("_e2"))
    })
    .await;
    // The surviving manager kept its generation-0 name and its item; the
    // retired manager's item went back on the queue.
    assert_eq!(snapshot.managers, vec!["HotswapGen0_e1".to_string()]);
    assert_eq!(snapshot.in_progress, vec![survivor_item.to_string()]);
    assert_eq!(snapshot.queued, 1);

    // Let both finish: the survivor completes its item, then picks up the
    // reassigned one; the retired manager's late report is dropped.
    gate_a.notify_one();
    gate_b.notify_one();

    orchestrator.submit_stop();
    orchestrator.join().await;

    let summary = harness.provider.read_run_summary(6).await.unwrap();
    assert_eq!(summary["overall"]["succeeded"], 2);
    processor.assert_language_routing();
}

#[tokio::test]
async fn language_mismatch_retires_manager_and_requeues_item() {
    let harness = Harness::new("fr-endpoint:\n  language: fr\n");
    let (processor, _events) = ScriptedProcessor::new(HashMap::new());
    harness.provider.create_batch(7).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 7,
        items: vec![WorkItemRequest::new("en.wav").with_language(Some("en".to_string()))],
        processor: processor.clone(),
    }));

    // The only manager cannot serve the item: it is retired and the item
    // stays queued for someone qualified.
    let snapshot = wait_until(&orchestrator, "mismatch retirement", |s| {
        s.old_managers
            .iter()
            .any(|name| name.ends_with("_fr-endpoint"))
    })
    .await;
    assert_eq!(snapshot.queued, 1);
    assert!(snapshot.in_progress.is_empty());

    // Nothing can finish this batch; cancel it to conclude.
    assert!(orchestrator.cancel_running_batch(7).await);
    orchestrator.submit_stop();
    orchestrator.join().await;

    // The mismatched manager never saw the item.
    processor.assert_language_routing();
    let summary = harness.provider.read_run_summary(7).await.unwrap();
    assert_eq!(summary["items"]["en.wav"]["status"], "pending");
}

#[tokio::test]
async fn a_new_batch_replaces_managers_retired_by_mismatch() {
    let harness = Harness::new("ep:\n  language: fr\n");
    let (processor, _events) = ScriptedProcessor::new(HashMap::new());
    harness.provider.create_batch(8).await.unwrap();
    harness.provider.create_batch(9).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 8,
        items: vec![WorkItemRequest::new("en.wav").with_language(Some("en".to_string()))],
        processor: processor.clone(),
    }));

    wait_until(&orchestrator, "mismatch retirement", |s| {
        !s.old_managers.is_empty()
    })
    .await;
    assert!(orchestrator.cancel_running_batch(8).await);

    // The follow-up batch carries compatible items; the batch-start
    // hot-swap builds a fresh generation of the same endpoint.
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 9,
        items: vec![WorkItemRequest::new("fr.wav").with_language(Some("FR".to_string()))],
        processor: processor.clone(),
    }));
    orchestrator.submit_stop();
    orchestrator.join().await;

    assert_eq!(
        harness.provider.read_status(9).await,
        Some(BatchStatus::Done)
    );
    let summary = harness.provider.read_run_summary(9).await.unwrap();
    assert_eq!(summary["items"]["fr.wav"]["succeeded"], true);
    processor.assert_language_routing();
}

#[tokio::test]
async fn cancel_during_run_clears_accounting_and_ignores_late_reports() {
    let harness = Harness::new("ep1:\n  concurrency: 1\n");
    let gate = Arc::new(Notify::new());
    let mut scripts = HashMap::new();
    scripts.insert("c.wav".to_string(), vec![Step::held(&gate)]);
    let (processor, mut events) = ScriptedProcessor::new(scripts);
    harness.provider.create_batch(10).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 10,
        items: items(&["a.wav", "b.wav", "c.wav", "d.wav", "e.wav"]),
        processor: processor.clone(),
    }));

    // Single worker: a and b complete, c blocks, d and e stay queued.
    wait_started(&mut events, "c.wav").await;
    let before = wait_until(&orchestrator, "c in progress", |s| {
        s.in_progress == vec!["c.wav".to_string()]
    })
    .await;
    assert_eq!(before.queued, 2);

    assert!(orchestrator.cancel_running_batch(10).await);
    // Canceling some other batch is a no-op.
    assert!(!orchestrator.cancel_running_batch(999).await);

    let after = orchestrator.snapshot().await;
    assert_eq!(after.queued, 0);
    assert!(after.in_progress.is_empty());
    for manager in &after.managers {
        assert!(after.old_managers.contains(manager));
    }

    // The orphaned worker finishes eventually; its report is dropped.
    gate.notify_one();
    orchestrator.submit_stop();
    orchestrator.join().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let end = orchestrator.snapshot().await;
    assert!(end.in_progress.is_empty());
    assert_eq!(end.queued, 0);

    let summary = harness.provider.read_run_summary(10).await.unwrap();
    assert_eq!(summary["items"]["a.wav"]["succeeded"], true);
    assert_eq!(summary["items"]["b.wav"]["succeeded"], true);
    assert_eq!(summary["items"]["c.wav"]["status"], "pending");
    assert_eq!(summary["overall"]["succeeded"], 2);
    assert_eq!(summary["overall"]["pending"], 3);
}

#[tokio::test]
async fn deleted_batches_are_skipped() {
    let harness = Harness::new("ep1: {}\n");
    let (processor, _events) = ScriptedProcessor::new(HashMap::new());
    harness.provider.create_batch(11).await.unwrap();
    harness.provider.delete_batch(11).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 11,
        items: items(&["a.wav"]),
        processor,
    }));
    orchestrator.submit_stop();
    orchestrator.join().await;

    assert!(harness.provider.is_deleted(11).await);
    assert!(harness.provider.read_run_summary(11).await.is_none());
}

#[tokio::test]
async fn empty_batch_completes_immediately() {
    let harness = Harness::new("ep1: {}\n");
    let (processor, _events) = ScriptedProcessor::new(HashMap::new());
    harness.provider.create_batch(12).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 12,
        items: Vec::new(),
        processor,
    }));
    orchestrator.submit_stop();
    orchestrator.join().await;

    assert_eq!(
        harness.provider.read_status(12).await,
        Some(BatchStatus::Done)
    );
}

#[tokio::test]
async fn request_stop_is_idempotent_and_terminates_the_master() {
    let harness = Harness::new("ep1:\n  concurrency: 1\n");
    let gate = Arc::new(Notify::new());
    let mut scripts = HashMap::new();
    scripts.insert("a.wav".to_string(), vec![Step::held(&gate)]);
    let (processor, mut events) = ScriptedProcessor::new(scripts);
    harness.provider.create_batch(13).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 13,
        items: items(&["a.wav", "b.wav"]),
        processor,
    }));
    wait_started(&mut events, "a.wav").await;

    orchestrator.request_stop().await;
    orchestrator.request_stop().await;
    orchestrator.join().await;
    assert!(!orchestrator.is_alive().await);

    let snapshot = orchestrator.snapshot().await;
    assert!(snapshot.stop_requested);
    assert_eq!(snapshot.queued, 0);
    gate.notify_one();
}

#[tokio::test]
async fn mixed_outcomes_across_two_endpoints_settle_every_item() {
    let mut harness = Harness::new("e1:\n  concurrency: 2\ne2:\n  concurrency: 2\n");
    harness.settings.max_retries = 2;
    let mut scripts = HashMap::new();
    for i in 0..20 {
        let filepath = format!("f{i:02}.wav");
        let steps = match i % 4 {
            1 => vec![Step::retriable(), Step::ok()],
            2 => vec![Step::retriable(), Step::retriable(), Step::retriable()],
            3 => vec![Step::permanent()],
            _ => vec![Step::ok()],
        };
        scripts.insert(filepath, steps);
    }
    let (processor, _events) = ScriptedProcessor::new(scripts);
    harness.provider.create_batch(14).await.unwrap();

    let orchestrator = Orchestrator::start(harness.settings.clone(), harness.provider.clone());
    let names: Vec<String> = (0..20).map(|i| format!("f{i:02}.wav")).collect();
    orchestrator.submit(Arc::new(TestBatchRequest {
        batch_id: 14,
        items: names.iter().map(|name| WorkItemRequest::new(name.clone())).collect(),
        processor,
    }));
    orchestrator.submit_stop();
    orchestrator.join().await;

    let summary = harness.provider.read_run_summary(14).await.unwrap();
    assert_eq!(summary["overall"]["total"], 20);
    assert_eq!(summary["overall"]["pending"], 0);
    for name in &names {
        let item = &summary["items"][name];
        let attempts = item["attempts"].as_u64().unwrap();
        assert!(attempts >= 1 && attempts <= 3, "{name}: {attempts} attempts");
    }
    // 5 of each residue class: 10 first-try successes, 5 retried
    // successes, 5 exhausted or permanent failures.
    assert_eq!(summary["overall"]["succeeded"], 15);
    assert_eq!(summary["overall"]["failed"], 5);
}
