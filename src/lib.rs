//! Batchmill - batch work orchestration across a hot-swappable endpoint
//! fleet.
//!
//! A long-lived orchestrator consumes a stream of batch requests, breaks
//! each into per-file work items, and distributes them to a pool of
//! endpoint managers that can be reconfigured mid-batch without losing
//! work. Failed items are retried within a budget, progress is published
//! as run summaries, and batch status transitions are persisted through a
//! pluggable provider.

pub mod batch;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod orchestrator;
pub mod processor;
pub mod status;
pub mod utils;
pub mod watcher;
pub mod work_item;

pub use batch::{BatchRequest, BatchRunSummarizer, CommandBatchRequest, RunSnapshot};
pub use config::{EndpointConfig, OrchestratorSettings};
pub use orchestrator::{Orchestrator, OrchestratorSnapshot, Submission};
pub use status::{BatchStatus, FsStatusProvider, StatusProvider};
pub use work_item::{StolenWork, WorkItemRequest, WorkItemResult};
