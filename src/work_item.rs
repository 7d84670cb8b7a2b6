//! Work item request and result types shared between the orchestrator and
//! endpoint managers.

use serde::{Deserialize, Serialize};

/// A single unit of schedulable work: one file plus routing metadata.
///
/// The orchestrator owns a work item from enqueue until a terminal result
/// is recorded for it. Everything beyond `filepath` and `language` is
/// opaque to the scheduling core and consumed only by the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemRequest {
    /// Stable identifier, unique within a batch.
    pub filepath: String,
    /// Language tag used to route the item to a matching endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Producer-supplied fields passed through to the work item processor.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl WorkItemRequest {
    pub fn new(filepath: impl Into<String>) -> Self {
        Self {
            filepath: filepath.into(),
            language: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Outcome of one round of attempts at a work item.
///
/// `attempts` counts attempts made since the last merge into the
/// orchestrator's records, not the absolute total; the orchestrator
/// accumulates it across merges for the same filepath.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemResult {
    pub filepath: String,
    pub succeeded: bool,
    pub attempts: u32,
    /// Whether the failure is worth retrying. Ignored on success.
    pub can_retry: bool,
    /// Name of the endpoint that produced this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkItemResult {
    /// A successful single attempt.
    pub fn success(filepath: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            filepath: filepath.into(),
            succeeded: true,
            attempts: 1,
            can_retry: false,
            endpoint: Some(endpoint.into()),
            latency_secs: None,
            error: None,
        }
    }

    /// A failed single attempt.
    pub fn failure(
        filepath: impl Into<String>,
        endpoint: impl Into<String>,
        can_retry: bool,
        error: impl Into<String>,
    ) -> Self {
        Self {
            filepath: filepath.into(),
            succeeded: false,
            attempts: 1,
            can_retry,
            endpoint: Some(endpoint.into()),
            latency_secs: None,
            error: Some(error.into()),
        }
    }

    pub fn with_latency(mut self, latency_secs: f64) -> Self {
        self.latency_secs = Some(latency_secs);
        self
    }
}

/// What `steal_work` hands back to an asking endpoint manager.
#[derive(Debug, Clone)]
pub enum StolenWork {
    Item(WorkItemRequest),
    /// Give up: the asking manager is retired or the orchestrator is
    /// stopping.
    Retire,
}
