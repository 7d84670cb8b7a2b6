//! Endpoint health checking seam.

use async_trait::async_trait;

use crate::config::EndpointConfig;

/// Decides whether an endpoint looks able to accept work right now.
///
/// Batch request types supply a checker appropriate for their endpoint
/// flavor; workers consult it before pulling work so a dead endpoint
/// idles instead of burning every item's retry budget.
#[async_trait]
pub trait EndpointStatusChecker: Send + Sync {
    async fn is_healthy(&self, endpoint_name: &str, config: &EndpointConfig) -> bool;
}

/// Checker used while no batch is active (endpoint flavor unknown).
/// Assumes reachable.
pub struct UnknownEndpointStatusChecker;

#[async_trait]
impl EndpointStatusChecker for UnknownEndpointStatusChecker {
    async fn is_healthy(&self, _endpoint_name: &str, _config: &EndpointConfig) -> bool {
        true
    }
}
