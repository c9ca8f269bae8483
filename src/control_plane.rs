//! Control-plane capability: policy attachment and endpoint discovery
//!
//! The session manager only calls these two operations. Talking to the real
//! management API is the embedding application's business.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("Policy {policy} could not be attached to {principal}: {reason}")]
    AttachFailed {
        principal: String,
        policy: String,
        reason: String,
    },
    #[error("Endpoint lookup failed: {0}")]
    EndpointLookup(String),
    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Attach an access policy to a principal
    async fn attach_policy(&self, principal: &str, policy_name: &str)
        -> Result<(), ControlPlaneError>;

    /// Broker host to connect to
    async fn describe_endpoint(&self) -> Result<String, ControlPlaneError>;
}

/// Control plane backed by a fixed endpoint
///
/// Used when the broker host is known up front. It cannot attach policies;
/// callers asking it to get an `Unsupported` error.
#[derive(Debug, Clone)]
pub struct StaticControlPlane {
    endpoint: Option<String>,
}

impl StaticControlPlane {
    pub fn new(endpoint: Option<String>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl ControlPlane for StaticControlPlane {
    async fn attach_policy(
        &self,
        principal: &str,
        policy_name: &str,
    ) -> Result<(), ControlPlaneError> {
        info!(principal, policy_name, "Static control plane cannot attach policies");
        Err(ControlPlaneError::Unsupported(format!(
            "attaching policy {policy_name} requires a management API client"
        )))
    }

    async fn describe_endpoint(&self) -> Result<String, ControlPlaneError> {
        self.endpoint.clone().ok_or_else(|| {
            ControlPlaneError::EndpointLookup("no broker endpoint configured".to_string())
        })
    }
}
