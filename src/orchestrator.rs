//! Orchestrator protocol - the contract every dispatchable unit implements

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::OrchestrationContext;
use crate::protocol::{Layer, OrchestrationType};

/// Static identity of an orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorDescriptor {
    pub layer: Layer,
    pub name: String,
    pub orchestration_type: OrchestrationType,
}

impl OrchestratorDescriptor {
    pub fn new(
        layer: Layer,
        name: impl Into<String>,
        orchestration_type: OrchestrationType,
    ) -> Self {
        Self {
            layer,
            name: name.into(),
            orchestration_type,
        }
    }
}

/// A named, layered unit of work that the facade can dispatch to.
///
/// Domain orchestrators, the feedback and resilience coordinators and
/// execution-engine adapters all implement this trait. The facade never looks
/// past it.
///
/// Errors are `anyhow` so adapters can bubble up whatever they hit. Returning a
/// [`crate::ConclaveError`] keeps its category intact through the facade;
/// anything else is reported as an execution failure.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn descriptor(&self) -> &OrchestratorDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Run one invocation
    async fn orchestrate(&self, ctx: &OrchestrationContext, args: Value) -> anyhow::Result<Value>;

    /// Release per-invocation resources. Runs after every dispatch, success or not.
    async fn cleanup(&self) {}

    /// Tear down long-lived resources. Runs once when unregistered.
    async fn shutdown(&self) {}
}
