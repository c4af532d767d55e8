//! Orchestration facade - the process-wide registry and dispatcher

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::FacadeConfig;
use crate::context::OrchestrationContext;
use crate::error::{ConclaveError, Result};
use crate::orchestrator::{Orchestrator, OrchestratorDescriptor};
use crate::protocol::Layer;
use crate::telemetry::orchestration_span;

/// Gate consulted before admitting new work
pub trait AdmissionControl: Send + Sync {
    /// `Err(ConclaveError::Overloaded)` when the request must be turned away
    fn admit(&self) -> Result<()>;
}

static GLOBAL: OnceLock<OrchestrationFacade> = OnceLock::new();

/// Registry of orchestrators keyed by name.
///
/// Reads vastly outnumber writes, so the map sits behind a read-write lock
/// that is only held long enough to clone an `Arc` out. No lock is held while
/// an orchestrator runs.
pub struct OrchestrationFacade {
    registry: RwLock<HashMap<String, Arc<dyn Orchestrator>>>,
    admission: RwLock<Option<Arc<dyn AdmissionControl>>>,
    config: FacadeConfig,
}

impl OrchestrationFacade {
    pub fn new(config: FacadeConfig) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            admission: RwLock::new(None),
            config,
        }
    }

    /// Lazily-created process-wide facade with default settings
    pub fn global() -> &'static OrchestrationFacade {
        GLOBAL.get_or_init(|| OrchestrationFacade::new(FacadeConfig::default()))
    }

    pub fn with_admission(self, gate: Arc<dyn AdmissionControl>) -> Self {
        *self.admission.write() = Some(gate);
        self
    }

    pub fn set_admission(&self, gate: Option<Arc<dyn AdmissionControl>>) {
        *self.admission.write() = gate;
    }

    /// Register an orchestrator under its descriptor name
    pub fn register(&self, orchestrator: Arc<dyn Orchestrator>) -> Result<()> {
        let descriptor = orchestrator.descriptor().clone();
        let mut registry = self.registry.write();
        if registry.contains_key(&descriptor.name) {
            return Err(ConclaveError::Duplicate(descriptor.name));
        }
        registry.insert(descriptor.name.clone(), orchestrator);
        drop(registry);

        info!(
            orchestrator = %descriptor.name,
            layer = ?descriptor.layer,
            kind = ?descriptor.orchestration_type,
            "Registered orchestrator"
        );
        Ok(())
    }

    /// Remove an orchestrator and run its shutdown hook
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let orchestrator = self
            .registry
            .write()
            .remove(name)
            .ok_or_else(|| ConclaveError::NotFound(format!("orchestrator '{name}'")))?;

        self.run_shutdown(name, orchestrator).await;
        info!(orchestrator = %name, "Unregistered orchestrator");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Orchestrator>> {
        self.registry.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<OrchestratorDescriptor> {
        self.registry
            .read()
            .values()
            .map(|o| o.descriptor().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Resolve `name` and run it.
    ///
    /// Root-level calls into domain orchestrators pass through admission
    /// control first. Once the orchestrator has been invoked its cleanup hook
    /// runs exactly once, whether it returned, failed or panicked. The facade
    /// never retries.
    pub async fn orchestrate(
        &self,
        name: &str,
        ctx: &OrchestrationContext,
        args: Value,
    ) -> Result<Value> {
        let orchestrator = self
            .get(name)
            .ok_or_else(|| ConclaveError::NotFound(format!("orchestrator '{name}'")))?;
        let descriptor = orchestrator.descriptor().clone();

        ctx.check_depth(self.config.max_depth)?;
        if ctx.is_root() && descriptor.layer == Layer::Domain {
            self.check_admission(name)?;
        }

        let span = orchestration_span(&descriptor, ctx);
        async move {
            let started = Instant::now();
            info!("orchestration started");

            let outcome = AssertUnwindSafe(orchestrator.orchestrate(ctx, args))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(classify(name, err)),
                Err(panic) => Err(ConclaveError::execution(
                    name,
                    format!("panicked: {}", panic_message(panic.as_ref())),
                )),
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => info!(success = true, elapsed_ms, "orchestration finished"),
                Err(e) => warn!(
                    success = false,
                    elapsed_ms,
                    category = ?e.category(),
                    error = %e,
                    "orchestration finished"
                ),
            }

            self.run_cleanup(name, &orchestrator).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Unregister everything, running each shutdown hook with a bounded wait
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, Arc<dyn Orchestrator>)> =
            self.registry.write().drain().collect();

        info!(count = drained.len(), "Shutting down all orchestrators");
        for (name, orchestrator) in drained {
            self.run_shutdown(&name, orchestrator).await;
        }
    }

    fn check_admission(&self, name: &str) -> Result<()> {
        let gate = self.admission.read().clone();
        match gate {
            Some(gate) => gate.admit().inspect_err(|e| {
                debug!(orchestrator = %name, error = %e, "Admission rejected");
            }),
            None => Ok(()),
        }
    }

    async fn run_cleanup(&self, name: &str, orchestrator: &Arc<dyn Orchestrator>) {
        let cleanup = AssertUnwindSafe(orchestrator.cleanup()).catch_unwind();
        match tokio::time::timeout(self.config.cleanup_timeout(), cleanup).await {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => error!(
                orchestrator = %name,
                panic = %panic_message(panic.as_ref()),
                "Cleanup panicked"
            ),
            Err(_) => warn!(
                orchestrator = %name,
                timeout_ms = self.config.cleanup_timeout_ms,
                "Cleanup timed out, abandoning"
            ),
        }
    }

    async fn run_shutdown(&self, name: &str, orchestrator: Arc<dyn Orchestrator>) {
        let shutdown = AssertUnwindSafe(orchestrator.shutdown()).catch_unwind();
        match tokio::time::timeout(self.config.cleanup_timeout(), shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => error!(
                orchestrator = %name,
                panic = %panic_message(panic.as_ref()),
                "Shutdown panicked"
            ),
            Err(_) => warn!(
                orchestrator = %name,
                timeout_ms = self.config.cleanup_timeout_ms,
                "Shutdown timed out, abandoning"
            ),
        }
    }
}

impl Default for OrchestrationFacade {
    fn default() -> Self {
        Self::new(FacadeConfig::default())
    }
}

/// Keep categorized errors intact, wrap everything else as an execution failure
fn classify(name: &str, err: anyhow::Error) -> ConclaveError {
    match err.downcast::<ConclaveError>() {
        Ok(categorized) => categorized,
        Err(other) => ConclaveError::execution(name, format!("{other:#}")),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
