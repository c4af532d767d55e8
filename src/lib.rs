//! # Conclave
//!
//! Hierarchical orchestration with adaptive, feedback-driven routing.
//!
//! A single facade dispatches requests to named orchestrators arranged in
//! three layers. Outcomes of the work they route flow back as feedback
//! signals, which tune a contextual bandit per routing dimension and a health
//! score per component. A resilience coordinator watches circuit breakers and
//! load and pushes back on new work when the system is overloaded.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────────────────────────┐
//!   request ──────────► │   OrchestrationFacade    │ ◄── AdmissionControl
//!                       │ registry · span · cleanup│          ▲
//!                       └────────────┬─────────────┘          │
//!            ┌───────────────────────┼──────────────────┐     │
//!            ▼                       ▼                  ▼     │
//!     ┌─────────────┐     ┌────────────────────┐  ┌───────────┴────────┐
//!     │   Domain    │     │ FeedbackCoordinator│  │ResilienceCoordinator│
//!     │orchestrators│     │   (Application)    │  │  (Infrastructure)   │
//!     └──────┬──────┘     └─────────┬──────────┘  └─────────┬──────────┘
//!            │ select_arm           │ drain                 │ breakers · load
//!            ▼                      ▼                       ▼
//!     ┌─────────────┐  update  ┌─────────────┐        BackpressureSnapshot
//!     │RoutingEngine│ ◄─────── │ per-type    │
//!     │  (LinUCB)   │          │ FIFO queues │
//!     └──────┬──────┘          └─────┬───────┘
//!            │ is_eligible           │ record_outcome
//!            ▼                       ▼
//!     ┌──────────────────────────────────────┐
//!     │            HealthMonitor             │
//!     └──────────────────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Orchestrator**: a named, layered unit of work behind the facade
//! - **Feedback signal**: one observed reward for one component in one context
//! - **Arm**: one candidate backend within a routing dimension
//! - **Backpressure**: an ordinal overload level derived from open breakers and load

pub mod breaker;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod facade;
pub mod feedback;
pub mod health;
pub mod lifecycle;
pub mod orchestrator;
pub mod policy;
pub mod protocol;
pub mod queue;
pub mod resilience;
pub mod routing;
pub mod telemetry;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerTransition, CircuitBreaker, CircuitState};
pub use config::{
    ConclaveConfig, FacadeConfig, FeedbackConfig, HealthConfig, ResilienceConfig, RoutingConfig,
};
pub use context::OrchestrationContext;
pub use coordinator::{
    CoordinatorState, DrainReport, FeedbackCoordinator, FeedbackMetrics, FeedbackRequest,
};
pub use error::{ConclaveError, ErrorCategory, Result};
pub use facade::{AdmissionControl, OrchestrationFacade};
pub use feedback::{FeedbackSignal, StageOutcome, TrajectoryError, TrajectoryRecord};
pub use health::{ComponentHealth, HealthMonitor, HealthReport, HealthTransition};
pub use orchestrator::{Orchestrator, OrchestratorDescriptor};
pub use policy::{ArmScore, LinUcbPolicy, RoutingPolicy};
pub use protocol::{
    ComponentKey, ComponentType, FeedbackSource, Layer, OrchestrationType, RequestId,
    RoutingDimension,
};
pub use resilience::{
    BackpressureLevel, BackpressureSnapshot, LoadProbe, ManualLoad, ResilienceCoordinator,
    ResilienceRequest,
};
pub use routing::{RoutingDecision, RoutingEngine, RoutingEngineBuilder};
pub use telemetry::{init_tracing, LogFormat};
