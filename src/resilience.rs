//! Resilience coordinator - aggregates breaker state and load into backpressure

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::breaker::{BreakerConfig, BreakerRegistry, BreakerTransition};
use crate::config::ResilienceConfig;
use crate::context::OrchestrationContext;
use crate::error::{ConclaveError, Result};
use crate::facade::AdmissionControl;
use crate::lifecycle::{shutdown_requested, BackgroundTasks, ShutdownSignal, StopReport};
use crate::orchestrator::{Orchestrator, OrchestratorDescriptor};
use crate::protocol::{Layer, OrchestrationType};

pub const RESILIENCE_COORDINATOR: &str = "resilience_coordinator";

/// Source of the current system load, as a fraction of capacity
pub trait LoadProbe: Send + Sync {
    fn system_load_fraction(&self) -> f64;
}

/// Settable load value for embedders that measure load themselves
#[derive(Debug, Default)]
pub struct ManualLoad(AtomicU64);

impl ManualLoad {
    pub fn new(fraction: f64) -> Self {
        let load = Self::default();
        load.set(fraction);
        load
    }

    /// Stores `fraction` clamped to [0, 1]; NaN reads as zero
    pub fn set(&self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.0.store(fraction.to_bits(), Ordering::Relaxed);
    }
}

impl LoadProbe for ManualLoad {
    fn system_load_fraction(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    None,
    Elevated,
    High,
    Critical,
}

impl BackpressureLevel {
    /// Level implied by the raw conditions, ignoring recovery debounce
    pub fn classify(open_circuits: usize, load: f64) -> Self {
        if open_circuits >= 4 || load > 0.95 {
            Self::Critical
        } else if open_circuits >= 3 || load > 0.90 {
            Self::High
        } else if open_circuits >= 2 || load > 0.80 {
            Self::Elevated
        } else {
            Self::None
        }
    }

    /// How long a rejected caller should wait before retrying
    pub fn retry_after(self) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Elevated => Duration::from_secs(5),
            Self::High => Duration::from_secs(15),
            Self::Critical => Duration::from_secs(30),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Elevated => "elevated",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published result of the last recompute
#[derive(Debug, Clone, Serialize)]
pub struct BackpressureSnapshot {
    pub open_circuit_count: usize,
    pub system_load_fraction: f64,
    pub level: BackpressureLevel,
    pub computed_at: DateTime<Utc>,
}

impl BackpressureSnapshot {
    fn idle() -> Self {
        Self {
            open_circuit_count: 0,
            system_load_fraction: 0.0,
            level: BackpressureLevel::None,
            computed_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.level != BackpressureLevel::None
    }
}

#[derive(Debug, Default)]
struct Debounce {
    active: bool,
    last_condition_at: Option<Instant>,
}

/// Operations accepted through [`Orchestrator::orchestrate`]
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ResilienceRequest {
    Status,
    Admit,
    Recompute,
}

struct ResilienceInner {
    config: ResilienceConfig,
    breakers: BreakerRegistry,
    load: Arc<dyn LoadProbe>,
    snapshot: ArcSwap<BackpressureSnapshot>,
    debounce: Mutex<Debounce>,
    rejections: AtomicU64,
}

impl ResilienceInner {
    fn recompute(&self) -> Arc<BackpressureSnapshot> {
        let open = self.breakers.open_count();
        let load = self.load.system_load_fraction();
        let raw = BackpressureLevel::classify(open, load);
        let now = Instant::now();

        let mut debounce = self.debounce.lock();
        if raw != BackpressureLevel::None {
            debounce.active = true;
            debounce.last_condition_at = Some(now);
        } else if debounce.active {
            let settled = debounce
                .last_condition_at
                .map(|at| now.duration_since(at) >= self.config.recovery_delay())
                .unwrap_or(true);
            if open == 0 && settled {
                debounce.active = false;
            }
        }
        let level = match raw {
            BackpressureLevel::None if debounce.active => BackpressureLevel::Elevated,
            level => level,
        };
        drop(debounce);

        let snapshot = Arc::new(BackpressureSnapshot {
            open_circuit_count: open,
            system_load_fraction: load,
            level,
            computed_at: Utc::now(),
        });
        let previous = self.snapshot.swap(Arc::clone(&snapshot));

        if previous.level != level {
            if level > previous.level {
                warn!(from = %previous.level, to = %level, open_circuits = open, load, "Backpressure raised");
            } else {
                info!(from = %previous.level, to = %level, open_circuits = open, load, "Backpressure lowered");
            }
        }
        snapshot
    }
}

/// Infrastructure-layer orchestrator that owns the breaker registry and
/// publishes a backpressure level.
///
/// The level is recomputed on a fixed cadence and immediately after any
/// breaker transition. Once active, backpressure only lifts after every
/// breaker is closed and `recovery_delay` has passed since the overload
/// conditions last held. Readers see the last published snapshot and never
/// block on a recompute.
pub struct ResilienceCoordinator {
    descriptor: OrchestratorDescriptor,
    inner: Arc<ResilienceInner>,
    /// Taken by the first `start`; `None` afterwards, including after `stop`
    transitions: Mutex<Option<mpsc::Receiver<BreakerTransition>>>,
    tasks: tokio::sync::Mutex<Option<BackgroundTasks>>,
    running: AtomicBool,
}

impl ResilienceCoordinator {
    pub fn new(config: ResilienceConfig, load: Arc<dyn LoadProbe>) -> Self {
        let (breakers, transitions) = BreakerRegistry::new(BreakerConfig::from(&config));
        Self {
            descriptor: OrchestratorDescriptor::new(
                Layer::Infrastructure,
                RESILIENCE_COORDINATOR,
                OrchestrationType::Monitoring,
            ),
            inner: Arc::new(ResilienceInner {
                config,
                breakers,
                load,
                snapshot: ArcSwap::from_pointee(BackpressureSnapshot::idle()),
                debounce: Mutex::new(Debounce::default()),
                rejections: AtomicU64::new(0),
            }),
            transitions: Mutex::new(Some(transitions)),
            tasks: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.inner.breakers
    }

    /// Re-derive the level from current breaker state and load
    pub fn recompute(&self) -> Arc<BackpressureSnapshot> {
        self.inner.recompute()
    }

    pub fn snapshot(&self) -> Arc<BackpressureSnapshot> {
        self.inner.snapshot.load_full()
    }

    pub fn level(&self) -> BackpressureLevel {
        self.inner.snapshot.load().level
    }

    pub fn is_active(&self) -> bool {
        self.inner.snapshot.load().is_active()
    }

    pub fn record_rejection(&self) {
        self.inner.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejections(&self) -> u64 {
        self.inner.rejections.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether `start` has never been called; a stopped coordinator is not restarted
    fn never_started(&self) -> bool {
        self.transitions.lock().is_some()
    }

    /// Spawn the recompute loop. Idempotent; returns whether this call started it.
    #[instrument(skip(self), fields(orchestrator = RESILIENCE_COORDINATOR))]
    pub async fn start(&self) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(false);
        }
        let mut set = BackgroundTasks::new(RESILIENCE_COORDINATOR)?;
        let Some(transitions) = self.transitions.lock().take() else {
            return Err(ConclaveError::validation("resilience coordinator already stopped"));
        };

        let inner = Arc::clone(&self.inner);
        set.spawn("backpressure-recompute", move |signal| {
            recompute_loop(inner, transitions, signal)
        });
        *tasks = Some(set);
        self.running.store(true, Ordering::Release);
        info!("Resilience coordinator started");
        Ok(true)
    }

    #[instrument(skip(self), fields(orchestrator = RESILIENCE_COORDINATOR))]
    pub async fn stop(&self) -> StopReport {
        let Some(set) = self.tasks.lock().await.take() else {
            return StopReport::default();
        };
        self.running.store(false, Ordering::Release);
        let report = set.stop(self.inner.config.recompute_interval()).await;
        info!(abandoned = report.abandoned.len(), "Resilience coordinator stopped");
        report
    }

    fn status(&self) -> Value {
        let snapshot = self.snapshot();
        json!({
            "active": snapshot.is_active(),
            "snapshot": snapshot.as_ref(),
            "breakers": self.inner.breakers.states(),
            "rejections": self.rejections(),
        })
    }

    pub async fn handle(&self, request: ResilienceRequest) -> Result<Value> {
        match request {
            ResilienceRequest::Status => Ok(self.status()),
            ResilienceRequest::Admit => {
                self.admit()?;
                Ok(json!({ "admitted": true }))
            }
            ResilienceRequest::Recompute => Ok(serde_json::to_value(&*self.recompute())?),
        }
    }
}

impl AdmissionControl for ResilienceCoordinator {
    fn admit(&self) -> Result<()> {
        let level = self.level();
        if level == BackpressureLevel::None {
            return Ok(());
        }
        self.record_rejection();
        debug!(level = %level, "Rejected request under backpressure");
        Err(ConclaveError::Overloaded {
            level: level.to_string(),
            retry_after: level.retry_after(),
        })
    }
}

#[async_trait]
impl Orchestrator for ResilienceCoordinator {
    fn descriptor(&self) -> &OrchestratorDescriptor {
        &self.descriptor
    }

    async fn orchestrate(&self, ctx: &OrchestrationContext, args: Value) -> anyhow::Result<Value> {
        let request: ResilienceRequest =
            serde_json::from_value(args).map_err(ConclaveError::from)?;
        if !self.is_running() && self.never_started() {
            if let Err(e) = self.start().await {
                warn!(tenant_id = %ctx.tenant_id, error = %e, "Could not start recompute loop");
            }
        }
        Ok(self.handle(request).await?)
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}

async fn recompute_loop(
    inner: Arc<ResilienceInner>,
    mut transitions: mpsc::Receiver<BreakerTransition>,
    mut shutdown: ShutdownSignal,
) {
    let period = inner.config.recompute_interval();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = interval.tick() => {
                inner.recompute();
            }
            Some(transition) = transitions.recv() => {
                debug!(breaker = %transition.breaker, to = ?transition.to, "Breaker transition, recomputing");
                inner.recompute();
            }
        }
    }
    debug!("Recompute loop exited");
}
