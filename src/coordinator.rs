//! Feedback coordinator - turns outcome signals into routing and health updates

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{FeedbackConfig, RoutingConfig};
use crate::context::OrchestrationContext;
use crate::error::{ConclaveError, Result};
use crate::feedback::{FeedbackSignal, TrajectoryRecord};
use crate::health::HealthMonitor;
use crate::lifecycle::{shutdown_requested, BackgroundTasks, ShutdownSignal, StopReport};
use crate::orchestrator::{Orchestrator, OrchestratorDescriptor};
use crate::protocol::{ComponentType, FeedbackSource, Layer, OrchestrationType, RoutingDimension};
use crate::queue::{FeedbackQueues, SequencedSignal};
use crate::routing::RoutingEngine;

pub const FEEDBACK_COORDINATOR: &str = "feedback_coordinator";

/// Lifecycle of the coordinator's background loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Uninitialized,
    Running,
    Draining,
    Stopped,
}

/// Operations accepted through [`Orchestrator::orchestrate`], decoded once from the args
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FeedbackRequest {
    Submit { signal: FeedbackSignal },
    SubmitTrajectory { record: TrajectoryRecord },
    GetMetrics,
    GetHealth,
    Start,
    Stop,
}

/// What happened to one signal during a drain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedSignal {
    pub seq: u64,
    pub component_type: ComponentType,
    pub component_id: String,
    pub routed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    /// Processed signals, grouped by queue, in drain order
    pub processed: Vec<ProcessedSignal>,
    pub malformed: usize,
    pub degraded: usize,
}

/// Point-in-time counters
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackMetrics {
    pub state: CoordinatorState,
    pub submitted: u64,
    pub processed: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub degraded: u64,
    pub drains: u64,
    pub consolidations: u64,
    pub consolidation_failures: u64,
    pub health_evaluations: u64,
    pub health_failures: u64,
    pub queued: usize,
    pub by_source: BTreeMap<FeedbackSource, u64>,
    pub by_type: BTreeMap<ComponentType, u64>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    malformed: AtomicU64,
    degraded: AtomicU64,
    drains: AtomicU64,
    consolidations: AtomicU64,
    consolidation_failures: AtomicU64,
    health_evaluations: AtomicU64,
    health_failures: AtomicU64,
    by_source: Mutex<BTreeMap<FeedbackSource, u64>>,
    by_type: Mutex<BTreeMap<ComponentType, u64>>,
}

/// State shared with the background loops
struct CoordinatorInner {
    config: FeedbackConfig,
    stale_after: Duration,
    usage_decay: f64,
    routing: Arc<RoutingEngine>,
    health: Arc<HealthMonitor>,
    queues: FeedbackQueues,
    counters: Counters,
    state: Mutex<CoordinatorState>,
    /// Dimensions already reported as degraded, so the warning is logged once
    degraded_warned: Mutex<HashSet<RoutingDimension>>,
}

/// Application-layer orchestrator that closes the feedback loop.
///
/// Signals are queued per component type without ever blocking the caller.
/// A drain loop pops bounded batches and applies each signal to the routing
/// engine and the health monitor; a consolidation loop prunes stale routing
/// state; a health loop re-evaluates disable decisions. Loops start on the
/// first `orchestrate` call or an explicit [`FeedbackCoordinator::start`].
pub struct FeedbackCoordinator {
    descriptor: OrchestratorDescriptor,
    inner: Arc<CoordinatorInner>,
    tasks: tokio::sync::Mutex<Option<BackgroundTasks>>,
}

impl FeedbackCoordinator {
    /// Pure construction; nothing is spawned until [`Self::start`]
    pub fn new(
        config: FeedbackConfig,
        routing_config: &RoutingConfig,
        routing: Arc<RoutingEngine>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            descriptor: OrchestratorDescriptor::new(
                Layer::Application,
                FEEDBACK_COORDINATOR,
                OrchestrationType::Coordination,
            ),
            inner: Arc::new(CoordinatorInner {
                queues: FeedbackQueues::new(config.queue_capacity),
                config,
                stale_after: routing_config.stale_after(),
                usage_decay: routing_config.usage_decay,
                routing,
                health,
                counters: Counters::default(),
                state: Mutex::new(CoordinatorState::Uninitialized),
                degraded_warned: Mutex::new(HashSet::new()),
            }),
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.lock()
    }

    /// Enqueue a signal. Never blocks; a full queue loses its oldest entry.
    ///
    /// Refused once the coordinator has stopped, since nothing would drain it.
    pub fn submit_feedback(&self, signal: FeedbackSignal) -> Result<u64> {
        signal.validate()?;
        let component_type = signal.component_type;

        // Held across the enqueue so `stop` cannot slip between check and push.
        let state = self.inner.state.lock();
        if *state == CoordinatorState::Stopped {
            return Err(ConclaveError::DegradedDependency {
                dependency: FEEDBACK_COORDINATOR.into(),
                reason: "coordinator stopped, feedback is no longer drained".into(),
            });
        }
        let (seq, evicted) = self.inner.queues.enqueue(signal);
        drop(state);

        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if evicted {
            debug!(component_type = %component_type, "Feedback queue full, dropped oldest signal");
        }
        Ok(seq)
    }

    /// Derive signals from a task outcome and enqueue them all
    pub fn submit_trajectory(&self, record: &TrajectoryRecord) -> Result<Vec<u64>> {
        let signals = record.derive_signals(&self.inner.config)?;
        for signal in &signals {
            signal.validate()?;
        }
        debug!(task_id = %record.task_id, signals = signals.len(), latency_ms = ?record.latency_ms, "Trajectory feedback");
        signals
            .into_iter()
            .map(|s| self.submit_feedback(s))
            .collect()
    }

    /// Run one drain pass immediately
    pub fn drain_once(&self) -> DrainReport {
        self.inner.drain()
    }

    pub fn metrics(&self) -> FeedbackMetrics {
        self.inner.metrics()
    }

    /// Spawn the background loops. Idempotent; returns whether this call started them.
    #[instrument(skip(self), fields(orchestrator = FEEDBACK_COORDINATOR))]
    pub async fn start(&self) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        match self.state() {
            CoordinatorState::Uninitialized => {}
            CoordinatorState::Running | CoordinatorState::Draining => return Ok(false),
            CoordinatorState::Stopped => {
                return Err(ConclaveError::validation("feedback coordinator already stopped"))
            }
        }

        let mut set = BackgroundTasks::new(FEEDBACK_COORDINATOR)?;

        let inner = Arc::clone(&self.inner);
        set.spawn("feedback-drain", move |signal| drain_loop(inner, signal));
        let inner = Arc::clone(&self.inner);
        set.spawn("consolidation", move |signal| consolidation_loop(inner, signal));
        let inner = Arc::clone(&self.inner);
        set.spawn("health-check", move |signal| health_loop(inner, signal));

        *tasks = Some(set);
        *self.inner.state.lock() = CoordinatorState::Running;
        info!("Feedback coordinator started");
        Ok(true)
    }

    /// Stop the loops with a bounded wait, then drain everything still queued
    #[instrument(skip(self), fields(orchestrator = FEEDBACK_COORDINATOR))]
    pub async fn stop(&self) -> StopReport {
        let mut tasks = self.tasks.lock().await;
        let report = match tasks.take() {
            Some(set) => {
                *self.inner.state.lock() = CoordinatorState::Draining;
                let report = set.stop(self.inner.config.shutdown_grace()).await;
                if !report.abandoned.is_empty() {
                    warn!(abandoned = ?report.abandoned, "Forced abandonment of feedback loops");
                }
                report
            }
            None if self.state() == CoordinatorState::Stopped => return StopReport::default(),
            None => StopReport::default(),
        };

        *self.inner.state.lock() = CoordinatorState::Stopped;
        let mut final_drain = 0;
        while self.inner.queues.total_depth() > 0 {
            let pass = self.inner.drain();
            final_drain += pass.processed.len() + pass.malformed;
        }
        info!(final_drain, "Feedback coordinator stopped");
        report
    }

    /// Execute one decoded request
    pub async fn handle(&self, request: FeedbackRequest) -> Result<Value> {
        match request {
            FeedbackRequest::Submit { signal } => {
                let seq = self.submit_feedback(signal)?;
                Ok(json!({ "accepted": true, "seq": seq }))
            }
            FeedbackRequest::SubmitTrajectory { record } => {
                let seqs = self.submit_trajectory(&record)?;
                Ok(json!({ "accepted": true, "task_id": record.task_id, "seqs": seqs }))
            }
            FeedbackRequest::GetMetrics => Ok(serde_json::to_value(self.metrics())?),
            FeedbackRequest::GetHealth => Ok(serde_json::to_value(self.inner.health.report())?),
            FeedbackRequest::Start => {
                let started = self.start().await?;
                Ok(json!({ "started": started, "state": self.state() }))
            }
            FeedbackRequest::Stop => {
                let report = self.stop().await;
                Ok(json!({
                    "state": self.state(),
                    "exited": report.exited,
                    "abandoned": report.abandoned,
                }))
            }
        }
    }
}

#[async_trait]
impl Orchestrator for FeedbackCoordinator {
    fn descriptor(&self) -> &OrchestratorDescriptor {
        &self.descriptor
    }

    async fn orchestrate(&self, ctx: &OrchestrationContext, args: Value) -> anyhow::Result<Value> {
        let request: FeedbackRequest =
            serde_json::from_value(args).map_err(ConclaveError::from)?;

        let lazily_start = self.state() == CoordinatorState::Uninitialized
            && !matches!(request, FeedbackRequest::Stop);
        if lazily_start {
            if let Err(e) = self.start().await {
                warn!(tenant_id = %ctx.tenant_id, error = %e, "Could not start feedback loops");
            }
        }

        Ok(self.handle(request).await?)
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}

impl CoordinatorInner {
    fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        for component_type in ComponentType::ALL {
            let batch = self
                .queues
                .pop_batch(component_type, self.config.batch_size);
            for entry in batch {
                let seq = entry.seq;
                let component_id = entry.signal.component_id.clone();
                let applied =
                    std::panic::catch_unwind(AssertUnwindSafe(|| self.apply(entry, &mut report)));
                if applied.is_err() {
                    report.malformed += 1;
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        seq,
                        component_type = %component_type,
                        component_id = %component_id,
                        "Feedback handler panicked, signal skipped"
                    );
                }
            }
        }

        self.counters.drains.fetch_add(1, Ordering::Relaxed);
        if !report.processed.is_empty() || report.malformed > 0 {
            debug!(
                processed = report.processed.len(),
                malformed = report.malformed,
                degraded = report.degraded,
                "Drained feedback"
            );
        }
        report
    }

    /// Apply one signal to routing and health. Malformed signals are skipped.
    fn apply(&self, entry: SequencedSignal, report: &mut DrainReport) {
        let SequencedSignal { seq, signal } = entry;
        let mut routed = false;

        if let Some(dimension) = signal.component_type.routing_dimension() {
            match self.routing.update_arm(
                dimension,
                &signal.component_id,
                &signal.context_features,
                signal.reward,
            ) {
                Ok(()) => routed = true,
                Err(ConclaveError::DegradedDependency { reason, .. }) => {
                    report.degraded += 1;
                    self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                    if self.degraded_warned.lock().insert(dimension) {
                        warn!(dimension = %dimension, reason = %reason, "Routing feedback disabled for dimension");
                    }
                }
                Err(e) => {
                    self.skip_malformed(seq, &signal, &e, report);
                    return;
                }
            }
        }

        let quality = signal.reward.clamp(0.0, 1.0);
        let success = signal.reward >= self.config.success_threshold;
        if let Err(e) =
            self.health
                .record_outcome(signal.component_type, &signal.component_id, success, quality)
        {
            self.skip_malformed(seq, &signal, &e, report);
            return;
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        *self.counters.by_source.lock().entry(signal.source).or_insert(0) += 1;
        *self
            .counters
            .by_type
            .lock()
            .entry(signal.component_type)
            .or_insert(0) += 1;

        report.processed.push(ProcessedSignal {
            seq,
            component_type: signal.component_type,
            component_id: signal.component_id,
            routed,
        });
    }

    fn skip_malformed(
        &self,
        seq: u64,
        signal: &FeedbackSignal,
        err: &ConclaveError,
        report: &mut DrainReport,
    ) {
        report.malformed += 1;
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(
            seq,
            source = signal.source.as_str(),
            component_type = %signal.component_type,
            component_id = %signal.component_id,
            error = %err,
            "Skipping malformed feedback signal"
        );
    }

    fn consolidate(&self) {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.routing.consolidate(self.stale_after, self.usage_decay)
        }));
        match outcome {
            Ok(report) => {
                self.counters.consolidations.fetch_add(1, Ordering::Relaxed);
                debug!(
                    pruned = report.pruned_arms,
                    skipped = ?report.skipped_dimensions,
                    "Consolidation pass complete"
                );
            }
            Err(_) => {
                self.counters
                    .consolidation_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!("Consolidation pass failed");
            }
        }
    }

    fn evaluate_health(&self) {
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.health.evaluate_disable_state()));
        match outcome {
            Ok(transitions) => {
                self.counters
                    .health_evaluations
                    .fetch_add(1, Ordering::Relaxed);
                if !transitions.is_empty() {
                    info!(transitions = transitions.len(), "Health state changed");
                }
            }
            Err(_) => {
                self.counters.health_failures.fetch_add(1, Ordering::Relaxed);
                error!("Health evaluation failed");
            }
        }
    }

    fn metrics(&self) -> FeedbackMetrics {
        let c = &self.counters;
        FeedbackMetrics {
            state: *self.state.lock(),
            submitted: c.submitted.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            dropped: self.queues.dropped(),
            malformed: c.malformed.load(Ordering::Relaxed),
            degraded: c.degraded.load(Ordering::Relaxed),
            drains: c.drains.load(Ordering::Relaxed),
            consolidations: c.consolidations.load(Ordering::Relaxed),
            consolidation_failures: c.consolidation_failures.load(Ordering::Relaxed),
            health_evaluations: c.health_evaluations.load(Ordering::Relaxed),
            health_failures: c.health_failures.load(Ordering::Relaxed),
            queued: self.queues.total_depth(),
            by_source: c.by_source.lock().clone(),
            by_type: c.by_type.lock().clone(),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn drain_loop(inner: Arc<CoordinatorInner>, mut shutdown: ShutdownSignal) {
    let mut interval = ticker(inner.config.drain_interval());
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = interval.tick() => {
                inner.drain();
            }
        }
    }
    debug!("Drain loop exited");
}

async fn consolidation_loop(inner: Arc<CoordinatorInner>, mut shutdown: ShutdownSignal) {
    let mut interval = ticker(inner.config.consolidation_interval());
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = interval.tick() => inner.consolidate(),
        }
    }
    debug!("Consolidation loop exited");
}

async fn health_loop(inner: Arc<CoordinatorInner>, mut shutdown: ShutdownSignal) {
    let mut interval = ticker(inner.health.config().evaluation_interval());
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = interval.tick() => inner.evaluate_health(),
        }
    }
    debug!("Health loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::policy::{ArmScore, PolicyStats, RewardRange, RoutingPolicy};

    fn routing_config() -> RoutingConfig {
        RoutingConfig {
            feature_dim: 2,
            ..Default::default()
        }
    }

    fn coordinator_with(config: FeedbackConfig, routing: Option<RoutingEngine>) -> FeedbackCoordinator {
        let health = Arc::new(HealthMonitor::new(HealthConfig {
            min_samples: 3,
            evaluation_interval_ms: 50,
            ..Default::default()
        }));
        let routing = routing.unwrap_or_else(|| RoutingEngine::new(&routing_config(), health.clone()));
        FeedbackCoordinator::new(config, &routing_config(), Arc::new(routing), health)
    }

    fn coordinator() -> FeedbackCoordinator {
        coordinator_with(FeedbackConfig::default(), None)
    }

    fn signal(component_type: ComponentType, id: &str, reward: f64) -> FeedbackSignal {
        FeedbackSignal::new(FeedbackSource::Agent, component_type, id, vec![1.0, 0.0], reward)
    }

    /// Tool policy whose mutating calls panic
    struct BrittlePolicy;

    impl RoutingPolicy for BrittlePolicy {
        fn dimension(&self) -> RoutingDimension {
            RoutingDimension::Tool
        }

        fn reward_range(&self) -> RewardRange {
            RewardRange::Unit
        }

        fn score_arms(&self, _features: &[f64], _arms: &[&str]) -> Result<Vec<ArmScore>> {
            Ok(Vec::new())
        }

        fn update(&self, arm: &str, _features: &[f64], _reward: f64) -> Result<()> {
            panic!("update blew up for {arm}");
        }

        fn prune_stale(&self, _max_age: Duration) -> usize {
            panic!("prune blew up");
        }

        fn stats(&self) -> PolicyStats {
            PolicyStats {
                dimension: RoutingDimension::Tool,
                alpha: 0.0,
                updates: 0,
                arms: Vec::new(),
            }
        }
    }

    fn brittle_coordinator(config: FeedbackConfig) -> FeedbackCoordinator {
        let routing = RoutingEngine::builder(Arc::new(HealthMonitor::default()))
            .policy(Arc::new(BrittlePolicy))
            .linucb_defaults(&routing_config())
            .build();
        coordinator_with(config, Some(routing))
    }

    #[test]
    fn test_construction_has_no_side_effects() {
        let c = coordinator();
        assert_eq!(c.state(), CoordinatorState::Uninitialized);
        assert_eq!(c.metrics().drains, 0);
    }

    #[test]
    fn test_submit_rejects_invalid_signal() {
        let c = coordinator();
        let err = c
            .submit_feedback(signal(ComponentType::Model, "m", 3.0))
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Validation(_)));
        assert_eq!(c.metrics().submitted, 0);
    }

    #[test]
    fn test_round_trip_updates_routing_and_health_once() {
        let c = coordinator();
        c.submit_feedback(signal(ComponentType::Model, "gpt", 0.8)).unwrap();

        let report = c.drain_once();
        assert_eq!(report.processed.len(), 1);
        assert!(report.processed[0].routed);

        let health = c.inner.health.get(ComponentType::Model, "gpt").unwrap();
        assert_eq!(health.total_count, 1);
        assert_eq!(health.running_quality_average, 0.8);

        let stats = c.inner.routing.policy(RoutingDimension::Model).unwrap().stats();
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.arms[0].arm, "gpt");
        assert_eq!(stats.arms[0].observations, 1);

        assert!(c.drain_once().processed.is_empty());
    }

    #[test]
    fn test_prompt_signals_only_touch_health() {
        let c = coordinator();
        c.submit_feedback(signal(ComponentType::Prompt, "p1", 0.4)).unwrap();
        let report = c.drain_once();
        assert!(!report.processed[0].routed);
        assert!(c.inner.health.get(ComponentType::Prompt, "p1").is_some());
    }

    #[test]
    fn test_malformed_signal_is_skipped() {
        let c = coordinator();
        let mut bad = signal(ComponentType::Tool, "t", 0.5);
        bad.context_features = vec![1.0, 2.0, 3.0];
        c.submit_feedback(bad).unwrap();
        c.submit_feedback(signal(ComponentType::Tool, "t", 0.5)).unwrap();

        let report = c.drain_once();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.processed.len(), 1);
        assert_eq!(c.metrics().malformed, 1);
        assert_eq!(c.inner.health.get(ComponentType::Tool, "t").unwrap().total_count, 1);
    }

    #[test]
    fn test_degraded_dimension_still_records_health() {
        let health = Arc::new(HealthMonitor::default());
        let routing = RoutingEngine::builder(health.clone())
            .load(RoutingDimension::Engine, || anyhow::bail!("no engine registry"))
            .linucb_defaults(&routing_config())
            .build();
        let c = FeedbackCoordinator::new(
            FeedbackConfig::default(),
            &routing_config(),
            Arc::new(routing),
            health,
        );

        c.submit_feedback(signal(ComponentType::Engine, "temporal", 0.9)).unwrap();
        c.submit_feedback(signal(ComponentType::Model, "gpt", 0.9)).unwrap();
        let report = c.drain_once();

        assert_eq!(report.degraded, 1);
        assert_eq!(report.processed.len(), 2);
        assert_eq!(c.metrics().degraded, 1);
        assert!(c.inner.health.get(ComponentType::Engine, "temporal").is_some());
    }

    #[test]
    fn test_batch_size_bounds_a_drain() {
        let c = coordinator_with(
            FeedbackConfig {
                batch_size: 2,
                ..Default::default()
            },
            None,
        );
        for i in 0..5 {
            c.submit_feedback(signal(ComponentType::Tool, &format!("t{i}"), 0.5)).unwrap();
        }
        assert_eq!(c.drain_once().processed.len(), 2);
        assert_eq!(c.metrics().queued, 3);
    }

    #[test]
    fn test_overflow_counts_drops() {
        let c = coordinator_with(
            FeedbackConfig {
                queue_capacity: 3,
                ..Default::default()
            },
            None,
        );
        for _ in 0..5 {
            c.submit_feedback(signal(ComponentType::Agent, "a", 0.5)).unwrap();
        }
        let metrics = c.metrics();
        assert_eq!(metrics.submitted, 5);
        assert_eq!(metrics.dropped, 2);
        assert_eq!(metrics.queued, 3);
    }

    #[test]
    fn test_metrics_by_source_and_type() {
        let c = coordinator();
        c.submit_feedback(signal(ComponentType::Tool, "t", 0.5)).unwrap();
        c.submit_feedback(FeedbackSignal::new(
            FeedbackSource::Cost,
            ComponentType::Model,
            "m",
            vec![1.0, 0.0],
            0.2,
        ))
        .unwrap();
        c.drain_once();

        let metrics = c.metrics();
        assert_eq!(metrics.processed, 2);
        assert_eq!(metrics.by_source.get(&FeedbackSource::Agent), Some(&1));
        assert_eq!(metrics.by_source.get(&FeedbackSource::Cost), Some(&1));
        assert_eq!(metrics.by_type.get(&ComponentType::Tool), Some(&1));
    }

    #[test]
    fn test_panicking_update_is_counted_as_malformed() {
        let c = brittle_coordinator(FeedbackConfig::default());
        c.submit_feedback(signal(ComponentType::Tool, "search", 0.7)).unwrap();
        c.submit_feedback(signal(ComponentType::Model, "gpt", 0.7)).unwrap();

        let report = c.drain_once();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.processed.len(), 1);
        assert_eq!(report.processed[0].component_id, "gpt");
        assert_eq!(c.metrics().malformed, 1);
        assert_eq!(c.metrics().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_loop_survives_panicking_policy() {
        let c = brittle_coordinator(FeedbackConfig {
            drain_interval_ms: 100,
            ..Default::default()
        });
        c.start().await.unwrap();

        c.submit_feedback(signal(ComponentType::Tool, "search", 0.7)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(c.metrics().malformed, 1);

        c.submit_feedback(signal(ComponentType::Model, "gpt", 0.7)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let metrics = c.metrics();
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.queued, 0);
        assert_eq!(metrics.state, CoordinatorState::Running);
        c.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_consolidation_failure_does_not_stall_drains() {
        let c = brittle_coordinator(FeedbackConfig {
            drain_interval_ms: 100,
            consolidation_interval_ms: 100,
            ..Default::default()
        });
        c.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let metrics = c.metrics();
        assert!(metrics.consolidation_failures >= 2);
        assert_eq!(metrics.consolidations, 0);

        c.submit_feedback(signal(ComponentType::Model, "gpt", 0.9)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let metrics = c.metrics();
        assert_eq!(metrics.processed, 1);
        assert!(metrics.consolidation_failures >= 3);
        assert_eq!(metrics.state, CoordinatorState::Running);
        c.stop().await;
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let c = coordinator_with(
            FeedbackConfig {
                batch_size: 2,
                ..Default::default()
            },
            None,
        );
        for i in 0..5 {
            c.submit_feedback(signal(ComponentType::Tool, &format!("t{i}"), 0.5)).unwrap();
        }
        c.stop().await;
        assert_eq!(c.state(), CoordinatorState::Stopped);
        assert_eq!(c.metrics().processed, 5);
        assert_eq!(c.metrics().queued, 0);

        let err = c
            .submit_feedback(signal(ComponentType::Model, "gpt", 0.9))
            .unwrap_err();
        assert!(matches!(err, ConclaveError::DegradedDependency { .. }));
        let metrics = c.metrics();
        assert_eq!(metrics.submitted, 5);
        assert_eq!(metrics.queued, 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_terminal() {
        let c = coordinator();
        assert!(c.start().await.unwrap());
        assert!(!c.start().await.unwrap());
        assert_eq!(c.state(), CoordinatorState::Running);

        let report = c.stop().await;
        assert_eq!(report.exited.len(), 3);
        assert!(report.abandoned.is_empty());
        assert_eq!(c.state(), CoordinatorState::Stopped);
        assert!(c.start().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_drains_leftovers() {
        let c = coordinator();
        c.start().await.unwrap();
        c.submit_feedback(signal(ComponentType::Model, "gpt", 0.9)).unwrap();
        c.stop().await;
        assert_eq!(c.metrics().queued, 0);
        assert_eq!(c.metrics().processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_loop_runs_on_cadence() {
        let c = coordinator_with(
            FeedbackConfig {
                drain_interval_ms: 100,
                ..Default::default()
            },
            None,
        );
        c.start().await.unwrap();
        c.submit_feedback(signal(ComponentType::Model, "gpt", 0.9)).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let metrics = c.metrics();
        assert_eq!(metrics.processed, 1);
        assert!(metrics.drains >= 2);
        assert!(metrics.health_evaluations >= 1);
        c.stop().await;
    }

    #[tokio::test]
    async fn test_orchestrate_starts_lazily_and_dispatches() {
        let c = coordinator();
        let ctx = OrchestrationContext::new("acme");

        let value = c
            .orchestrate(
                &ctx,
                json!({
                    "operation": "submit",
                    "signal": {
                        "source": "tool",
                        "component_type": "tool",
                        "component_id": "search",
                        "context_features": [1.0, 0.0],
                        "reward": 1.0
                    }
                }),
            )
            .await
            .unwrap();
        assert_eq!(value["accepted"], true);
        assert_eq!(c.state(), CoordinatorState::Running);

        let metrics = c
            .orchestrate(&ctx, json!({ "operation": "get_metrics" }))
            .await
            .unwrap();
        assert_eq!(metrics["submitted"], 1);

        let err = c
            .orchestrate(&ctx, json!({ "operation": "explode" }))
            .await
            .unwrap_err();
        let err = err.downcast::<ConclaveError>().unwrap();
        assert!(matches!(err, ConclaveError::Validation(_)));

        c.orchestrate(&ctx, json!({ "operation": "stop" })).await.unwrap();
        assert_eq!(c.state(), CoordinatorState::Stopped);
    }
}
