//! Adaptive routing engine - one learned policy per routing dimension

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::error::{ConclaveError, Result};
use crate::health::HealthMonitor;
use crate::policy::{LinUcbPolicy, PolicyStats, RoutingPolicy};
use crate::protocol::RoutingDimension;

const TIE_EPSILON: f64 = 1e-12;

/// A routing dimension's policy, or the reason it could not be loaded
#[derive(Clone)]
pub enum DimensionSlot {
    Available(Arc<dyn RoutingPolicy>),
    Unavailable { reason: String },
}

impl DimensionSlot {
    pub fn is_available(&self) -> bool {
        matches!(self, DimensionSlot::Available(_))
    }
}

/// Outcome of [`RoutingEngine::select_arm`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub dimension: RoutingDimension,
    pub arm: String,
    /// In (0, 1]; grows as the chosen arm accumulates evidence
    pub confidence: f64,
    pub score: f64,
    /// Set when every candidate was ineligible or the policy is unavailable
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    pub pruned_arms: usize,
    pub skipped_dimensions: Vec<RoutingDimension>,
}

/// Builds a [`RoutingEngine`], loading each dimension's policy once.
///
/// A loader that fails leaves its dimension unavailable; the others are
/// unaffected.
pub struct RoutingEngineBuilder {
    health: Arc<HealthMonitor>,
    slots: HashMap<RoutingDimension, DimensionSlot>,
}

impl RoutingEngineBuilder {
    pub fn new(health: Arc<HealthMonitor>) -> Self {
        Self {
            health,
            slots: HashMap::new(),
        }
    }

    /// Use LinUCB for every dimension not configured otherwise
    pub fn linucb_defaults(mut self, config: &RoutingConfig) -> Self {
        for dim in RoutingDimension::ALL {
            self.slots.entry(dim).or_insert_with(|| {
                DimensionSlot::Available(Arc::new(LinUcbPolicy::new(dim, config)))
            });
        }
        self
    }

    pub fn policy(mut self, policy: Arc<dyn RoutingPolicy>) -> Self {
        self.slots
            .insert(policy.dimension(), DimensionSlot::Available(policy));
        self
    }

    /// Load a dimension's policy, marking the dimension unavailable on failure
    pub fn load<F>(mut self, dimension: RoutingDimension, loader: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Arc<dyn RoutingPolicy>>,
    {
        let slot = match loader() {
            Ok(policy) => DimensionSlot::Available(policy),
            Err(e) => {
                let degraded = ConclaveError::DegradedDependency {
                    dependency: format!("{dimension} routing policy"),
                    reason: format!("{e:#}"),
                };
                warn!(dimension = %dimension, error = %degraded, "Routing dimension unavailable");
                DimensionSlot::Unavailable {
                    reason: format!("{e:#}"),
                }
            }
        };
        self.slots.insert(dimension, slot);
        self
    }

    pub fn build(mut self) -> RoutingEngine {
        for dim in RoutingDimension::ALL {
            self.slots
                .entry(dim)
                .or_insert_with(|| DimensionSlot::Unavailable {
                    reason: "not configured".into(),
                });
        }
        RoutingEngine {
            slots: self.slots,
            health: self.health,
            usage: Mutex::new(HashMap::new()),
        }
    }
}

/// Picks backends for units of work and learns from their outcomes.
///
/// Selection is read-only with respect to policy state. Policies only change
/// through [`RoutingEngine::update_arm`], which the feedback drain calls, so a
/// decision always sees the state as of the last drain.
pub struct RoutingEngine {
    slots: HashMap<RoutingDimension, DimensionSlot>,
    health: Arc<HealthMonitor>,
    /// Decayed selection counts, used to spread load across tied arms
    usage: Mutex<HashMap<(RoutingDimension, String), f64>>,
}

impl RoutingEngine {
    /// LinUCB on every dimension
    pub fn new(config: &RoutingConfig, health: Arc<HealthMonitor>) -> Self {
        RoutingEngineBuilder::new(health)
            .linucb_defaults(config)
            .build()
    }

    pub fn builder(health: Arc<HealthMonitor>) -> RoutingEngineBuilder {
        RoutingEngineBuilder::new(health)
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn is_available(&self, dimension: RoutingDimension) -> bool {
        self.slots
            .get(&dimension)
            .is_some_and(DimensionSlot::is_available)
    }

    /// The dimension's policy, or a degraded-dependency error
    pub fn policy(&self, dimension: RoutingDimension) -> Result<&Arc<dyn RoutingPolicy>> {
        match self.slots.get(&dimension) {
            Some(DimensionSlot::Available(policy)) => Ok(policy),
            Some(DimensionSlot::Unavailable { reason }) => Err(ConclaveError::DegradedDependency {
                dependency: format!("{dimension} routing policy"),
                reason: reason.clone(),
            }),
            None => Err(ConclaveError::NotFound(format!("{dimension} routing policy"))),
        }
    }

    /// Choose one arm out of `candidates`.
    ///
    /// Ineligible arms are filtered out first; if nothing survives the full
    /// list is used instead. An unavailable policy falls back to the least-used
    /// eligible arm. Only an empty candidate list is an error.
    pub fn select_arm<S: AsRef<str>>(
        &self,
        dimension: RoutingDimension,
        features: &[f64],
        candidates: &[S],
    ) -> Result<RoutingDecision> {
        if candidates.is_empty() {
            return Err(ConclaveError::Validation(format!(
                "{dimension} routing needs at least one candidate"
            )));
        }

        let component_type = dimension.component_type();
        let eligible: Vec<&str> = candidates
            .iter()
            .map(AsRef::as_ref)
            .filter(|arm| self.health.is_eligible(component_type, arm))
            .collect();
        let all_excluded = eligible.is_empty();
        let pool: Vec<&str> = if all_excluded {
            warn!(
                dimension = %dimension,
                candidates = candidates.len(),
                "All candidates disabled, falling back to full set"
            );
            candidates.iter().map(AsRef::as_ref).collect()
        } else {
            eligible
        };

        let mut usage = self.usage.lock();
        let usage_of = |arm: &str| {
            usage
                .get(&(dimension, arm.to_string()))
                .copied()
                .unwrap_or(0.0)
        };

        let decision = match self.policy(dimension) {
            Ok(policy) => {
                let scores = policy.score_arms(features, &pool)?;
                let mut best = &scores[0];
                for candidate in &scores[1..] {
                    let better = candidate.score > best.score + TIE_EPSILON;
                    let tied = (candidate.score - best.score).abs() <= TIE_EPSILON;
                    if better || (tied && usage_of(&candidate.arm) < usage_of(&best.arm)) {
                        best = candidate;
                    }
                }
                RoutingDecision {
                    dimension,
                    arm: best.arm.clone(),
                    confidence: 1.0 / (1.0 + best.uncertainty),
                    score: best.score,
                    degraded: all_excluded,
                }
            }
            Err(e) => {
                debug!(dimension = %dimension, error = %e, "Selecting by usage only");
                let mut arm = pool[0];
                for &candidate in &pool[1..] {
                    if usage_of(candidate) < usage_of(arm) {
                        arm = candidate;
                    }
                }
                RoutingDecision {
                    dimension,
                    arm: arm.to_string(),
                    confidence: 0.0,
                    score: 0.0,
                    degraded: true,
                }
            }
        };

        *usage.entry((dimension, decision.arm.clone())).or_insert(0.0) += 1.0;
        drop(usage);

        debug!(
            dimension = %dimension,
            arm = %decision.arm,
            confidence = decision.confidence,
            degraded = decision.degraded,
            "Selected arm"
        );
        Ok(decision)
    }

    /// Apply one observed reward. Called from the feedback drain only.
    pub fn update_arm(
        &self,
        dimension: RoutingDimension,
        arm: &str,
        features: &[f64],
        reward: f64,
    ) -> Result<()> {
        self.policy(dimension)?.update(arm, features, reward)
    }

    /// Prune stale arm statistics and decay usage counters
    pub fn consolidate(&self, stale_after: Duration, usage_decay: f64) -> ConsolidationReport {
        let mut report = ConsolidationReport::default();
        for dim in RoutingDimension::ALL {
            match self.policy(dim) {
                Ok(policy) => report.pruned_arms += policy.prune_stale(stale_after),
                Err(_) => report.skipped_dimensions.push(dim),
            }
        }

        let mut usage = self.usage.lock();
        for count in usage.values_mut() {
            *count *= usage_decay;
        }
        usage.retain(|_, count| *count >= 0.01);
        drop(usage);

        if report.pruned_arms > 0 {
            info!(pruned = report.pruned_arms, "Pruned stale arm statistics");
        }
        report
    }

    pub fn usage_count(&self, dimension: RoutingDimension, arm: &str) -> f64 {
        self.usage
            .lock()
            .get(&(dimension, arm.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn stats(&self) -> Vec<PolicyStats> {
        RoutingDimension::ALL
            .iter()
            .filter_map(|dim| self.policy(*dim).ok().map(|p| p.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::protocol::ComponentType;

    fn config() -> RoutingConfig {
        RoutingConfig {
            feature_dim: 2,
            cold_start_pulls: 1,
            ..Default::default()
        }
    }

    fn health() -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(HealthConfig {
            min_samples: 3,
            ..Default::default()
        }))
    }

    fn disable(health: &HealthMonitor, component_type: ComponentType, id: &str) {
        for _ in 0..3 {
            health.record_outcome(component_type, id, false, 0.0).unwrap();
        }
        health.evaluate_disable_state();
    }

    #[test]
    fn test_empty_candidates_is_validation_error() {
        let engine = RoutingEngine::new(&config(), health());
        let err = engine
            .select_arm::<&str>(RoutingDimension::Model, &[1.0, 0.0], &[])
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Validation(_)));
    }

    #[test]
    fn test_ties_broken_by_usage() {
        let engine = RoutingEngine::new(&config(), health());
        let x = [1.0, 0.0];
        let first = engine
            .select_arm(RoutingDimension::Tool, &x, &["a", "b"])
            .unwrap();
        let second = engine
            .select_arm(RoutingDimension::Tool, &x, &["a", "b"])
            .unwrap();
        assert_ne!(first.arm, second.arm);
        assert_eq!(engine.usage_count(RoutingDimension::Tool, "a"), 1.0);
        assert_eq!(engine.usage_count(RoutingDimension::Tool, "b"), 1.0);
    }

    #[test]
    fn test_disabled_arm_is_skipped() {
        let h = health();
        disable(&h, ComponentType::Model, "a");
        let engine = RoutingEngine::new(&config(), h);

        for _ in 0..5 {
            let decision = engine
                .select_arm(RoutingDimension::Model, &[1.0, 0.0], &["a", "b"])
                .unwrap();
            assert_eq!(decision.arm, "b");
            assert!(!decision.degraded);
        }
    }

    #[test]
    fn test_falls_back_when_all_disabled() {
        let h = health();
        disable(&h, ComponentType::Agent, "a");
        disable(&h, ComponentType::Agent, "b");
        let engine = RoutingEngine::new(&config(), h);

        let decision = engine
            .select_arm(RoutingDimension::Agent, &[1.0, 0.0], &["a", "b"])
            .unwrap();
        assert!(decision.arm == "a" || decision.arm == "b");
        assert!(decision.degraded);
    }

    #[test]
    fn test_health_is_scoped_to_component_type() {
        let h = health();
        disable(&h, ComponentType::Tool, "shared");
        let engine = RoutingEngine::new(&config(), h);

        let decision = engine
            .select_arm(RoutingDimension::Model, &[1.0, 0.0], &["shared"])
            .unwrap();
        assert!(!decision.degraded);
    }

    #[test]
    fn test_prefers_rewarded_arm() {
        let engine = RoutingEngine::new(&config(), health());
        let x = [1.0, 0.5];
        for _ in 0..100 {
            engine.update_arm(RoutingDimension::Model, "x", &x, 1.0).unwrap();
            engine.update_arm(RoutingDimension::Model, "y", &x, 0.0).unwrap();
        }
        for _ in 0..10 {
            let decision = engine
                .select_arm(RoutingDimension::Model, &x, &["y", "x"])
                .unwrap();
            assert_eq!(decision.arm, "x");
            assert!(decision.confidence > 0.5);
        }
    }

    #[test]
    fn test_unavailable_dimension_degrades() {
        let engine = RoutingEngine::builder(health())
            .load(RoutingDimension::Engine, || anyhow::bail!("engine catalog offline"))
            .linucb_defaults(&config())
            .build();

        assert!(!engine.is_available(RoutingDimension::Engine));
        assert!(engine.is_available(RoutingDimension::Model));

        let err = engine
            .update_arm(RoutingDimension::Engine, "temporal", &[1.0, 0.0], 1.0)
            .unwrap_err();
        assert!(matches!(err, ConclaveError::DegradedDependency { .. }));

        let decision = engine
            .select_arm(RoutingDimension::Engine, &[1.0, 0.0], &["temporal", "local"])
            .unwrap();
        assert!(decision.degraded);
        assert_eq!(engine.stats().len(), 3);
    }

    #[test]
    fn test_consolidate_decays_usage() {
        let engine = RoutingEngine::new(&config(), health());
        engine
            .select_arm(RoutingDimension::Tool, &[1.0, 0.0], &["a"])
            .unwrap();
        let report = engine.consolidate(Duration::from_secs(3600), 0.5);
        assert_eq!(report.pruned_arms, 0);
        assert_eq!(engine.usage_count(RoutingDimension::Tool, "a"), 0.5);
    }
}
