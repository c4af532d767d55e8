//! Component health tracking and auto-disable

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::{ConclaveError, Result};
use crate::protocol::{ComponentKey, ComponentType};

const QUALITY_WEIGHT: f64 = 0.7;
const RELIABILITY_WEIGHT: f64 = 0.3;

/// Rolling health statistics for one component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub success_count: u64,
    pub total_count: u64,
    pub running_quality_average: f64,
    pub last_updated: DateTime<Utc>,
    pub disabled: bool,
    pub disabled_at: Option<DateTime<Utc>>,
    /// Observations since the component was first seen or last changed state
    pub window_samples: u64,
    pub window_successes: u64,
}

impl ComponentHealth {
    fn new() -> Self {
        Self {
            success_count: 0,
            total_count: 0,
            running_quality_average: 0.0,
            last_updated: Utc::now(),
            disabled: false,
            disabled_at: None,
            window_samples: 0,
            window_successes: 0,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        1.0 - self.success_count as f64 / self.total_count as f64
    }

    /// Error rate over the current window only
    pub fn window_error_rate(&self) -> f64 {
        if self.window_samples == 0 {
            return 0.0;
        }
        1.0 - self.window_successes as f64 / self.window_samples as f64
    }

    /// Blend of quality and windowed reliability, bounded to [0, 1].
    ///
    /// Both the disable and the re-enable rule judge this one score.
    pub fn health_score(&self) -> f64 {
        blend(self.running_quality_average, self.window_error_rate())
    }

    /// Flip the disabled flag and start a fresh observation window
    fn transition(&mut self, disabled: bool) {
        self.disabled = disabled;
        self.disabled_at = disabled.then(Utc::now);
        self.window_samples = 0;
        self.window_successes = 0;
    }
}

fn blend(quality: f64, error_rate: f64) -> f64 {
    (QUALITY_WEIGHT * quality + RELIABILITY_WEIGHT * (1.0 - error_rate)).clamp(0.0, 1.0)
}

/// A disable or re-enable decision made by [`HealthMonitor::evaluate_disable_state`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HealthTransition {
    Disabled { key: ComponentKey, score: f64 },
    Enabled { key: ComponentKey, score: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealthEntry {
    pub key: ComponentKey,
    pub score: f64,
    #[serde(flatten)]
    pub health: ComponentHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub components: Vec<ComponentHealthEntry>,
    pub disabled_count: usize,
}

/// Tracks per-component quality and keeps failing components out of routing.
///
/// Writes come from the feedback drain only. Eligibility checks read a
/// published set of disabled components and never take the stats lock.
pub struct HealthMonitor {
    config: HealthConfig,
    components: Mutex<HashMap<ComponentKey, ComponentHealth>>,
    disabled: ArcSwap<HashSet<ComponentKey>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            components: Mutex::new(HashMap::new()),
            disabled: ArcSwap::from_pointee(HashSet::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Fold one outcome into the component's counters and running average
    pub fn record_outcome(
        &self,
        component_type: ComponentType,
        component_id: &str,
        success: bool,
        quality_score: f64,
    ) -> Result<()> {
        if !quality_score.is_finite() || !(0.0..=1.0).contains(&quality_score) {
            return Err(ConclaveError::Validation(format!(
                "quality score {quality_score} for {component_type}/{component_id} is outside [0, 1]"
            )));
        }

        let key = ComponentKey::new(component_type, component_id);
        let mut components = self.components.lock();
        let health = components.entry(key).or_insert_with(ComponentHealth::new);

        health.running_quality_average = if health.total_count == 0 {
            quality_score
        } else {
            let w = self.config.ewma_weight;
            (w * quality_score + (1.0 - w) * health.running_quality_average).clamp(0.0, 1.0)
        };
        health.total_count += 1;
        health.window_samples += 1;
        if success {
            health.success_count += 1;
            health.window_successes += 1;
        }
        health.last_updated = Utc::now();

        debug!(
            component_type = %component_type,
            component_id = %component_id,
            success,
            quality = quality_score,
            average = health.running_quality_average,
            "Recorded outcome"
        );
        Ok(())
    }

    /// False only while the component is disabled. Unknown components are eligible.
    pub fn is_eligible(&self, component_type: ComponentType, component_id: &str) -> bool {
        !self
            .disabled
            .load()
            .contains(&ComponentKey::new(component_type, component_id))
    }

    /// Apply the disable and re-enable rules to every component.
    ///
    /// A component is only judged once `min_samples` observations have arrived
    /// since it was first seen or last changed state, so a transition can never
    /// be reversed without fresh evidence.
    pub fn evaluate_disable_state(&self) -> Vec<HealthTransition> {
        let min_samples = self.config.min_samples;
        let mut transitions = Vec::new();
        let mut components = self.components.lock();

        for (key, health) in components.iter_mut() {
            if health.window_samples < min_samples {
                continue;
            }
            let score = health.health_score();
            if health.disabled {
                if score >= self.config.re_enable_threshold {
                    info!(
                        component = %key,
                        score,
                        samples = health.window_samples,
                        "Component re-enabled"
                    );
                    health.transition(false);
                    transitions.push(HealthTransition::Enabled {
                        key: key.clone(),
                        score,
                    });
                }
            } else if score < self.config.disable_threshold {
                health.transition(true);
                warn!(
                    component = %key,
                    score,
                    threshold = self.config.disable_threshold,
                    "Component disabled"
                );
                transitions.push(HealthTransition::Disabled {
                    key: key.clone(),
                    score,
                });
            }
        }

        if !transitions.is_empty() {
            let disabled: HashSet<ComponentKey> = components
                .iter()
                .filter(|(_, h)| h.disabled)
                .map(|(k, _)| k.clone())
                .collect();
            self.disabled.store(Arc::new(disabled));
        }
        transitions
    }

    pub fn get(&self, component_type: ComponentType, component_id: &str) -> Option<ComponentHealth> {
        self.components
            .lock()
            .get(&ComponentKey::new(component_type, component_id))
            .cloned()
    }

    pub fn disabled_components(&self) -> Vec<ComponentKey> {
        let mut keys: Vec<ComponentKey> = self.disabled.load().iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn report(&self) -> HealthReport {
        let components = self.components.lock();
        let mut entries: Vec<ComponentHealthEntry> = components
            .iter()
            .map(|(key, health)| ComponentHealthEntry {
                key: key.clone(),
                score: health.health_score(),
                health: health.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let disabled_count = entries.iter().filter(|e| e.health.disabled).count();

        HealthReport {
            components: entries,
            disabled_count,
        }
    }

    pub fn len(&self) -> usize {
        self.components.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.lock().is_empty()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(min_samples: u64) -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            min_samples,
            ..Default::default()
        })
    }

    fn record_n(m: &HealthMonitor, id: &str, n: usize, success: bool, quality: f64) {
        for _ in 0..n {
            m.record_outcome(ComponentType::Model, id, success, quality).unwrap();
        }
    }

    #[test]
    fn test_unknown_component_is_eligible() {
        let m = monitor(5);
        assert!(m.is_eligible(ComponentType::Tool, "never-seen"));
        assert!(m.is_empty());
    }

    #[test]
    fn test_rejects_out_of_range_quality() {
        let m = monitor(5);
        assert!(m.record_outcome(ComponentType::Model, "a", true, 1.5).is_err());
        assert!(m.record_outcome(ComponentType::Model, "a", true, f64::NAN).is_err());
        assert!(m.get(ComponentType::Model, "a").is_none());
    }

    #[test]
    fn test_ewma_tracks_recent_quality() {
        let m = monitor(5);
        record_n(&m, "a", 1, true, 1.0);
        record_n(&m, "a", 1, true, 0.0);
        let h = m.get(ComponentType::Model, "a").unwrap();
        assert!((h.running_quality_average - 0.7).abs() < 1e-9);
        assert_eq!(h.total_count, 2);
        assert_eq!(h.success_count, 2);
    }

    #[test]
    fn test_no_disable_below_min_samples() {
        let m = monitor(5);
        record_n(&m, "bad", 4, false, 0.0);
        assert!(m.evaluate_disable_state().is_empty());
        assert!(m.is_eligible(ComponentType::Model, "bad"));
    }

    #[test]
    fn test_disables_poor_component() {
        let m = monitor(5);
        record_n(&m, "bad", 5, false, 0.0);
        record_n(&m, "good", 5, true, 0.9);

        let transitions = m.evaluate_disable_state();
        assert_eq!(transitions.len(), 1);
        assert!(matches!(
            &transitions[0],
            HealthTransition::Disabled { key, .. } if key.component_id == "bad"
        ));
        assert!(!m.is_eligible(ComponentType::Model, "bad"));
        assert!(m.is_eligible(ComponentType::Model, "good"));
        assert_eq!(m.report().disabled_count, 1);
    }

    #[test]
    fn test_re_enable_requires_min_samples_after_disable() {
        let m = monitor(5);
        record_n(&m, "flaky", 5, false, 0.0);
        m.evaluate_disable_state();
        assert!(!m.is_eligible(ComponentType::Model, "flaky"));

        // Excellent results, but too few of them
        record_n(&m, "flaky", 4, true, 1.0);
        assert!(m.evaluate_disable_state().is_empty());
        assert!(!m.is_eligible(ComponentType::Model, "flaky"));

        record_n(&m, "flaky", 1, true, 1.0);
        let transitions = m.evaluate_disable_state();
        assert!(matches!(&transitions[0], HealthTransition::Enabled { .. }));
        assert!(m.is_eligible(ComponentType::Model, "flaky"));
    }

    #[test]
    fn test_stays_disabled_without_recovery() {
        let m = monitor(3);
        record_n(&m, "bad", 3, false, 0.0);
        m.evaluate_disable_state();
        record_n(&m, "bad", 10, false, 0.1);
        assert!(m.evaluate_disable_state().is_empty());
        assert!(!m.is_eligible(ComponentType::Model, "bad"));
    }

    #[test]
    fn test_health_score_bounds() {
        let mut h = ComponentHealth::new();
        h.running_quality_average = 1.0;
        h.window_samples = 10;
        h.window_successes = 10;
        assert!((h.health_score() - 1.0).abs() < 1e-9);

        h.running_quality_average = 0.0;
        h.window_successes = 0;
        assert_eq!(h.health_score(), 0.0);
    }

    #[test]
    fn test_re_enabled_component_does_not_flap() {
        let m = HealthMonitor::new(HealthConfig::default());
        record_n(&m, "shaky", 100, false, 0.0);
        assert!(matches!(
            m.evaluate_disable_state()[..],
            [HealthTransition::Disabled { .. }]
        ));

        record_n(&m, "shaky", 10, true, 0.35);
        let transitions = m.evaluate_disable_state();
        assert!(matches!(transitions[..], [HealthTransition::Enabled { .. }]));
        assert!(m.is_eligible(ComponentType::Model, "shaky"));

        // No new evidence: the decision holds across evaluations
        for _ in 0..3 {
            assert!(m.evaluate_disable_state().is_empty());
            assert!(m.is_eligible(ComponentType::Model, "shaky"));
        }

        // Fresh failures below min_samples are not enough either
        record_n(&m, "shaky", 9, false, 0.0);
        assert!(m.evaluate_disable_state().is_empty());
        assert!(m.is_eligible(ComponentType::Model, "shaky"));

        record_n(&m, "shaky", 1, false, 0.0);
        assert!(matches!(
            m.evaluate_disable_state()[..],
            [HealthTransition::Disabled { .. }]
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_health_score_stays_in_unit_range(
            outcomes in proptest::collection::vec((proptest::bool::ANY, 0.0f64..=1.0), 1..200)
        ) {
            let m = monitor(5);
            for (success, quality) in &outcomes {
                m.record_outcome(ComponentType::Tool, "t", *success, *quality).unwrap();
            }
            let h = m.get(ComponentType::Tool, "t").unwrap();
            let score = h.health_score();
            proptest::prop_assert!((0.0..=1.0).contains(&score));
            proptest::prop_assert!((0.0..=1.0).contains(&h.running_quality_average));
            proptest::prop_assert_eq!(h.total_count, outcomes.len() as u64);
        }
    }
}
