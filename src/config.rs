//! Runtime configuration, loadable from TOML

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConclaveError, Result};
use crate::protocol::RoutingDimension;

/// Top-level configuration for the orchestration core
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConclaveConfig {
    pub facade: FacadeConfig,
    pub health: HealthConfig,
    pub routing: RoutingConfig,
    pub feedback: FeedbackConfig,
    pub resilience: ResilienceConfig,
}

impl ConclaveConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.facade.validate()?;
        self.health.validate()?;
        self.routing.validate()?;
        self.feedback.validate()?;
        self.resilience.validate()
    }
}

fn unit_range(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConclaveError::Config(format!(
            "{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn non_zero(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(ConclaveError::Config(format!("{name} must be non-zero")));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    /// Contexts deeper than this are rejected as dispatch loops
    pub max_depth: u32,
    /// Upper bound on a single cleanup or shutdown hook
    pub cleanup_timeout_ms: u64,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            cleanup_timeout_ms: 5_000,
        }
    }
}

impl FacadeConfig {
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        non_zero("facade.cleanup_timeout_ms", self.cleanup_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Weight of the newest sample in the running quality average
    pub ewma_weight: f64,
    pub min_samples: u64,
    pub disable_threshold: f64,
    pub re_enable_threshold: f64,
    pub evaluation_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ewma_weight: 0.3,
            min_samples: 10,
            disable_threshold: 0.3,
            re_enable_threshold: 0.5,
            evaluation_interval_ms: 30_000,
        }
    }
}

impl HealthConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        unit_range("health.ewma_weight", self.ewma_weight)?;
        unit_range("health.disable_threshold", self.disable_threshold)?;
        unit_range("health.re_enable_threshold", self.re_enable_threshold)?;
        if self.re_enable_threshold < self.disable_threshold {
            return Err(ConclaveError::Config(
                "health.re_enable_threshold must not be below health.disable_threshold".into(),
            ));
        }
        non_zero("health.min_samples", self.min_samples)?;
        non_zero("health.evaluation_interval_ms", self.evaluation_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Length of every context feature vector
    pub feature_dim: usize,
    /// Initial UCB exploration constant
    pub exploration_alpha: f64,
    /// Multiplicative decay applied to alpha on each update
    pub alpha_decay: f64,
    pub alpha_min: f64,
    /// Ridge regularizer for the per-arm linear model
    pub ridge_lambda: f64,
    /// Observations during which an arm is scored from its prior
    pub cold_start_pulls: u64,
    /// Optimistic estimate for arm classes absent from `priors`
    pub default_prior: f64,
    /// Optimistic estimate keyed by arm class (text before the first ':' or '/')
    pub priors: HashMap<String, f64>,
    /// Dimensions whose rewards are signed, in [-1, 1]
    pub cost_penalized: Vec<RoutingDimension>,
    /// Arms not updated for this long are pruned during consolidation
    pub stale_after_secs: u64,
    /// Factor applied to usage counters during consolidation
    pub usage_decay: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            feature_dim: 4,
            exploration_alpha: 1.0,
            alpha_decay: 0.995,
            alpha_min: 0.01,
            ridge_lambda: 1.0,
            cold_start_pulls: 3,
            default_prior: 1.0,
            priors: HashMap::new(),
            cost_penalized: Vec::new(),
            stale_after_secs: 7 * 24 * 3600,
            usage_decay: 0.5,
        }
    }
}

impl RoutingConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    fn validate(&self) -> Result<()> {
        non_zero("routing.feature_dim", self.feature_dim as u64)?;
        if self.exploration_alpha < 0.0 || self.alpha_min < 0.0 {
            return Err(ConclaveError::Config(
                "routing exploration constants must be non-negative".into(),
            ));
        }
        if !(self.alpha_decay > 0.0 && self.alpha_decay <= 1.0) {
            return Err(ConclaveError::Config(
                "routing.alpha_decay must be within (0, 1]".into(),
            ));
        }
        if self.ridge_lambda <= 0.0 {
            return Err(ConclaveError::Config(
                "routing.ridge_lambda must be positive".into(),
            ));
        }
        unit_range("routing.usage_decay", self.usage_decay)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Per component-type queue capacity; overflow drops the oldest signal
    pub queue_capacity: usize,
    /// Signals popped per queue per drain
    pub batch_size: usize,
    pub drain_interval_ms: u64,
    pub consolidation_interval_ms: u64,
    /// Bounded wait for background loops on shutdown
    pub shutdown_grace_ms: u64,
    /// Reward at or above which an outcome counts as a success
    pub success_threshold: f64,
    /// Reward deducted per error attributed to a trajectory stage
    pub error_penalty: f64,
    /// Enables cost-source signals derived from trajectories
    pub cost_budget: Option<f64>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            batch_size: 100,
            drain_interval_ms: 1_000,
            consolidation_interval_ms: 300_000,
            shutdown_grace_ms: 2_000,
            success_threshold: 0.5,
            error_penalty: 0.2,
            cost_budget: None,
        }
    }
}

impl FeedbackConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn consolidation_interval(&self) -> Duration {
        Duration::from_millis(self.consolidation_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        non_zero("feedback.queue_capacity", self.queue_capacity as u64)?;
        non_zero("feedback.batch_size", self.batch_size as u64)?;
        non_zero("feedback.drain_interval_ms", self.drain_interval_ms)?;
        non_zero(
            "feedback.consolidation_interval_ms",
            self.consolidation_interval_ms,
        )?;
        unit_range("feedback.success_threshold", self.success_threshold)?;
        unit_range("feedback.error_penalty", self.error_penalty)?;
        if let Some(budget) = self.cost_budget {
            if budget <= 0.0 {
                return Err(ConclaveError::Config(
                    "feedback.cost_budget must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub recompute_interval_ms: u64,
    /// Minimum time active after the overload conditions last held
    pub recovery_delay_ms: u64,
    /// Consecutive failures that open a breaker
    pub breaker_failure_threshold: u32,
    /// Time an open breaker waits before probing half-open
    pub breaker_recovery_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            recompute_interval_ms: 5_000,
            recovery_delay_ms: 30_000,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_ms: 30_000,
        }
    }
}

impl ResilienceConfig {
    pub fn recompute_interval(&self) -> Duration {
        Duration::from_millis(self.recompute_interval_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn breaker_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_recovery_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        non_zero("resilience.recompute_interval_ms", self.recompute_interval_ms)?;
        non_zero(
            "resilience.breaker_failure_threshold",
            self.breaker_failure_threshold as u64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = ConclaveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resilience.recovery_delay(), Duration::from_secs(30));
        assert_eq!(config.resilience.recompute_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ConclaveConfig::from_toml_str(
            r#"
            [health]
            min_samples = 4

            [routing]
            feature_dim = 6
            cost_penalized = ["model"]

            [routing.priors]
            openai = 0.9
            "#,
        )
        .unwrap();

        assert_eq!(config.health.min_samples, 4);
        assert_eq!(config.health.disable_threshold, 0.3);
        assert_eq!(config.routing.feature_dim, 6);
        assert_eq!(config.routing.cost_penalized, vec![RoutingDimension::Model]);
        assert_eq!(config.routing.priors.get("openai"), Some(&0.9));
        assert_eq!(config.feedback.queue_capacity, 1_000);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = ConclaveConfig::from_toml_str(
            r#"
            [health]
            disable_threshold = 0.6
            re_enable_threshold = 0.4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConclaveError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = ConclaveConfig::from_toml_str("[feedback]\nqueue_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[resilience]\nrecovery_delay_ms = 1000").unwrap();

        let config = ConclaveConfig::load(file.path()).unwrap();
        assert_eq!(config.resilience.recovery_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConclaveConfig::load("/nonexistent/conclave.toml").unwrap_err();
        assert!(matches!(err, ConclaveError::Io(_)));
    }
}
