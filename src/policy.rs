//! Contextual bandit policies used by the routing engine

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RoutingConfig;
use crate::error::{ConclaveError, Result};
use crate::protocol::RoutingDimension;

/// Accepted reward interval for a dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RewardRange {
    /// [0, 1]
    Unit,
    /// [-1, 1], for cost-penalized dimensions
    Signed,
}

impl RewardRange {
    pub fn bounds(self) -> (f64, f64) {
        match self {
            RewardRange::Unit => (0.0, 1.0),
            RewardRange::Signed => (-1.0, 1.0),
        }
    }

    pub fn validate(self, reward: f64) -> Result<f64> {
        let (lo, hi) = self.bounds();
        if !reward.is_finite() || reward < lo || reward > hi {
            return Err(ConclaveError::Validation(format!(
                "reward {reward} outside [{lo}, {hi}]"
            )));
        }
        Ok(reward)
    }
}

/// Arm class used to look up cold-start priors: the id up to the first ':' or '/'
pub fn arm_class(arm: &str) -> &str {
    arm.split([':', '/']).next().unwrap_or(arm)
}

/// Static optimistic estimates for arms that have no history yet
#[derive(Debug, Clone)]
pub struct PriorTable {
    priors: HashMap<String, f64>,
    default: f64,
}

impl PriorTable {
    pub fn new(priors: HashMap<String, f64>, default: f64) -> Self {
        Self { priors, default }
    }

    pub fn prior_for(&self, arm: &str) -> f64 {
        self.priors
            .get(arm_class(arm))
            .copied()
            .unwrap_or(self.default)
    }
}

/// Score of one arm for one feature vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmScore {
    pub arm: String,
    /// Expected reward (prior while cold)
    pub estimate: f64,
    /// Width of the confidence ellipsoid along the feature vector
    pub uncertainty: f64,
    /// estimate + alpha * uncertainty
    pub score: f64,
    pub observations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArmStats {
    pub arm: String,
    pub observations: u64,
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyStats {
    pub dimension: RoutingDimension,
    pub alpha: f64,
    pub updates: u64,
    pub arms: Vec<ArmStats>,
}

/// A per-dimension decision policy.
///
/// Scoring reads an immutable snapshot and never blocks. Updates are only
/// issued from the feedback drain.
pub trait RoutingPolicy: Send + Sync {
    fn dimension(&self) -> RoutingDimension;

    fn reward_range(&self) -> RewardRange;

    /// Score every arm against one consistent snapshot
    fn score_arms(&self, features: &[f64], arms: &[&str]) -> Result<Vec<ArmScore>>;

    /// Fold one observed reward into the arm's estimate
    fn update(&self, arm: &str, features: &[f64], reward: f64) -> Result<()>;

    /// Drop arms whose statistics have not moved for `max_age`; returns how many
    fn prune_stale(&self, max_age: Duration) -> usize;

    fn stats(&self) -> PolicyStats;
}

/// Ridge-regression sufficient statistics for one arm
#[derive(Debug, Clone)]
struct ArmModel {
    /// Inverse design matrix, row-major d x d
    a_inv: Vec<f64>,
    b: Vec<f64>,
    theta: Vec<f64>,
    observations: u64,
    last_updated: Instant,
}

impl ArmModel {
    fn new(dim: usize, lambda: f64) -> Self {
        let mut a_inv = vec![0.0; dim * dim];
        for i in 0..dim {
            a_inv[i * dim + i] = 1.0 / lambda;
        }
        Self {
            a_inv,
            b: vec![0.0; dim],
            theta: vec![0.0; dim],
            observations: 0,
            last_updated: Instant::now(),
        }
    }

    fn dim(&self) -> usize {
        self.b.len()
    }

    fn a_inv_times(&self, x: &[f64]) -> Vec<f64> {
        let d = self.dim();
        (0..d)
            .map(|i| (0..d).map(|j| self.a_inv[i * d + j] * x[j]).sum())
            .collect()
    }

    fn estimate(&self, x: &[f64]) -> f64 {
        dot(&self.theta, x)
    }

    fn uncertainty(&self, x: &[f64]) -> f64 {
        dot(x, &self.a_inv_times(x)).max(0.0).sqrt()
    }

    /// Sherman-Morrison rank-one update of A^-1, then refresh theta
    fn update(&mut self, x: &[f64], reward: f64) {
        let d = self.dim();
        let ax = self.a_inv_times(x);
        let denom = 1.0 + dot(x, &ax);
        for i in 0..d {
            for j in 0..d {
                self.a_inv[i * d + j] -= ax[i] * ax[j] / denom;
            }
        }
        for (bi, xi) in self.b.iter_mut().zip(x) {
            *bi += reward * xi;
        }
        self.theta = self.a_inv_times(&self.b);
        self.observations += 1;
        self.last_updated = Instant::now();
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone)]
struct PolicyState {
    arms: HashMap<String, Arc<ArmModel>>,
    alpha: f64,
    updates: u64,
}

/// LinUCB: a linear reward model per arm plus an upper-confidence bonus.
///
/// Arms with fewer than `cold_start_pulls` observations are scored from the
/// prior table instead of their (still empty) linear model, so each new arm is
/// tried a bounded number of times before real history takes over.
pub struct LinUcbPolicy {
    dimension: RoutingDimension,
    feature_dim: usize,
    ridge_lambda: f64,
    alpha_decay: f64,
    alpha_min: f64,
    cold_start_pulls: u64,
    reward_range: RewardRange,
    priors: PriorTable,
    state: ArcSwap<PolicyState>,
}

impl LinUcbPolicy {
    pub fn new(dimension: RoutingDimension, config: &RoutingConfig) -> Self {
        let reward_range = if config.cost_penalized.contains(&dimension) {
            RewardRange::Signed
        } else {
            RewardRange::Unit
        };

        Self {
            dimension,
            feature_dim: config.feature_dim,
            ridge_lambda: config.ridge_lambda,
            alpha_decay: config.alpha_decay,
            alpha_min: config.alpha_min,
            cold_start_pulls: config.cold_start_pulls,
            reward_range,
            priors: PriorTable::new(config.priors.clone(), config.default_prior),
            state: ArcSwap::from_pointee(PolicyState {
                arms: HashMap::new(),
                alpha: config.exploration_alpha,
                updates: 0,
            }),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.state.load().alpha
    }

    fn validate_features(&self, features: &[f64]) -> Result<()> {
        if features.len() != self.feature_dim {
            return Err(ConclaveError::Validation(format!(
                "{} routing expects {} features, got {}",
                self.dimension,
                self.feature_dim,
                features.len()
            )));
        }
        if features.iter().any(|f| !f.is_finite()) {
            return Err(ConclaveError::Validation(format!(
                "{} routing features must be finite",
                self.dimension
            )));
        }
        Ok(())
    }

    fn score_one(&self, state: &PolicyState, arm: &str, x: &[f64]) -> ArmScore {
        let (estimate, uncertainty, observations) = match state.arms.get(arm) {
            Some(model) => {
                let estimate = if model.observations < self.cold_start_pulls {
                    self.priors.prior_for(arm)
                } else {
                    model.estimate(x)
                };
                (estimate, model.uncertainty(x), model.observations)
            }
            None => {
                let fresh = ArmModel::new(self.feature_dim, self.ridge_lambda);
                (self.priors.prior_for(arm), fresh.uncertainty(x), 0)
            }
        };

        ArmScore {
            arm: arm.to_string(),
            estimate,
            uncertainty,
            score: estimate + state.alpha * uncertainty,
            observations,
        }
    }
}

impl RoutingPolicy for LinUcbPolicy {
    fn dimension(&self) -> RoutingDimension {
        self.dimension
    }

    fn reward_range(&self) -> RewardRange {
        self.reward_range
    }

    fn score_arms(&self, features: &[f64], arms: &[&str]) -> Result<Vec<ArmScore>> {
        self.validate_features(features)?;
        let state = self.state.load();
        Ok(arms
            .iter()
            .map(|arm| self.score_one(&state, arm, features))
            .collect())
    }

    fn update(&self, arm: &str, features: &[f64], reward: f64) -> Result<()> {
        self.validate_features(features)?;
        let reward = self.reward_range.validate(reward)?;

        self.state.rcu(|current| {
            let mut next = PolicyState::clone(current);
            let model = next
                .arms
                .entry(arm.to_string())
                .or_insert_with(|| Arc::new(ArmModel::new(self.feature_dim, self.ridge_lambda)));
            Arc::make_mut(model).update(features, reward);
            next.updates += 1;
            next.alpha = (next.alpha * self.alpha_decay).max(self.alpha_min);
            next
        });

        debug!(dimension = %self.dimension, arm = %arm, reward, "Updated arm");
        Ok(())
    }

    fn prune_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let previous = self.state.rcu(|current| {
            let mut next = PolicyState::clone(current);
            next.arms
                .retain(|_, model| now.saturating_duration_since(model.last_updated) < max_age);
            next
        });
        let after = self.state.load().arms.len();
        previous.arms.len().saturating_sub(after)
    }

    fn stats(&self) -> PolicyStats {
        let state = self.state.load();
        let mut arms: Vec<ArmStats> = state
            .arms
            .iter()
            .map(|(arm, model)| ArmStats {
                arm: arm.clone(),
                observations: model.observations,
                weights: model.theta.clone(),
            })
            .collect();
        arms.sort_by(|a, b| a.arm.cmp(&b.arm));

        PolicyStats {
            dimension: self.dimension,
            alpha: state.alpha,
            updates: state.updates,
            arms,
        }
    }
}
