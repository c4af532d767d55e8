//! Feedback signals and the outcome records they are derived from

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FeedbackConfig;
use crate::error::{ConclaveError, Result};
use crate::protocol::{ComponentType, FeedbackSource};

/// One observed outcome for one component. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSignal {
    pub source: FeedbackSource,
    pub component_type: ComponentType,
    pub component_id: String,
    pub context_features: Vec<f64>,
    pub reward: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl FeedbackSignal {
    pub fn new(
        source: FeedbackSource,
        component_type: ComponentType,
        component_id: impl Into<String>,
        context_features: Vec<f64>,
        reward: f64,
    ) -> Self {
        Self {
            source,
            component_type,
            component_id: component_id.into(),
            context_features,
            reward,
            timestamp: Utc::now(),
        }
    }

    /// Shape checks that do not depend on the target dimension
    pub fn validate(&self) -> Result<()> {
        if self.component_id.trim().is_empty() {
            return Err(ConclaveError::validation("feedback signal has an empty component id"));
        }
        if !self.reward.is_finite() || !(-1.0..=1.0).contains(&self.reward) {
            return Err(ConclaveError::Validation(format!(
                "reward {} for {}/{} is outside [-1, 1]",
                self.reward, self.component_type, self.component_id
            )));
        }
        if self.context_features.iter().any(|f| !f.is_finite()) {
            return Err(ConclaveError::Validation(format!(
                "non-finite context feature for {}/{}",
                self.component_type, self.component_id
            )));
        }
        Ok(())
    }
}

/// Quality observed for one stage of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub component_type: ComponentType,
    pub component_id: String,
    pub quality: f64,
}

/// An error raised while running a task, optionally pinned to one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryError {
    #[serde(default)]
    pub component_id: Option<String>,
    pub message: String,
}

/// Structured outcome of a completed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub task_id: String,
    #[serde(default)]
    pub context_features: Vec<f64>,
    pub stages: Vec<StageOutcome>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub errors: Vec<TrajectoryError>,
}

impl TrajectoryRecord {
    /// Derive one trajectory signal per stage, plus a cost signal for the first
    /// model stage when a cost budget is configured.
    ///
    /// Each stage's reward is its quality minus `error_penalty` for every error
    /// pinned to that component or left unattributed, floored at zero.
    pub fn derive_signals(&self, config: &FeedbackConfig) -> Result<Vec<FeedbackSignal>> {
        if self.stages.is_empty() {
            return Err(ConclaveError::Validation(format!(
                "trajectory {} has no stages",
                self.task_id
            )));
        }

        let mut signals = Vec::with_capacity(self.stages.len() + 1);
        for stage in &self.stages {
            if !stage.quality.is_finite() || !(0.0..=1.0).contains(&stage.quality) {
                return Err(ConclaveError::Validation(format!(
                    "trajectory {} stage {} quality {} is outside [0, 1]",
                    self.task_id, stage.component_id, stage.quality
                )));
            }

            let errors = self
                .errors
                .iter()
                .filter(|e| match &e.component_id {
                    Some(id) => id == &stage.component_id,
                    None => true,
                })
                .count();
            let reward = (stage.quality - config.error_penalty * errors as f64).max(0.0);

            signals.push(FeedbackSignal::new(
                FeedbackSource::Trajectory,
                stage.component_type,
                stage.component_id.clone(),
                self.context_features.clone(),
                reward,
            ));
        }

        if let (Some(budget), Some(cost)) = (config.cost_budget, self.cost) {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ConclaveError::Validation(format!(
                    "trajectory {} cost {} is invalid",
                    self.task_id, cost
                )));
            }
            if let Some(model) = self
                .stages
                .iter()
                .find(|s| s.component_type == ComponentType::Model)
            {
                signals.push(FeedbackSignal::new(
                    FeedbackSource::Cost,
                    ComponentType::Model,
                    model.component_id.clone(),
                    self.context_features.clone(),
                    1.0 - (cost / budget).min(1.0),
                ));
            }
        }

        Ok(signals)
    }
}
