//! Shared protocol types: identifiers, layers and component classification

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a top-level request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Architectural layer an orchestrator lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Domain,
    Application,
    Infrastructure,
}

/// How an orchestrator composes its work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationType {
    Sequential,
    Parallel,
    Hierarchical,
    Adaptive,
    Feedback,
    Monitoring,
    Coordination,
}

/// Kind of routable, health-tracked component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Model,
    Tool,
    Agent,
    Threshold,
    Prompt,
    Engine,
}

impl ComponentType {
    pub const ALL: [ComponentType; 6] = [
        ComponentType::Model,
        ComponentType::Tool,
        ComponentType::Agent,
        ComponentType::Threshold,
        ComponentType::Prompt,
        ComponentType::Engine,
    ];

    /// Routing dimension fed by this component type, if any
    pub fn routing_dimension(self) -> Option<RoutingDimension> {
        match self {
            ComponentType::Model => Some(RoutingDimension::Model),
            ComponentType::Tool => Some(RoutingDimension::Tool),
            ComponentType::Agent => Some(RoutingDimension::Agent),
            ComponentType::Engine => Some(RoutingDimension::Engine),
            ComponentType::Threshold | ComponentType::Prompt => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentType::Model => "model",
            ComponentType::Tool => "tool",
            ComponentType::Agent => "agent",
            ComponentType::Threshold => "threshold",
            ComponentType::Prompt => "prompt",
            ComponentType::Engine => "engine",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an outcome signal originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    Trajectory,
    Tool,
    Agent,
    Retrieval,
    Governance,
    Cost,
}

impl FeedbackSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackSource::Trajectory => "trajectory",
            FeedbackSource::Tool => "tool",
            FeedbackSource::Agent => "agent",
            FeedbackSource::Retrieval => "retrieval",
            FeedbackSource::Governance => "governance",
            FeedbackSource::Cost => "cost",
        }
    }
}

/// One independently learned routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingDimension {
    Model,
    Tool,
    Agent,
    Engine,
}

impl RoutingDimension {
    pub const ALL: [RoutingDimension; 4] = [
        RoutingDimension::Model,
        RoutingDimension::Tool,
        RoutingDimension::Agent,
        RoutingDimension::Engine,
    ];

    /// Component type whose health gates this dimension's arms
    pub fn component_type(self) -> ComponentType {
        match self {
            RoutingDimension::Model => ComponentType::Model,
            RoutingDimension::Tool => ComponentType::Tool,
            RoutingDimension::Agent => ComponentType::Agent,
            RoutingDimension::Engine => ComponentType::Engine,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.component_type().as_str()
    }
}

impl fmt::Display for RoutingDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a health-tracked component
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKey {
    pub component_type: ComponentType,
    pub component_id: String,
}

impl ComponentKey {
    pub fn new(component_type: ComponentType, component_id: impl Into<String>) -> Self {
        Self {
            component_type,
            component_id: component_id.into(),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.component_type, self.component_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mapping() {
        for dim in RoutingDimension::ALL {
            assert_eq!(dim.component_type().routing_dimension(), Some(dim));
        }
        assert_eq!(ComponentType::Prompt.routing_dimension(), None);
        assert_eq!(ComponentType::Threshold.routing_dimension(), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ComponentType::Engine).unwrap();
        assert_eq!(json, "\"engine\"");
        let src: FeedbackSource = serde_json::from_str("\"governance\"").unwrap();
        assert_eq!(src, FeedbackSource::Governance);
    }

    #[test]
    fn test_component_key_display() {
        let key = ComponentKey::new(ComponentType::Tool, "web_search");
        assert_eq!(key.to_string(), "tool/web_search");
    }
}
