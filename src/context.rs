//! Per-invocation orchestration context

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConclaveError, Result};
use crate::protocol::RequestId;

/// Identity and causal depth of one orchestration call.
///
/// Contexts are created at request entry and handed down the call chain.
/// Nested dispatch goes through [`OrchestrationContext::child`], which keeps the
/// request identity and bumps `depth` so that runaway recursion is caught by
/// [`OrchestrationContext::check_depth`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationContext {
    pub tenant_id: String,
    pub request_id: RequestId,
    pub trace_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub parent_orchestrator: Option<String>,
    pub depth: u32,
}

impl OrchestrationContext {
    /// Root context for a fresh request
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            request_id: RequestId::new(),
            trace_id: None,
            metadata: HashMap::new(),
            parent_orchestrator: None,
            depth: 0,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Context for a call made by `parent` on behalf of this one
    pub fn child(&self, parent: impl Into<String>) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            request_id: self.request_id,
            trace_id: self.trace_id.clone(),
            metadata: self.metadata.clone(),
            parent_orchestrator: Some(parent.into()),
            depth: self.depth.saturating_add(1),
        }
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Reject contexts nested deeper than `max_depth`
    pub fn check_depth(&self, max_depth: u32) -> Result<()> {
        if self.depth > max_depth {
            return Err(ConclaveError::Validation(format!(
                "dispatch depth {} exceeds ceiling {} (parent: {})",
                self.depth,
                max_depth,
                self.parent_orchestrator.as_deref().unwrap_or("<root>")
            )));
        }
        Ok(())
    }
}
