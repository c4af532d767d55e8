//! Tracing subscriber setup and span helpers

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::context::OrchestrationContext;
use crate::orchestrator::OrchestratorDescriptor;

static INIT: Once = Once::new();

/// Log output format
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs
    Json,
    /// Human readable logs
    #[default]
    Pretty,
}

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG` and falls back to `info`. Calling this more than once is
/// a no-op, so tests and embedders may both call it.
pub fn init_tracing(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false))
                .try_init(),
        };

        // Another subscriber may already own the global slot.
        let _ = result;
    });
}

/// Span wrapping a single facade dispatch
pub fn orchestration_span(descriptor: &OrchestratorDescriptor, ctx: &OrchestrationContext) -> Span {
    tracing::info_span!(
        "orchestrate",
        orchestrator = %descriptor.name,
        layer = ?descriptor.layer,
        kind = ?descriptor.orchestration_type,
        tenant_id = %ctx.tenant_id,
        request_id = %ctx.request_id,
        trace_id = ctx.trace_id.as_deref().unwrap_or(""),
        depth = ctx.depth,
    )
}
