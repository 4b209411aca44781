//! Observability infrastructure for Hangar.
//!
//! Structured logging with consistent spans for reconciliation and lock
//! operations.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops. Levels are
/// controlled by `RUST_LOG` (e.g. `info`, `hangar_coord=debug`).
///
/// ```rust
/// use hangar_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        // Another subscriber may already be installed by the embedding process.
        let _ = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
    });
}

/// Creates a span for handling one watch event of a resource.
#[must_use]
pub fn reconcile_span(resource: &str, state: &str, owner: &str) -> Span {
    tracing::info_span!("reconcile", resource = resource, state = state, owner = owner)
}

/// Creates a span for a deployment lock operation.
#[must_use]
pub fn lock_span(operation: &str, deployment: &str) -> Span {
    tracing::info_span!("deployment_lock", op = operation, deployment = deployment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_span_helpers_create_spans() {
        let span = reconcile_span("g/t/r1", "in_queue", "node-a");
        let _guard = span.enter();
        tracing::info!("reconcile message");

        let span = lock_span("lock", "i1");
        let _guard = span.enter();
        tracing::info!("lock message");
    }
}
