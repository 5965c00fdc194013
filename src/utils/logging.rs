use anyhow::{Context, Result};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Target used by `AuditLogger`; printed with its target so audit lines stand out.
pub const AUDIT_TARGET: &str = "audit";

/// Install the global subscriber. `RUST_LOG` takes precedence over `default_directive`.
pub fn init(default_directive: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let app_layer = fmt::layer()
        .with_target(false)
        .with_filter(filter_fn(|meta| meta.target() != AUDIT_TARGET));
    let audit_layer = fmt::layer()
        .with_target(true)
        .with_filter(filter_fn(|meta| meta.target() == AUDIT_TARGET));

    tracing_subscriber::registry()
        .with(filter)
        .with(app_layer)
        .with(audit_layer)
        .try_init()
        .context("installing tracing subscriber")
}
