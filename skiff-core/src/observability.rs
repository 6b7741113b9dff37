//! Logging infrastructure.
//!
//! One `init()` call at binary startup wires a `tracing` subscriber with an
//! env-filter; everything else in the workspace logs through `tracing`
//! macros.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Must be called once at application startup. The filter defaults to INFO
/// and honors `RUST_LOG`.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;
    Ok(())
}
