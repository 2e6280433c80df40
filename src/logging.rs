use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::CatalogConfig;
use crate::error::{CatalogError, Result};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &CatalogConfig) -> Result<()> {
    let env_filter = build_env_filter(config)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_timer(fmt::time::SystemTime),
        )
        .try_init()
        .map_err(|err| CatalogError::Configuration(format!("cannot install logger: {err}")))?;

    Ok(())
}

fn build_env_filter(config: &CatalogConfig) -> Result<EnvFilter> {
    if let Ok(directive) = std::env::var(EnvFilter::DEFAULT_ENV) {
        if !directive.trim().is_empty() {
            return EnvFilter::try_new(&directive).map_err(|err| {
                CatalogError::Configuration(format!("invalid RUST_LOG '{directive}': {err}"))
            });
        }
    }
    let directive = config.log_level.as_deref().unwrap_or("info");
    EnvFilter::try_new(directive).map_err(|err| {
        CatalogError::Configuration(format!("invalid log level '{directive}': {err}"))
    })
}
