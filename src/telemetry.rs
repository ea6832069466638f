use conduit_core::EngineConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter when set.
pub fn init(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;

    if config.log_json {
        fmt().json().with_env_filter(filter).try_init()?;
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()?;
    }
    Ok(())
}
