//! Log subscriber setup.

use crate::config::LoggingConfig;
use crate::error::{DockhandError, DockhandResult};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> DockhandResult<()> {
    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_format {
        registry
            .with(fmt::layer().json().with_target(config.include_targets))
            .try_init()
    } else if config.include_timestamps {
        registry
            .with(
                fmt::layer()
                    .with_target(config.include_targets)
                    .with_ansi(config.colored),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .without_time()
                    .with_target(config.include_targets)
                    .with_ansi(config.colored),
            )
            .try_init()
    };

    result.map_err(|e| DockhandError::config(format!("cannot install log subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init(&LoggingConfig::default());
        let err = init(&LoggingConfig::default()).unwrap_err();
        assert!(err.to_string().contains("log subscriber"));
    }
}
