//! Logger setup from [`LoggingConfig`].

use crate::config::LoggingConfig;
use crate::error::{ConfigError, Result};

use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use std::fs::OpenOptions;

/// Read a level name such as `info` or `TRACE`.
pub fn parse_level(
    field: &'static str,
    level: &str,
) -> std::result::Result<LevelFilter, ConfigError> {
    level.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field,
        reason: "must be one of off, error, warn, info, debug, trace",
    })
}

/// Install the global logger.
///
/// `RUST_LOG` still wins over the configured level so a single module can
/// be turned up without editing the file. `override_level` comes from the
/// command line and wins over both.
pub fn init(config: &LoggingConfig, override_level: Option<&str>) -> Result<()> {
    let level = parse_level("logging.level", &config.level)?;
    let mut builder = Builder::from_env(Env::default().default_filter_or(level.as_str()));
    if let Some(level) = override_level {
        builder.filter_level(parse_level("--log-level", level)?);
    }

    match config.destination.as_str() {
        "" | "stderr" => {
            builder.target(Target::Stderr);
        }
        "stdout" => {
            builder.target(Target::Stdout);
        }
        path => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.target(Target::Pipe(Box::new(file)));
        }
    }

    // A second init (tests, embedding) keeps the first logger.
    let _ = builder.try_init();
    Ok(())
}
