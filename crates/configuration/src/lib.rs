use crate::error::ConfigError;

// Declare the modules that make up this crate.
pub mod error;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use settings::{
    AlertingSettings, BackendKind, CacheSettings, Config, DatabaseSettings, LoggingSettings,
    PerformanceSettings, RetrySettings, TelegramConfig,
};

/// Prefix for environment overrides, e.g. `STRATA__DATABASE__URL`.
pub const ENV_PREFIX: &str = "STRATA";

/// Loads the application configuration.
///
/// The TOML file at `path` is optional; environment variables prefixed with
/// `STRATA__` are layered on top, and every missing key falls back to the
/// defaults in [`settings`]. The result is validated before it is returned.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config = builder.try_deserialize::<Config>()?;
    config.validate()?;

    tracing::debug!(backend = %config.database.backend, "Configuration loaded");
    Ok(config)
}

/// Parses a configuration from an in-memory TOML string, without environment
/// overrides.
pub fn load_config_from_str(toml: &str) -> Result<Config, ConfigError> {
    let config = config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?
        .try_deserialize::<Config>()?;
    config.validate()?;
    Ok(config)
}
