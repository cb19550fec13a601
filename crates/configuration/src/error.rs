use thiserror::Error;

/// Failures while assembling the runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read, or a value did not fit its typed setting.
    #[error("Failed to load configuration (file or STRATA__ environment): {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Invalid setting `{key}`: {reason}")]
    ValidationError { key: &'static str, reason: &'static str },
}
