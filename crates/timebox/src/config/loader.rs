//! Configuration file loading for timebox
//!
//! Handles loading and parsing configuration files using the config crate.
//! File values are layered under `TIMEBOX_*` environment overrides.

use std::path::Path;

use config::builder::DefaultState;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX};

impl Config {
    /// Load configuration from a file, applying environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder().add_source(File::from(path.as_ref()));
        Self::load(builder, environment())
    }

    /// Load configuration from built-in defaults and environment overrides only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(ConfigBuilder::builder(), environment())
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn load(
        builder: config::builder::ConfigBuilder<DefaultState>,
        env: Environment,
    ) -> Result<Self, ConfigError> {
        let config = builder.add_source(env).build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        self.limits()?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).try_parsing(true)
}
