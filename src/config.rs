//! Layered configuration: defaults, optional TOML file, then `RELOAD_*`
//! environment variables (`.env` is honoured).
//!
//! Nested keys use a double underscore, e.g. `RELOAD_RPC__PRIMARY_URL` or
//! `RELOAD_LIMITS__BATCH_SIZE`.

use crate::pipeline::types::PipelineConfig;
use anyhow::{Context, Result};
use ::config::{Config, Environment, File, FileFormat};
use std::path::Path;
use tracing::{debug, info};

pub type ReloadConfig = PipelineConfig;

pub const ENV_PREFIX: &str = "RELOAD";

impl PipelineConfig {
    /// Load and validate the configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", env_file.display());
        }

        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: PipelineConfig = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }
}
