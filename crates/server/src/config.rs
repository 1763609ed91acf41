use std::path::{Path, PathBuf};

use anyhow::Result;
use ratelab_common::AppConfig;
use tracing::{info, warn};

/// Resolved configuration together with where it came from.
pub struct ServerConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl ServerConfig {
    /// Load `path`, falling back to the built-in defaults (which include the
    /// six reference policies) when the file does not exist.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            warn!(path = path, "configuration file not found, using defaults");
            let config = AppConfig::default();
            config.validate()?;
            return Ok(Self {
                config,
                source: None,
            });
        }

        info!(path = path, "loading configuration");
        let config = AppConfig::load(path)?;
        Ok(Self {
            config,
            source: Some(PathBuf::from(path)),
        })
    }
}
