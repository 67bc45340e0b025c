//! Configuration loading with environment variable overrides.

use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::settings::ManifoldConfig;

/// Loads [`ManifoldConfig`] from a YAML file and/or `MANIFOLD_*` environment
/// variables.
pub struct ConfigLoader {
    prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            prefix: "MANIFOLD".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load from a YAML file, apply env overrides, validate.
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ManifoldConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ManifoldConfig = serde_yaml::from_str(&content)?;
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Defaults plus env overrides only.
    pub fn from_env(&self) -> ConfigResult<ManifoldConfig> {
        let mut config = ManifoldConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Fallback chain: explicit file if given, else env-only.
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ManifoldConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut ManifoldConfig) -> ConfigResult<()> {
        if let Ok(host) = self.get_env_var("HOST") {
            config.server.host = host;
        }
        if let Ok(port) = self.get_env_var("PORT") {
            config.server.port = port
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid PORT: {}", e)))?;
        }
        if let Ok(base_path) = self.get_env_var("BASE_PATH") {
            config.server.base_path = base_path;
        }

        let flags = &mut config.settings.flags;
        if let Ok(enabled) = self.get_env_var("SMART_ROUTING_ENABLED") {
            flags.smart_routing.enabled = enabled
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid SMART_ROUTING_ENABLED: {}", e)))?;
        }
        if let Ok(model) = self.get_env_var("EMBED_MODEL") {
            flags.smart_routing.embed_model = model;
        }
        if let Ok(endpoint) = self.get_env_var("EMBED_ENDPOINT") {
            flags.smart_routing.endpoint = endpoint;
        }
        if let Ok(key) = self.get_env_var("EMBED_API_KEY") {
            flags.smart_routing.api_key = Some(key);
        }
        if let Ok(allow) = self.get_env_var("ALLOW_GLOBAL") {
            flags.routing.allow_global = allow
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid ALLOW_GLOBAL: {}", e)))?;
        }
        if let Ok(seconds) = self.get_env_var("CALL_TIMEOUT_SECONDS") {
            let seconds: u64 = seconds
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid CALL_TIMEOUT_SECONDS: {}", e)))?;
            flags.call_timeout = std::time::Duration::from_secs(seconds);
        }

        Ok(())
    }

    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
