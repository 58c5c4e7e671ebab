use crate::model::ProviderId;
use quill_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How a key pool walks its credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    #[default]
    Sequential,
    LoadBalancer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// User configuration loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub rotation: RotationMode,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location: `$XDG_CONFIG_HOME/quill/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quill")
            .join("config.toml")
    }

    /// Load the config file, falling back to defaults when it is absent.
    pub fn load(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            debug!("no config file at {}, using defaults", self.path.display());
            return Ok(AppConfig::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", self.path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", self.path.display())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AppConfig {
    /// All configured secrets for a provider: config-file keys first, then
    /// the environment variable if set. Order matters for sequential
    /// rotation, so duplicates from the environment are dropped.
    pub fn keys_for(&self, provider: ProviderId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .providers
            .get(provider.as_str())
            .map(|p| p.keys.clone())
            .unwrap_or_default();

        if let Ok(env_key) = std::env::var(provider.env_key()) {
            let env_key = env_key.trim().to_string();
            if !env_key.is_empty() && !keys.contains(&env_key) {
                keys.push(env_key);
            }
        }

        if keys.is_empty() && provider.requires_api_key() {
            warn!(provider = provider.as_str(), "no API keys configured");
        }
        keys
    }

    /// Configured base URL override, or the provider default.
    pub fn base_url(&self, provider: ProviderId) -> String {
        self.providers
            .get(provider.as_str())
            .and_then(|p| p.base_url.clone())
            .unwrap_or_else(|| provider.default_base_url().to_string())
    }
}
