use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::guardrails::GuardrailsConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl ServiceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Credits granted to every new account.
    #[serde(default = "default_initial_credits")]
    pub initial_credits: i64,
    /// Per-model credit cost; models absent here cost the default of 1.
    #[serde(default)]
    pub model_costs: BTreeMap<String, i64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            initial_credits: default_initial_credits(),
            model_costs: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier clients request this model by.
    pub id: String,
    pub base_url: String,
    /// Name the backend knows the model by, when it differs from `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_model: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("tallygate.sqlite")
}

fn default_initial_credits() -> i64 {
    100
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_generation_timeout_secs() -> u64 {
    60
}
