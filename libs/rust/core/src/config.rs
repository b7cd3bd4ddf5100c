//! Component configuration.
//!
//! Each component reads `setups/config_{type}.json` relative to the working
//! directory once at startup. The document is a free-form mapping; keys are
//! defined by the consumer. Environment variables `FL__<KEY>` override file values.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::identity::ComponentType;
use crate::resilience::PollConfig;
use crate::state::StateStore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")] Config(#[from] config::ConfigError),
    #[error("io error: {0}")] Io(#[from] std::io::Error),
}

pub fn config_path_in(root: impl AsRef<Path>, component: ComponentType) -> PathBuf {
    root.as_ref().join("setups").join(format!("config_{component}.json"))
}

pub fn config_path(component: ComponentType) -> Result<PathBuf, ConfigError> {
    Ok(config_path_in(std::env::current_dir()?, component))
}

pub fn load_config(path: &Path) -> Result<ComponentConfig, ConfigError> {
    let cfg = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Json).required(true))
        .add_source(config::Environment::with_prefix("FL").separator("__"))
        .build()?;
    let cfg: ComponentConfig = cfg.try_deserialize()?;
    tracing::info!(path = %path.display(), keys = cfg.entries.len(), "configuration loaded");
    Ok(cfg)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ComponentConfig {
    entries: HashMap<String, Value>,
}

impl ComponentConfig {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(m) => Self { entries: m.into_iter().collect() },
            _ => Self::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> { self.entries.get(key) }

    /// Sets `key` only when neither the file nor the environment provided it.
    pub fn set_default(&mut self, key: &str, value: Value) { self.entries.entry(key.to_string()).or_insert(value); }

    pub fn get_str(&self, key: &str) -> Option<&str> { self.get(key).and_then(Value::as_str) }

    // Environment overrides always arrive as strings, so numeric getters accept both forms.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? { Value::String(s) => s.trim().parse().ok(), v => v.as_u64() }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? { Value::String(s) => s.trim().parse().ok(), v => v.as_f64() }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() { "true" | "1" | "yes" => Some(true), "false" | "0" | "no" => Some(false), _ => None },
            Value::Number(n) => n.as_u64().map(|v| v != 0),
            _ => None,
        }
    }

    /// State store described by `state_dir`, `state_file`, `state_poll_ms` and `state_read_timeout_ms`.
    pub fn state_store(&self) -> StateStore {
        let dir = self.get_str("state_dir").unwrap_or("./state");
        let name = self.get_str("state_file").unwrap_or("state");
        StateStore::new(dir, name).with_poll(self.state_poll())
    }

    pub fn state_poll(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.get_u64("state_poll_ms").unwrap_or(10)),
            timeout: Duration::from_millis(self.get_u64("state_read_timeout_ms").unwrap_or(5_000)),
        }
    }
}
