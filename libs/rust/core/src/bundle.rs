//! Durable model bundles.
//!
//! A bundle file is one JSON object: every model id maps to its payload, and the
//! reserved `performance` entry maps model ids to scores. Saving overwrites the
//! whole file. There is no inter-process locking; one writer per path.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const PERFORMANCE_KEY: &str = "performance";

pub type PerformanceMap = BTreeMap<String, f64>;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("io error on {path}: {source}")] Io { path: PathBuf, source: std::io::Error },
    #[error("serde error: {0}")] Serde(#[from] serde_json::Error),
    #[error("bundle file {0} does not contain a mapping")] NotAMapping(PathBuf),
    #[error("model id {0:?} collides with the reserved performance entry")] ReservedKey(String),
}

pub fn bundle_path(dir: impl AsRef<Path>, name: &str) -> PathBuf { dir.as_ref().join(name) }

pub fn save_model_file<M: Serialize>(models: &BTreeMap<String, M>, dir: impl AsRef<Path>, name: &str, performance: &PerformanceMap) -> Result<(), BundleError> {
    if models.contains_key(PERFORMANCE_KEY) { return Err(BundleError::ReservedKey(PERFORMANCE_KEY.into())); }
    let path = bundle_path(dir, name);
    let mut map = Map::new();
    for (id, model) in models { map.insert(id.clone(), serde_json::to_value(model)?); }
    map.insert(PERFORMANCE_KEY.into(), serde_json::to_value(performance)?);
    let bytes = serde_json::to_vec(&Value::Object(map))?;
    std::fs::write(&path, bytes).map_err(|source| BundleError::Io { path: path.clone(), source })?;
    debug!(path = %path.display(), models = models.len(), "model bundle saved");
    Ok(())
}

/// Returns the models with the performance entry split out. Files written before
/// performance tracking existed yield an empty performance map.
pub fn load_model_file<M: DeserializeOwned>(dir: impl AsRef<Path>, name: &str) -> Result<(BTreeMap<String, M>, PerformanceMap), BundleError> {
    let path = bundle_path(dir, name);
    let bytes = std::fs::read(&path).map_err(|source| BundleError::Io { path: path.clone(), source })?;
    let Value::Object(mut map) = serde_json::from_slice::<Value>(&bytes)? else { return Err(BundleError::NotAMapping(path)) };
    let performance = match map.remove(PERFORMANCE_KEY) {
        Some(v) => serde_json::from_value(v)?,
        None => { warn!(path = %path.display(), "bundle has no performance entry"); PerformanceMap::new() }
    };
    let mut models = BTreeMap::new();
    for (id, v) in map { models.insert(id, serde_json::from_value(v)?); }
    Ok((models, performance))
}
