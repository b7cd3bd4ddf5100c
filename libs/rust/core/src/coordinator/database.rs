//! Database-side handling: every pushed model set becomes one bundle file
//! `{model_id}.json` under the storage directory, tracked by `index.json`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{ProtocolError, RoundId};
use crate::bundle::{load_model_file, save_model_file, BundleError, PerformanceMap, PERFORMANCE_KEY};
use crate::identity::{ComponentId, ModelSetId};
use crate::messages::{DbMessage, DbPush, ModelMap, ModelType};

pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_id: ModelSetId,
    pub component_id: ComponentId,
    pub model_type: ModelType,
    pub round: RoundId,
    pub generation_time: f64,
    #[serde(default)]
    pub request_ids: Vec<ComponentId>,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DbReply {
    Ack { model_id: ModelSetId },
    List(Vec<ModelRecord>),
    Models { model_id: ModelSetId, models: ModelMap, performance: PerformanceMap },
    NotFound(ModelSetId),
}

pub struct DatabaseHandler {
    dir: PathBuf,
    index: RwLock<Vec<ModelRecord>>,
}

impl DatabaseHandler {
    /// Opens (or creates) the storage directory and loads an existing index.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| BundleError::Io { path: dir.clone(), source })?;
        let index_path = dir.join(INDEX_FILE);
        let index: Vec<ModelRecord> = match std::fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(BundleError::from)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(BundleError::Io { path: index_path, source }.into()),
        };
        Ok(Self { dir, index: RwLock::new(index) })
    }

    pub fn dir(&self) -> &Path { &self.dir }
    pub fn records(&self) -> Vec<ModelRecord> { self.index.read().clone() }

    pub fn handle(&self, msg: DbMessage) -> Result<DbReply, ProtocolError> {
        match msg {
            DbMessage::Push(p) => self.push(p),
            DbMessage::GetList(q) => {
                let list: Vec<ModelRecord> = self.index.read().iter().filter(|r| r.model_type == q.model_type).cloned().collect();
                Ok(DbReply::List(list))
            }
            DbMessage::GetModels(q) => {
                let file = self.index.read().iter().find(|r| r.model_id == q.model_id && r.model_type == q.model_type).map(|r| r.file.clone());
                let Some(file) = file else {
                    warn!(requester = %q.component_id, model_id = %q.model_id, "requested model set not stored");
                    return Ok(DbReply::NotFound(q.model_id));
                };
                let (models, performance) = load_model_file::<Value>(&self.dir, &file)?;
                Ok(DbReply::Models { model_id: q.model_id, models: models.into_iter().collect(), performance })
            }
        }
    }

    fn push(&self, p: DbPush) -> Result<DbReply, ProtocolError> {
        let performance: PerformanceMap = p.meta_data.get(PERFORMANCE_KEY).cloned().and_then(|v| serde_json::from_value(v).ok()).unwrap_or_default();
        let models: BTreeMap<String, Value> = p.models.into_iter().collect();
        let file = bundle_file_name(&p.model_id)?;
        save_model_file(&models, &self.dir, &file, &performance)?;

        let record = ModelRecord { model_id: p.model_id.clone(), component_id: p.component_id, model_type: p.model_type, round: p.round, generation_time: p.generation_time, request_ids: p.request_ids, file };
        let mut index = self.index.write();
        index.retain(|r| r.model_id != record.model_id);
        info!(model_id = %record.model_id, component = %record.component_id, model_type = ?record.model_type, round = record.round, "model set stored");
        index.push(record);
        let index_path = self.dir.join(INDEX_FILE);
        let bytes = serde_json::to_vec_pretty(&*index).map_err(BundleError::from)?;
        std::fs::write(&index_path, bytes).map_err(|source| BundleError::Io { path: index_path, source })?;
        Ok(DbReply::Ack { model_id: p.model_id })
    }
}

/// Model ids arrive off the wire; only plain names stay inside the storage directory.
fn bundle_file_name(model_id: &ModelSetId) -> Result<String, ProtocolError> {
    let id = model_id.0.as_str();
    let plain = !id.is_empty() && id != "." && id != ".." && !id.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if !plain {
        warn!(model_id = %model_id, "rejecting model id that is not a plain file name");
        return Err(ProtocolError::InvalidModelId(model_id.clone()));
    }
    Ok(format!("{id}.json"))
}
