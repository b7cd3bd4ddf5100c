//! Backward-compatible model payload decoding.
//!
//! A model payload is either a legacy bare mapping (model id → model) or an
//! envelope carrying any subset of `my_id`/`id`, `gene_time`/`generation_time`,
//! `models` and `model_id`. Each field resolves on its own:
//!
//! | field           | when absent                                      |
//! |-----------------|--------------------------------------------------|
//! | component id    | freshly generated component identity             |
//! | generation time | now                                              |
//! | models          | the whole input mapping, unchanged               |
//! | model set id    | `generate_model_set_identity(agent, id, time)`   |
//!
//! A present field of the wrong JSON type is treated as absent.

use serde_json::Value;
use tracing::warn;

use super::{CodecError, ModelMap};
use crate::identity::{
    component_identity_from, generate_component_identity, generate_model_set_identity, unix_time, ComponentId, ComponentType,
    FallbackFingerprint, MacAddressFingerprint, ModelSetId, StaticFingerprint,
};

const ID_KEYS: [&str; 2] = ["my_id", "id"];
const TIME_KEYS: [&str; 2] = ["gene_time", "generation_time"];
const MODELS_KEY: &str = "models";
const MODEL_ID_KEY: &str = "model_id";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelPayload {
    pub component_id: ComponentId,
    pub generation_time: f64,
    pub models: ModelMap,
    pub model_id: ModelSetId,
}

/// Envelope fields as found in the input, each independently optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadFields {
    pub component_id: Option<ComponentId>,
    pub generation_time: Option<f64>,
    pub models: Option<ModelMap>,
    pub model_id: Option<ModelSetId>,
}

/// Supplies values for absent fields.
pub trait PayloadDefaults {
    fn component_id(&self) -> ComponentId;
    fn now(&self) -> f64;
}

/// Wall clock plus the machine fingerprint (static fallback when unavailable).
#[derive(Debug, Clone)]
pub struct LiveDefaults { pub fallback_fingerprint: String }

impl Default for LiveDefaults { fn default() -> Self { Self { fallback_fingerprint: "localhost".into() } } }

impl PayloadDefaults for LiveDefaults {
    fn component_id(&self) -> ComponentId {
        let source = FallbackFingerprint { primary: MacAddressFingerprint, fallback: StaticFingerprint(self.fallback_fingerprint.clone()) };
        generate_component_identity(&source).unwrap_or_else(|_| component_identity_from(&self.fallback_fingerprint, unix_time()))
    }
    fn now(&self) -> f64 { unix_time() }
}

fn first_str(map: &ModelMap, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match map.get(*k) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => { warn!(key = *k, value = %other, "ignoring non-string payload field"); None }
        None => None,
    })
}

impl PayloadFields {
    pub fn extract(map: &ModelMap) -> Self {
        let generation_time = TIME_KEYS.iter().find_map(|k| map.get(*k).and_then(Value::as_f64));
        let models = match map.get(MODELS_KEY) {
            Some(Value::Object(m)) => Some(m.clone()),
            _ => None,
        };
        Self {
            component_id: first_str(map, &ID_KEYS).map(ComponentId),
            generation_time,
            models,
            model_id: first_str(map, &[MODEL_ID_KEY]).map(ModelSetId),
        }
    }

    /// `source` is the original mapping, used verbatim when `models` is absent.
    pub fn resolve(self, source: &ModelMap, defaults: &dyn PayloadDefaults) -> ModelPayload {
        let component_id = self.component_id.unwrap_or_else(|| defaults.component_id());
        let generation_time = self.generation_time.unwrap_or_else(|| defaults.now());
        let models = self.models.unwrap_or_else(|| source.clone());
        let model_id = self.model_id.unwrap_or_else(|| generate_model_set_identity(ComponentType::Agent, &component_id, generation_time));
        ModelPayload { component_id, generation_time, models, model_id }
    }
}

pub fn decode_model_payload_with(value: &Value, defaults: &dyn PayloadDefaults) -> Result<ModelPayload, CodecError> {
    let map = value.as_object().ok_or(CodecError::NotAMapping)?;
    Ok(PayloadFields::extract(map).resolve(map, defaults))
}

pub fn decode_model_payload(value: &Value) -> Result<ModelPayload, CodecError> {
    decode_model_payload_with(value, &LiveDefaults::default())
}

/// Structured envelope form, readable by [`decode_model_payload`] without synthesis.
pub fn encode_model_payload(payload: &ModelPayload) -> Value {
    let mut map = ModelMap::new();
    map.insert(ID_KEYS[0].into(), Value::String(payload.component_id.0.clone()));
    map.insert(TIME_KEYS[0].into(), Value::from(payload.generation_time));
    map.insert(MODELS_KEY.into(), Value::Object(payload.models.clone()));
    map.insert(MODEL_ID_KEY.into(), Value::String(payload.model_id.0.clone()));
    Value::Object(map)
}
