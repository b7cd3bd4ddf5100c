//! Aggregation strategies.
//!
//! Model payloads are opaque JSON; FedAvg only understands numbers and
//! (nested) arrays/objects of numbers with matching shapes.

use serde_json::{Number, Value};
use thiserror::Error;

use crate::messages::{MetaData, ModelMap};

pub const SAMPLE_COUNT_KEY: &str = "num_samples";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AggregationError {
    #[error("nothing to aggregate")] Empty,
    #[error("model {model} has mismatched shapes at {path}")] ShapeMismatch { model: String, path: String },
    #[error("model {model} has a non-numeric value at {path}")] NotNumeric { model: String, path: String },
}

pub struct WeightedModels<'a> {
    pub models: &'a ModelMap,
    pub weight: f64,
}

impl<'a> WeightedModels<'a> {
    /// Weight comes from `meta_data.num_samples`, defaulting to 1.
    pub fn from_meta(models: &'a ModelMap, meta: &MetaData) -> Self {
        let weight = meta.get(SAMPLE_COUNT_KEY).and_then(Value::as_f64).filter(|w| *w >= 0.0).unwrap_or(1.0);
        Self { models, weight }
    }
}

pub trait Aggregator: Send + Sync {
    fn aggregate(&self, inputs: &[WeightedModels<'_>]) -> Result<ModelMap, AggregationError>;
}

/// Sample-count-weighted element-wise mean. Only model ids present in every
/// input are aggregated.
#[derive(Debug, Default, Clone, Copy)]
pub struct FedAvg;

impl Aggregator for FedAvg {
    fn aggregate(&self, inputs: &[WeightedModels<'_>]) -> Result<ModelMap, AggregationError> {
        let first = inputs.first().ok_or(AggregationError::Empty)?;
        let total: f64 = inputs.iter().map(|i| i.weight).sum();
        let weights: Vec<f64> = if total > 0.0 {
            inputs.iter().map(|i| i.weight / total).collect()
        } else {
            vec![1.0 / inputs.len() as f64; inputs.len()]
        };
        let mut out = ModelMap::new();
        for model_id in first.models.keys() {
            let values: Option<Vec<&Value>> = inputs.iter().map(|i| i.models.get(model_id)).collect();
            let Some(values) = values else {
                tracing::debug!(model_id, "model missing from some inputs, skipped");
                continue;
            };
            out.insert(model_id.clone(), weighted_mean(model_id, "$", &values, &weights)?);
        }
        Ok(out)
    }
}

fn weighted_mean(model: &str, path: &str, values: &[&Value], weights: &[f64]) -> Result<Value, AggregationError> {
    match values[0] {
        Value::Number(_) => {
            let mut acc = 0.0;
            for (v, w) in values.iter().zip(weights) {
                let x = v.as_f64().ok_or_else(|| AggregationError::ShapeMismatch { model: model.into(), path: path.into() })?;
                acc += x * w;
            }
            Number::from_f64(acc).map(Value::Number).ok_or_else(|| AggregationError::NotNumeric { model: model.into(), path: path.into() })
        }
        Value::Array(first) => {
            let mut layer = Vec::with_capacity(first.len());
            for i in 0..first.len() {
                let mut column = Vec::with_capacity(values.len());
                for v in values {
                    match v { Value::Array(a) if a.len() == first.len() => column.push(&a[i]), _ => return Err(AggregationError::ShapeMismatch { model: model.into(), path: path.into() }) }
                }
                layer.push(weighted_mean(model, &format!("{path}[{i}]"), &column, weights)?);
            }
            Ok(Value::Array(layer))
        }
        Value::Object(first) => {
            let mut obj = ModelMap::new();
            for key in first.keys() {
                let mut column = Vec::with_capacity(values.len());
                for v in values {
                    match v.get(key) { Some(x) => column.push(x), None => return Err(AggregationError::ShapeMismatch { model: model.into(), path: format!("{path}.{key}") }) }
                }
                obj.insert(key.clone(), weighted_mean(model, &format!("{path}.{key}"), &column, weights)?);
            }
            Ok(Value::Object(obj))
        }
        _ => Err(AggregationError::NotNumeric { model: model.into(), path: path.into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> ModelMap { v.as_object().unwrap().clone() }

    #[test]
    fn fedavg_weights_by_sample_count() {
        let a = map(json!({"layer": [0.1, 0.2, 0.3]}));
        let b = map(json!({"layer": [0.2, 0.4, 0.6]}));
        let out = FedAvg.aggregate(&[WeightedModels { models: &a, weight: 10.0 }, WeightedModels { models: &b, weight: 30.0 }]).unwrap();
        // (0.1*10 + 0.2*30)/40 = 0.175
        let first = out["layer"][0].as_f64().unwrap();
        assert!((first - 0.175).abs() < 1e-9);
    }

    #[test]
    fn nested_structures_and_partial_keys() {
        let a = map(json!({"w": {"k": [[1.0, 3.0]], "b": 2.0}, "only_a": 1}));
        let b = map(json!({"w": {"k": [[3.0, 5.0]], "b": 4.0}}));
        let out = FedAvg.aggregate(&[WeightedModels { models: &a, weight: 1.0 }, WeightedModels { models: &b, weight: 1.0 }]).unwrap();
        assert_eq!(out["w"], json!({"k": [[2.0, 4.0]], "b": 3.0}));
        assert!(!out.contains_key("only_a"));
    }

    #[test]
    fn zero_weights_fall_back_to_plain_mean() {
        let a = map(json!({"m": 2.0}));
        let b = map(json!({"m": 4.0}));
        let out = FedAvg.aggregate(&[WeightedModels { models: &a, weight: 0.0 }, WeightedModels { models: &b, weight: 0.0 }]).unwrap();
        assert_eq!(out["m"], json!(3.0));
    }

    fn w(models: &ModelMap) -> WeightedModels<'_> { WeightedModels { models, weight: 1.0 } }

    #[test]
    fn shape_and_type_errors() {
        let a = map(json!({"m": [1.0, 2.0]}));
        let b = map(json!({"m": [1.0]}));
        let c = map(json!({"m": "blob"}));
        assert!(matches!(FedAvg.aggregate(&[w(&a), w(&b)]), Err(AggregationError::ShapeMismatch { .. })));
        assert!(matches!(FedAvg.aggregate(&[w(&c), w(&c)]), Err(AggregationError::NotNumeric { .. })));
        assert_eq!(FedAvg.aggregate(&[]).unwrap_err(), AggregationError::Empty);
    }

    #[test]
    fn weight_from_meta() {
        let m = ModelMap::new();
        let meta = map(json!({"num_samples": 25}));
        assert_eq!(WeightedModels::from_meta(&m, &meta).weight, 25.0);
        assert_eq!(WeightedModels::from_meta(&m, &MetaData::new()).weight, 1.0);
    }
}
