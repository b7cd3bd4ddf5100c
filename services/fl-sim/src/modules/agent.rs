//! Agent Module - trains on the latest global models and reports back.
use anyhow::Result;
use fl_core::coordinator::AgentCoordinator;
use fl_core::messages::{AggregatorMessage, MetaData, ModelMap};
use fl_core::ClientState;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Frame;

pub struct AgentModule {
    coordinator: AgentCoordinator,
    /// Added to every weight on each local training pass.
    bias: f64,
    samples: u64,
    init_flag: bool,
    rounds: u64,
}

impl AgentModule {
    pub fn new(coordinator: AgentCoordinator, bias: f64, samples: u64, init_flag: bool, rounds: u64) -> Self {
        Self { coordinator, bias, samples, init_flag, rounds }
    }

    fn meta(&self) -> MetaData {
        let mut meta = MetaData::new();
        meta.insert("num_samples".into(), json!(self.samples));
        meta
    }

    fn train(&self, global: &ModelMap) -> ModelMap {
        let mut local = if global.is_empty() { initial_models() } else { global.clone() };
        for v in local.values_mut() { shift(v, self.bias); }
        local
    }

    /// Participates, then trains and sends an update for every round until
    /// `rounds` global distributions have been received.
    pub async fn run(self, to_aggregator: mpsc::Sender<Frame>, mut inbox: mpsc::Receiver<Frame>) -> Result<AgentCoordinator> {
        let id = self.coordinator.id().clone();
        let initial = self.train(&ModelMap::new());
        let participate = self.coordinator.participate(initial, self.init_flag, false, "7000", self.meta())?;
        to_aggregator.send(participate.encode()?).await?;

        let mut completed = 0u64;
        while let Some(frame) = inbox.recv().await {
            let msg = match AggregatorMessage::decode(&frame) {
                Ok(m) => m,
                Err(e) => { warn!(agent = %id, error = %e, "dropping undecodable frame"); continue; }
            };
            let global = match self.coordinator.handle(msg)? {
                Some(ClientState::Training) => self.coordinator.global_models(),
                Some(ClientState::GmReady) => {
                    completed += 1;
                    info!(agent = %id, round = self.coordinator.round(), completed, "global models received");
                    if completed >= self.rounds { break; }
                    self.coordinator.resume_training()?
                }
                other => { debug!(agent = %id, state = ?other, "no local work"); continue; }
            };
            let update = self.coordinator.finish_training(self.train(&global), self.meta())?;
            to_aggregator.send(update.encode()?).await?;
        }
        Ok(self.coordinator)
    }
}

fn initial_models() -> ModelMap {
    let mut m = ModelMap::new();
    m.insert("dense".into(), json!([[0.0, 0.0], [0.0, 0.0]]));
    m.insert("bias".into(), json!([0.0, 0.0]));
    m
}

fn shift(v: &mut Value, by: f64) {
    if let Some(x) = v.as_f64() { *v = json!(x + by); return; }
    match v {
        Value::Array(items) => items.iter_mut().for_each(|i| shift(i, by)),
        Value::Object(map) => map.values_mut().for_each(|i| shift(i, by)),
        _ => {}
    }
}
