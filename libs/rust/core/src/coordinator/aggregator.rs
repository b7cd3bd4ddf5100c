//! Aggregator-side dispatch.
//!
//! Every agent message yields the messages to send in response. Local models
//! are buffered per agent (latest update wins) until the round threshold is met;
//! then the buffer is aggregated, pushed to the database as cluster models and
//! distributed to every registered agent under the next round number.

use parking_lot::RwLock;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::aggregation::{AggregationError, Aggregator, FedAvg, WeightedModels};
use super::{ProtocolError, RoundId};
use crate::config::ComponentConfig;
use crate::context::ComponentContext;
use crate::identity::{generate_model_set_identity, unix_time, ComponentId, ComponentType, ModelSetId};
use crate::messages::{AgentMessage, AggregatorMessage, DbMessage, DbPush, GlobalModels, MetaData, ModelMap, ModelType, Participate, Update, Welcome};
use crate::metrics::PROTOCOL_METRICS;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    /// Fraction of registered agents whose updates complete a round.
    pub aggregation_threshold: f64,
    /// No round closes before this many agents have participated.
    pub min_agents: usize,
    pub exchange_socket: String,
    pub receive_socket: String,
}

impl Default for AggregatorSettings {
    fn default() -> Self { Self { aggregation_threshold: 1.0, min_agents: 1, exchange_socket: "7890".into(), receive_socket: "4321".into() } }
}

impl AggregatorSettings {
    pub fn from_config(cfg: &ComponentConfig) -> Self {
        let d = Self::default();
        Self {
            aggregation_threshold: cfg.get_f64("aggregation_threshold").filter(|t| *t > 0.0).map(|t| t.min(1.0)).unwrap_or(d.aggregation_threshold),
            min_agents: cfg.get_u64("min_agents").map(|n| n as usize).unwrap_or(d.min_agents),
            exchange_socket: cfg.get_str("exchange_socket").map(str::to_string).unwrap_or(d.exchange_socket),
            receive_socket: cfg.get_str("receive_socket").map(str::to_string).unwrap_or(d.receive_socket),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ToAgent { agent_id: ComponentId, message: AggregatorMessage },
    ToDatabase(DbMessage),
    /// The update was persisted but could not be aggregated; the round stays open
    /// without it and the agent may resend.
    UpdateRejected { agent_id: ComponentId, error: AggregationError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub agent_id: ComponentId,
    pub ip: String,
    pub exchange_socket: String,
    pub similarity_flag: bool,
    pub last_model_id: ModelSetId,
}

struct Buffered { models: ModelMap, meta: MetaData }

struct AggInner {
    round: RoundId,
    agents: BTreeMap<ComponentId, AgentRecord>,
    buffer: BTreeMap<ComponentId, Buffered>,
    global_models: ModelMap,
    global_model_id: Option<ModelSetId>,
}

pub struct AggregatorCoordinator<A: Aggregator = FedAvg> {
    ctx: ComponentContext,
    settings: AggregatorSettings,
    aggregator: A,
    inner: RwLock<AggInner>,
}

impl AggregatorCoordinator<FedAvg> {
    pub fn new(ctx: ComponentContext, settings: AggregatorSettings) -> Self { Self::with_aggregator(ctx, settings, FedAvg) }
}

impl<A: Aggregator> AggregatorCoordinator<A> {
    pub fn with_aggregator(ctx: ComponentContext, settings: AggregatorSettings, aggregator: A) -> Self {
        let inner = AggInner { round: 1, agents: BTreeMap::new(), buffer: BTreeMap::new(), global_models: ModelMap::new(), global_model_id: None };
        Self { ctx, settings, aggregator, inner: RwLock::new(inner) }
    }

    pub fn id(&self) -> &ComponentId { &self.ctx.identity }
    pub fn round(&self) -> RoundId { self.inner.read().round }
    pub fn global_models(&self) -> ModelMap { self.inner.read().global_models.clone() }
    pub fn agents(&self) -> Vec<AgentRecord> { self.inner.read().agents.values().cloned().collect() }
    pub fn buffered(&self) -> usize { self.inner.read().buffer.len() }

    /// Updates needed to close a round with `agents` registered.
    pub fn required_updates(&self, agents: usize) -> usize {
        let agents = agents.max(self.settings.min_agents);
        ((self.settings.aggregation_threshold * agents as f64).ceil() as usize).max(1)
    }

    pub fn handle(&self, msg: AgentMessage) -> Result<Vec<Outbound>, ProtocolError> {
        match msg {
            AgentMessage::Participate(p) => Ok(self.on_participate(p)),
            AgentMessage::Update(u) => self.on_update(u),
        }
    }

    fn on_participate(&self, p: Participate) -> Vec<Outbound> {
        let mut inner = self.inner.write();
        if inner.global_models.is_empty() && p.init_flag {
            inner.global_models = p.local_models.clone();
            inner.global_model_id = Some(p.model_id.clone());
            info!(agent = %p.agent_id, models = p.local_models.len(), "global models seeded from participant");
        }
        let global_model_id = match &inner.global_model_id {
            Some(id) => id.clone(),
            None => {
                let id = generate_model_set_identity(ComponentType::Aggregator, &self.ctx.identity, unix_time());
                inner.global_model_id = Some(id.clone());
                id
            }
        };
        let record = AgentRecord { agent_id: p.agent_id.clone(), ip: p.agent_ip.clone(), exchange_socket: p.exchange_socket.clone(), similarity_flag: p.similarity_flag, last_model_id: p.model_id.clone() };
        if inner.agents.insert(p.agent_id.clone(), record).is_some() {
            debug!(agent = %p.agent_id, "agent participated again, record replaced");
        }
        info!(agent = %p.agent_id, ip = %p.agent_ip, agents = inner.agents.len(), round = inner.round, "agent joined");
        let welcome = Welcome {
            aggregator_id: self.ctx.identity.clone(),
            model_id: global_model_id,
            global_models: inner.global_models.clone(),
            round: inner.round,
            agent_id: p.agent_id.clone(),
            exchange_socket: self.settings.exchange_socket.clone(),
            receive_socket: self.settings.receive_socket.clone(),
        };
        let push = DbPush { component_id: p.agent_id.clone(), round: inner.round, model_type: ModelType::Local, models: p.local_models, model_id: p.model_id, generation_time: p.generation_time, meta_data: p.meta_data, request_ids: Vec::new() };
        vec![Outbound::ToDatabase(DbMessage::Push(push)), Outbound::ToAgent { agent_id: p.agent_id, message: AggregatorMessage::Welcome(welcome) }]
    }

    fn on_update(&self, u: Update) -> Result<Vec<Outbound>, ProtocolError> {
        let mut inner = self.inner.write();
        let Some(record) = inner.agents.get_mut(&u.agent_id) else { return Err(ProtocolError::UnknownAgent(u.agent_id)) };
        record.last_model_id = u.model_id.clone();
        let push = DbPush { component_id: u.agent_id.clone(), round: inner.round, model_type: ModelType::Local, models: u.local_models.clone(), model_id: u.model_id, generation_time: u.generation_time, meta_data: u.meta_data.clone(), request_ids: Vec::new() };
        let mut out = vec![Outbound::ToDatabase(DbMessage::Push(push))];
        let previous = inner.buffer.insert(u.agent_id.clone(), Buffered { models: u.local_models, meta: u.meta_data });
        let required = self.required_updates(inner.agents.len());
        debug!(agent = %u.agent_id, buffered = inner.buffer.len(), required, "local models buffered");
        if inner.buffer.len() >= required {
            match self.complete_round(&mut inner) {
                Ok(round) => out.extend(round),
                Err(ProtocolError::Aggregation(error)) => {
                    match previous {
                        Some(prev) => { inner.buffer.insert(u.agent_id.clone(), prev); }
                        None => { inner.buffer.remove(&u.agent_id); }
                    }
                    PROTOCOL_METRICS.aggregation_failures.add(1, &[]);
                    warn!(agent = %u.agent_id, round = inner.round, error = %error, "update does not aggregate with the buffered models");
                    out.push(Outbound::UpdateRejected { agent_id: u.agent_id, error });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn complete_round(&self, inner: &mut AggInner) -> Result<Vec<Outbound>, ProtocolError> {
        let inputs: Vec<WeightedModels<'_>> = inner.buffer.values().map(|b| WeightedModels::from_meta(&b.models, &b.meta)).collect();
        let global = self.aggregator.aggregate(&inputs)?;
        let request_ids: Vec<ComponentId> = inner.buffer.keys().cloned().collect();
        let generation_time = unix_time();
        let model_id = generate_model_set_identity(ComponentType::Aggregator, &self.ctx.identity, generation_time);
        let finished = inner.round;
        inner.round += 1;
        inner.buffer.clear();
        inner.global_models = global.clone();
        inner.global_model_id = Some(model_id.clone());

        let mut meta = MetaData::new();
        meta.insert("num_contributors".into(), json!(request_ids.len()));
        let mut out = Vec::with_capacity(inner.agents.len() + 1);
        out.push(Outbound::ToDatabase(DbMessage::Push(DbPush {
            component_id: self.ctx.identity.clone(),
            round: finished,
            model_type: ModelType::Cluster,
            models: global.clone(),
            model_id: model_id.clone(),
            generation_time,
            meta_data: meta,
            request_ids: request_ids.clone(),
        })));
        for agent_id in inner.agents.keys() {
            let gm = GlobalModels { aggregator_id: self.ctx.identity.clone(), model_id: model_id.clone(), round: inner.round, global_models: global.clone() };
            out.push(Outbound::ToAgent { agent_id: agent_id.clone(), message: AggregatorMessage::GlobalModels(gm) });
        }
        PROTOCOL_METRICS.rounds_completed.add(1, &[]);
        info!(round = finished, contributors = request_ids.len(), next_round = inner.round, "aggregation round completed");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn coordinator(threshold: f64) -> AggregatorCoordinator {
        let ctx = ComponentContext::new(ComponentType::Aggregator, ComponentId::from("agg"), IpAddr::V4(Ipv4Addr::LOCALHOST));
        AggregatorCoordinator::new(ctx, AggregatorSettings { aggregation_threshold: threshold, ..Default::default() })
    }

    fn models(v: f64) -> ModelMap { json!({"m": [v]}).as_object().unwrap().clone() }

    fn participate(agent: &str, init: bool, v: f64) -> AgentMessage {
        AgentMessage::Participate(Participate { agent_id: agent.into(), model_id: format!("{agent}-p").as_str().into(), local_models: models(v), init_flag: init, similarity_flag: false, exchange_socket: "7000".into(), generation_time: 1.0, meta_data: MetaData::new(), agent_ip: "10.0.0.9".into() })
    }

    fn update(agent: &str, v: f64) -> AgentMessage {
        AgentMessage::Update(Update { agent_id: agent.into(), model_id: format!("{agent}-u").as_str().into(), local_models: models(v), generation_time: 2.0, meta_data: MetaData::new() })
    }

    fn welcomes(out: &[Outbound]) -> Vec<&Welcome> {
        out.iter().filter_map(|o| match o { Outbound::ToAgent { message: AggregatorMessage::Welcome(w), .. } => Some(w), _ => None }).collect()
    }

    #[test]
    fn participate_seeds_and_welcomes() {
        let c = coordinator(1.0);
        let out = c.handle(participate("a1", true, 3.0)).unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Outbound::ToDatabase(DbMessage::Push(p)) if p.model_type == ModelType::Local && p.component_id.0 == "a1"));
        let w = welcomes(&out)[0];
        assert_eq!(w.round, 1);
        assert_eq!(w.global_models, models(3.0));
        assert_eq!(w.model_id.0, "a1-p");

        // later participants do not overwrite the seed
        let out = c.handle(participate("a2", true, 9.0)).unwrap();
        assert_eq!(welcomes(&out)[0].global_models, models(3.0));
        assert_eq!(c.agents().len(), 2);
    }

    #[test]
    fn round_closes_at_threshold() {
        let c = coordinator(1.0);
        c.handle(participate("a1", false, 0.0)).unwrap();
        c.handle(participate("a2", false, 0.0)).unwrap();
        let out = c.handle(update("a1", 1.0)).unwrap();
        assert_eq!(out.len(), 1);
        // a repeated update replaces the buffered one
        c.handle(update("a1", 2.0)).unwrap();
        assert_eq!(c.buffered(), 1);

        let out = c.handle(update("a2", 4.0)).unwrap();
        let cluster: Vec<_> = out.iter().filter_map(|o| match o { Outbound::ToDatabase(DbMessage::Push(p)) if p.model_type == ModelType::Cluster => Some(p), _ => None }).collect();
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster[0].round, 1);
        assert_eq!(cluster[0].request_ids, vec![ComponentId::from("a1"), ComponentId::from("a2")]);
        let gms: Vec<_> = out.iter().filter_map(|o| match o { Outbound::ToAgent { message: AggregatorMessage::GlobalModels(g), .. } => Some(g), _ => None }).collect();
        assert_eq!(gms.len(), 2);
        assert!(gms.iter().all(|g| g.round == 2 && g.global_models["m"] == json!([3.0])));
        assert_eq!(c.round(), 2);
        assert_eq!(c.buffered(), 0);
    }

    #[test]
    fn mismatched_update_is_persisted_and_left_out_of_the_round() {
        let c = coordinator(1.0);
        c.handle(participate("a1", false, 0.0)).unwrap();
        c.handle(participate("a2", false, 0.0)).unwrap();
        c.handle(update("a1", 1.0)).unwrap();

        let bad = AgentMessage::Update(Update { agent_id: "a2".into(), model_id: "a2-bad".into(), local_models: json!({"m": [1.0, 2.0]}).as_object().unwrap().clone(), generation_time: 3.0, meta_data: MetaData::new() });
        let out = c.handle(bad).unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Outbound::ToDatabase(DbMessage::Push(p)) if p.model_id.0 == "a2-bad" && p.model_type == ModelType::Local));
        assert!(matches!(&out[1], Outbound::UpdateRejected { agent_id, error: AggregationError::ShapeMismatch { .. } } if agent_id.0 == "a2"));
        assert_eq!(c.buffered(), 1);
        assert_eq!(c.round(), 1);

        // a corrected resend closes the round
        let out = c.handle(update("a2", 3.0)).unwrap();
        assert!(out.iter().any(|o| matches!(o, Outbound::ToAgent { message: AggregatorMessage::GlobalModels(g), .. } if g.global_models["m"] == json!([2.0]))));
        assert_eq!(c.round(), 2);
    }

    #[test]
    fn rejection_drops_only_the_triggering_update() {
        let c = coordinator(1.0);
        c.handle(participate("a1", false, 0.0)).unwrap();
        c.handle(participate("a2", false, 0.0)).unwrap();
        c.handle(update("a1", 1.0)).unwrap();
        let bad = AgentMessage::Update(Update { agent_id: "a1".into(), model_id: "a1-bad".into(), local_models: json!({"m": "blob"}).as_object().unwrap().clone(), generation_time: 3.0, meta_data: MetaData::new() });
        // below threshold: the resend replaces a1's buffered models without aggregating
        c.handle(bad).unwrap();
        let out = c.handle(update("a2", 5.0)).unwrap();
        assert!(matches!(out.last(), Some(Outbound::UpdateRejected { agent_id, .. }) if agent_id.0 == "a2"));
        assert_eq!(c.buffered(), 1);
        c.handle(update("a1", 1.0)).unwrap();
        assert_eq!(c.round(), 1);
        let out = c.handle(update("a2", 5.0)).unwrap();
        assert!(out.iter().any(|o| matches!(o, Outbound::ToAgent { message: AggregatorMessage::GlobalModels(g), .. } if g.global_models["m"] == json!([3.0]))));
    }

    #[test]
    fn partial_threshold() {
        let c = coordinator(0.5);
        for a in ["a1", "a2", "a3"] { c.handle(participate(a, false, 0.0)).unwrap(); }
        assert_eq!(c.required_updates(3), 2);
        c.handle(update("a1", 1.0)).unwrap();
        assert_eq!(c.round(), 1);
        c.handle(update("a3", 1.0)).unwrap();
        assert_eq!(c.round(), 2);
    }

    #[test]
    fn waits_for_min_agents() {
        let ctx = ComponentContext::new(ComponentType::Aggregator, ComponentId::from("agg"), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let c = AggregatorCoordinator::new(ctx, AggregatorSettings { min_agents: 2, ..Default::default() });
        c.handle(participate("a1", false, 0.0)).unwrap();
        c.handle(update("a1", 1.0)).unwrap();
        assert_eq!(c.round(), 1);
        c.handle(participate("a2", false, 0.0)).unwrap();
        c.handle(update("a2", 1.0)).unwrap();
        assert_eq!(c.round(), 2);
    }

    #[test]
    fn update_from_unknown_agent_is_rejected() {
        let c = coordinator(1.0);
        assert!(matches!(c.handle(update("ghost", 1.0)), Err(ProtocolError::UnknownAgent(id)) if id.0 == "ghost"));
    }

    #[test]
    fn settings_from_config() {
        let cfg = ComponentConfig::from_value(json!({"aggregation_threshold": "0.75", "receive_socket": "9999"}));
        let s = AggregatorSettings::from_config(&cfg);
        assert_eq!(s.aggregation_threshold, 0.75);
        assert_eq!(s.receive_socket, "9999");
        assert_eq!(s.exchange_socket, "7890");
        let clamped = AggregatorSettings::from_config(&ComponentConfig::from_value(json!({"aggregation_threshold": 4})));
        assert_eq!(clamped.aggregation_threshold, 1.0);
    }
}
