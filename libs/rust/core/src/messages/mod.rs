//! Coordination protocol messages.
//!
//! Three families share the transport:
//! - agent → aggregator ([`AgentMessage`]): participate, update
//! - aggregator → agent ([`AggregatorMessage`]): welcome, global model distribution
//! - aggregator → database ([`DbMessage`]): push, get_list, get_models
//!
//! Each message is a tagged record in memory and a positional JSON array on the
//! wire (see [`wire`]). Discriminants overlap between families (participate and
//! welcome are both `0`), so the receiver must know which family a channel carries.
//!
//! Fields appended in later protocol revisions are optional on decode, which
//! keeps older peers interoperable.

pub mod payload;
pub mod wire;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::identity::{unix_time, ComponentId, ModelSetId};
use crate::metrics::PROTOCOL_METRICS;
use opentelemetry::KeyValue;
use wire::*;

pub use payload::{decode_model_payload, decode_model_payload_with, encode_model_payload, LiveDefaults, ModelPayload, PayloadDefaults, PayloadFields};

/// Model identifier → opaque model payload.
pub type ModelMap = serde_json::Map<String, Value>;
pub type MetaData = serde_json::Map<String, Value>;

pub const DEFAULT_AGENT_IP: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not a mapping")] NotAMapping,
    #[error("{layout} message is not a sequence")] NotASequence { layout: &'static str },
    #[error("{layout} message is missing {field} at position {index}")] MissingField { layout: &'static str, field: &'static str, index: usize },
    #[error("{layout} message has an invalid {field} at position {index}: {source}")] InvalidField { layout: &'static str, field: &'static str, index: usize, source: serde_json::Error },
    #[error("{family} message type is not an integer")] InvalidMessageType { family: &'static str },
    #[error("unknown {family} message type {code}")] UnknownMessageType { family: &'static str, code: i64 },
    #[error("json error: {0}")] Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentMsgType { Participate = 0, Update = 1 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggMsgType { Welcome = 0, SendingGmModels = 1 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbMsgType { Push = 0, GetList = 1, GetModels = 2 }

/// Local models come from an agent; cluster models are aggregated by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType { Local = 0, Cluster = 1 }

impl AgentMsgType {
    pub fn from_code(code: i64) -> Option<Self> { match code { 0 => Some(Self::Participate), 1 => Some(Self::Update), _ => None } }
}
impl AggMsgType {
    pub fn from_code(code: i64) -> Option<Self> { match code { 0 => Some(Self::Welcome), 1 => Some(Self::SendingGmModels), _ => None } }
}
impl DbMsgType {
    pub fn from_code(code: i64) -> Option<Self> { match code { 0 => Some(Self::Push), 1 => Some(Self::GetList), 2 => Some(Self::GetModels), _ => None } }
}

impl ModelType {
    pub fn code(self) -> u8 { self as u8 }
    pub fn from_code(code: u8) -> Option<Self> { match code { 0 => Some(Self::Local), 1 => Some(Self::Cluster), _ => None } }
}

fn model_type_at<L: Location>(r: &WireReader<'_, L>, loc: L) -> Result<ModelType, CodecError> {
    let code: u8 = r.required(loc)?;
    ModelType::from_code(code).ok_or(CodecError::UnknownMessageType { family: "model type", code: code as i64 })
}

/// Sockets were sent as bare port numbers by early agents; normalise to strings.
fn socket_at<L: Location>(r: &WireReader<'_, L>, loc: L) -> Result<Option<String>, CodecError> {
    match r.raw(loc) {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => r.optional(loc),
    }
}

// ---------------------------------------------------------------------------
// agent → aggregator

#[derive(Debug, Clone, PartialEq)]
pub struct Participate {
    pub agent_id: ComponentId,
    pub model_id: ModelSetId,
    pub local_models: ModelMap,
    pub init_flag: bool,
    pub similarity_flag: bool,
    pub exchange_socket: String,
    pub generation_time: f64,
    pub meta_data: MetaData,
    pub agent_ip: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub agent_id: ComponentId,
    pub model_id: ModelSetId,
    pub local_models: ModelMap,
    pub generation_time: f64,
    pub meta_data: MetaData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Participate(Participate),
    Update(Update),
}

impl AgentMessage {
    pub const FAMILY: &'static str = "agent";

    pub fn msg_type(&self) -> AgentMsgType {
        match self { AgentMessage::Participate(_) => AgentMsgType::Participate, AgentMessage::Update(_) => AgentMsgType::Update }
    }

    pub fn agent_id(&self) -> &ComponentId {
        match self { AgentMessage::Participate(p) => &p.agent_id, AgentMessage::Update(u) => &u.agent_id }
    }

    pub fn to_wire(&self) -> Result<Value, CodecError> {
        match self {
            AgentMessage::Participate(p) => {
                use ParticipateLocation as L;
                let mut w = WireWriter::<L>::new();
                w.set(L::MsgType, &(AgentMsgType::Participate as u8))?
                    .set(L::AgentId, &p.agent_id)?
                    .set(L::ModelId, &p.model_id)?
                    .set(L::LocalModels, &p.local_models)?
                    .set(L::InitFlag, &p.init_flag)?
                    .set(L::SimilarityFlag, &p.similarity_flag)?
                    .set(L::ExchangeSocket, &p.exchange_socket)?
                    .set(L::GenerationTime, &p.generation_time)?
                    .set(L::MetaData, &p.meta_data)?
                    .set(L::AgentIp, &p.agent_ip)?;
                w.finish()
            }
            AgentMessage::Update(u) => {
                use UpdateLocation as L;
                let mut w = WireWriter::<L>::new();
                w.set(L::MsgType, &(AgentMsgType::Update as u8))?
                    .set(L::AgentId, &u.agent_id)?
                    .set(L::ModelId, &u.model_id)?
                    .set(L::LocalModels, &u.local_models)?
                    .set(L::GenerationTime, &u.generation_time)?
                    .set(L::MetaData, &u.meta_data)?;
                w.finish()
            }
        }
    }

    pub fn from_wire(value: &Value) -> Result<Self, CodecError> {
        let (items, code) = message_code(value, Self::FAMILY)?;
        match AgentMsgType::from_code(code) {
            Some(AgentMsgType::Participate) => {
                use ParticipateLocation as L;
                let r = WireReader::<L>::new(items);
                Ok(AgentMessage::Participate(Participate {
                    agent_id: r.required(L::AgentId)?,
                    model_id: r.required(L::ModelId)?,
                    local_models: r.required(L::LocalModels)?,
                    init_flag: r.required(L::InitFlag)?,
                    similarity_flag: r.required(L::SimilarityFlag)?,
                    exchange_socket: socket_at(&r, L::ExchangeSocket)?.ok_or(CodecError::MissingField { layout: L::LAYOUT, field: "exchange_socket", index: L::ExchangeSocket.index() })?,
                    generation_time: r.optional(L::GenerationTime)?.unwrap_or_else(unix_time),
                    meta_data: r.optional(L::MetaData)?.unwrap_or_default(),
                    agent_ip: r.optional(L::AgentIp)?.unwrap_or_else(|| DEFAULT_AGENT_IP.to_string()),
                }))
            }
            Some(AgentMsgType::Update) => {
                use UpdateLocation as L;
                let r = WireReader::<L>::new(items);
                Ok(AgentMessage::Update(Update {
                    agent_id: r.required(L::AgentId)?,
                    model_id: r.required(L::ModelId)?,
                    local_models: r.required(L::LocalModels)?,
                    generation_time: r.optional(L::GenerationTime)?.unwrap_or_else(unix_time),
                    meta_data: r.optional(L::MetaData)?.unwrap_or_default(),
                }))
            }
            None => Err(CodecError::UnknownMessageType { family: Self::FAMILY, code }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> { encode_value(Self::FAMILY, self.to_wire()?) }
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> { decode_value(Self::FAMILY, bytes, Self::from_wire) }
}

// ---------------------------------------------------------------------------
// aggregator → agent

#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
    pub aggregator_id: ComponentId,
    pub model_id: ModelSetId,
    pub global_models: ModelMap,
    pub round: u64,
    pub agent_id: ComponentId,
    pub exchange_socket: String,
    pub receive_socket: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalModels {
    pub aggregator_id: ComponentId,
    pub model_id: ModelSetId,
    pub round: u64,
    pub global_models: ModelMap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorMessage {
    Welcome(Welcome),
    GlobalModels(GlobalModels),
}

impl AggregatorMessage {
    pub const FAMILY: &'static str = "aggregator";

    pub fn msg_type(&self) -> AggMsgType {
        match self { AggregatorMessage::Welcome(_) => AggMsgType::Welcome, AggregatorMessage::GlobalModels(_) => AggMsgType::SendingGmModels }
    }

    pub fn round(&self) -> u64 {
        match self { AggregatorMessage::Welcome(w) => w.round, AggregatorMessage::GlobalModels(g) => g.round }
    }

    pub fn to_wire(&self) -> Result<Value, CodecError> {
        match self {
            AggregatorMessage::Welcome(m) => {
                use WelcomeLocation as L;
                let mut w = WireWriter::<L>::new();
                w.set(L::MsgType, &(AggMsgType::Welcome as u8))?
                    .set(L::AggregatorId, &m.aggregator_id)?
                    .set(L::ModelId, &m.model_id)?
                    .set(L::GlobalModels, &m.global_models)?
                    .set(L::Round, &m.round)?
                    .set(L::AgentId, &m.agent_id)?
                    .set(L::ExchangeSocket, &m.exchange_socket)?
                    .set(L::ReceiveSocket, &m.receive_socket)?;
                w.finish()
            }
            AggregatorMessage::GlobalModels(m) => {
                use GmDistributionLocation as L;
                let mut w = WireWriter::<L>::new();
                w.set(L::MsgType, &(AggMsgType::SendingGmModels as u8))?
                    .set(L::AggregatorId, &m.aggregator_id)?
                    .set(L::ModelId, &m.model_id)?
                    .set(L::Round, &m.round)?
                    .set(L::GlobalModels, &m.global_models)?;
                w.finish()
            }
        }
    }

    pub fn from_wire(value: &Value) -> Result<Self, CodecError> {
        let (items, code) = message_code(value, Self::FAMILY)?;
        match AggMsgType::from_code(code) {
            Some(AggMsgType::Welcome) => {
                use WelcomeLocation as L;
                let r = WireReader::<L>::new(items);
                Ok(AggregatorMessage::Welcome(Welcome {
                    aggregator_id: r.required(L::AggregatorId)?,
                    model_id: r.required(L::ModelId)?,
                    global_models: r.required(L::GlobalModels)?,
                    round: r.required(L::Round)?,
                    agent_id: r.required(L::AgentId)?,
                    exchange_socket: socket_at(&r, L::ExchangeSocket)?.unwrap_or_default(),
                    receive_socket: socket_at(&r, L::ReceiveSocket)?.unwrap_or_default(),
                }))
            }
            Some(AggMsgType::SendingGmModels) => {
                use GmDistributionLocation as L;
                let r = WireReader::<L>::new(items);
                Ok(AggregatorMessage::GlobalModels(GlobalModels {
                    aggregator_id: r.required(L::AggregatorId)?,
                    model_id: r.required(L::ModelId)?,
                    round: r.required(L::Round)?,
                    global_models: r.required(L::GlobalModels)?,
                }))
            }
            None => Err(CodecError::UnknownMessageType { family: Self::FAMILY, code }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> { encode_value(Self::FAMILY, self.to_wire()?) }
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> { decode_value(Self::FAMILY, bytes, Self::from_wire) }
}

// ---------------------------------------------------------------------------
// aggregator → database

#[derive(Debug, Clone, PartialEq)]
pub struct DbPush {
    pub component_id: ComponentId,
    pub round: u64,
    pub model_type: ModelType,
    pub models: ModelMap,
    pub model_id: ModelSetId,
    pub generation_time: f64,
    pub meta_data: MetaData,
    /// Agents whose local models went into this set.
    pub request_ids: Vec<ComponentId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbGetList {
    pub component_id: ComponentId,
    pub model_type: ModelType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbGetModels {
    pub component_id: ComponentId,
    pub model_type: ModelType,
    pub model_id: ModelSetId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DbMessage {
    Push(DbPush),
    GetList(DbGetList),
    GetModels(DbGetModels),
}

impl DbMessage {
    pub const FAMILY: &'static str = "database";

    pub fn msg_type(&self) -> DbMsgType {
        match self { DbMessage::Push(_) => DbMsgType::Push, DbMessage::GetList(_) => DbMsgType::GetList, DbMessage::GetModels(_) => DbMsgType::GetModels }
    }

    pub fn to_wire(&self) -> Result<Value, CodecError> {
        match self {
            DbMessage::Push(m) => {
                use DbPushLocation as L;
                let mut w = WireWriter::<L>::new();
                w.set(L::MsgType, &(DbMsgType::Push as u8))?
                    .set(L::ComponentId, &m.component_id)?
                    .set(L::Round, &m.round)?
                    .set(L::ModelType, &m.model_type.code())?
                    .set(L::Models, &m.models)?
                    .set(L::ModelId, &m.model_id)?
                    .set(L::GenerationTime, &m.generation_time)?
                    .set(L::MetaData, &m.meta_data)?
                    .set(L::RequestIdList, &m.request_ids)?;
                w.finish()
            }
            DbMessage::GetList(m) => {
                use DbGetListLocation as L;
                let mut w = WireWriter::<L>::new();
                w.set(L::MsgType, &(DbMsgType::GetList as u8))?
                    .set(L::ComponentId, &m.component_id)?
                    .set(L::ModelType, &m.model_type.code())?;
                w.finish()
            }
            DbMessage::GetModels(m) => {
                use DbGetModelsLocation as L;
                let mut w = WireWriter::<L>::new();
                w.set(L::MsgType, &(DbMsgType::GetModels as u8))?
                    .set(L::ComponentId, &m.component_id)?
                    .set(L::ModelType, &m.model_type.code())?
                    .set(L::ModelId, &m.model_id)?;
                w.finish()
            }
        }
    }

    pub fn from_wire(value: &Value) -> Result<Self, CodecError> {
        let (items, code) = message_code(value, Self::FAMILY)?;
        match DbMsgType::from_code(code) {
            Some(DbMsgType::Push) => {
                use DbPushLocation as L;
                let r = WireReader::<L>::new(items);
                Ok(DbMessage::Push(DbPush {
                    component_id: r.required(L::ComponentId)?,
                    round: r.required(L::Round)?,
                    model_type: model_type_at(&r, L::ModelType)?,
                    models: r.required(L::Models)?,
                    model_id: r.required(L::ModelId)?,
                    generation_time: r.optional(L::GenerationTime)?.unwrap_or_else(unix_time),
                    meta_data: r.optional(L::MetaData)?.unwrap_or_default(),
                    request_ids: r.optional(L::RequestIdList)?.unwrap_or_default(),
                }))
            }
            Some(DbMsgType::GetList) => {
                use DbGetListLocation as L;
                let r = WireReader::<L>::new(items);
                Ok(DbMessage::GetList(DbGetList { component_id: r.required(L::ComponentId)?, model_type: model_type_at(&r, L::ModelType)? }))
            }
            Some(DbMsgType::GetModels) => {
                use DbGetModelsLocation as L;
                let r = WireReader::<L>::new(items);
                Ok(DbMessage::GetModels(DbGetModels {
                    component_id: r.required(L::ComponentId)?,
                    model_type: model_type_at(&r, L::ModelType)?,
                    model_id: r.required(L::ModelId)?,
                }))
            }
            None => Err(CodecError::UnknownMessageType { family: Self::FAMILY, code }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> { encode_value(Self::FAMILY, self.to_wire()?) }
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> { decode_value(Self::FAMILY, bytes, Self::from_wire) }
}

fn encode_value(family: &'static str, value: Value) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(&value)?;
    PROTOCOL_METRICS.messages_encoded.add(1, &[KeyValue::new("family", family)]);
    Ok(bytes)
}

fn decode_value<T>(family: &'static str, bytes: &[u8], parse: fn(&Value) -> Result<T, CodecError>) -> Result<T, CodecError> {
    let res = serde_json::from_slice::<Value>(bytes).map_err(CodecError::from).and_then(|v| parse(&v));
    match &res {
        Ok(_) => PROTOCOL_METRICS.messages_decoded.add(1, &[KeyValue::new("family", family)]),
        Err(e) => {
            tracing::warn!(family, error = %e, "message decode failed");
            PROTOCOL_METRICS.decode_failures.add(1, &[KeyValue::new("family", family)]);
        }
    }
    res
}
