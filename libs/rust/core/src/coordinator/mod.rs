//! Aggregation coordination (round-based protocol over the message families).

pub mod agent;
pub mod aggregation;
pub mod aggregator;
pub mod database;

use thiserror::Error;

use crate::bundle::BundleError;
use crate::identity::{ComponentId, ModelSetId};
use crate::messages::CodecError;
use crate::state::{ClientState, StateError};

pub use agent::{AgentCoordinator, AgentEvent};
pub use aggregation::{AggregationError, Aggregator, FedAvg, WeightedModels};
pub use aggregator::{AgentRecord, AggregatorCoordinator, AggregatorSettings, Outbound};
pub use database::{DatabaseHandler, DbReply, ModelRecord};

pub type RoundId = u64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{event:?} is not allowed in state {from}")] InvalidTransition { from: ClientState, event: AgentEvent },
    #[error("agent has already sent its participate message")] AlreadyParticipated,
    #[error("message addressed to {0}, not this agent")] WrongRecipient(ComponentId),
    #[error("agent {0} has not participated")] UnknownAgent(ComponentId),
    #[error("agent context has no state store")] NoStateStore,
    #[error("model id {0} cannot name a bundle file")] InvalidModelId(ModelSetId),
    #[error(transparent)] State(#[from] StateError),
    #[error(transparent)] Codec(#[from] CodecError),
    #[error(transparent)] Bundle(#[from] BundleError),
    #[error(transparent)] Aggregation(#[from] AggregationError),
}
