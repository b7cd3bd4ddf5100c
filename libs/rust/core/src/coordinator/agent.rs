//! Agent-side lifecycle state machine.
//!
//! ```text
//!  waiting_gm --welcome--> training --training complete--> sending
//!      ^ participate           ^                             |
//!      '--------'              | resume                      | global models
//!                              '------- gm_ready <-----------'
//! ```
//!
//! A global model distribution may also arrive while the agent is still
//! training or already holds an unconsumed one; both land in `gm_ready`.
//! Transitions happen only on received messages or local work completion and
//! are written through to the state file before the call returns.

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ProtocolError, RoundId};
use crate::context::ComponentContext;
use crate::identity::{generate_model_set_identity, unix_time, ComponentId, ComponentType, ModelSetId};
use crate::messages::{AgentMessage, AggregatorMessage, MetaData, ModelMap, Participate, Update};
use crate::metrics::PROTOCOL_METRICS;
use crate::state::{ClientState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent { Participate, Welcome, TrainingComplete, GlobalModelsReceived, Resume }

impl ClientState {
    pub fn on(self, event: AgentEvent) -> Result<ClientState, ProtocolError> {
        use AgentEvent as E;
        use ClientState as S;
        match (self, event) {
            (S::WaitingGm, E::Participate) => Ok(S::WaitingGm),
            (S::WaitingGm, E::Welcome) => Ok(S::Training),
            (S::Training, E::TrainingComplete) => Ok(S::Sending),
            (S::Training | S::Sending | S::GmReady, E::GlobalModelsReceived) => Ok(S::GmReady),
            (S::GmReady, E::Resume) => Ok(S::Training),
            (from, event) => Err(ProtocolError::InvalidTransition { from, event }),
        }
    }
}

#[derive(Debug, Default)]
struct AgentInner {
    participated: bool,
    round: RoundId,
    aggregator_id: Option<ComponentId>,
    global_model_id: Option<ModelSetId>,
    global_models: ModelMap,
}

pub struct AgentCoordinator {
    ctx: ComponentContext,
    store: StateStore,
    inner: Mutex<AgentInner>,
}

impl AgentCoordinator {
    /// Resets the state file to `waiting_gm`.
    pub fn new(ctx: ComponentContext) -> Result<Self, ProtocolError> {
        let store = ctx.state.clone().ok_or(ProtocolError::NoStateStore)?;
        store.init()?;
        Ok(Self { ctx, store, inner: Mutex::new(AgentInner::default()) })
    }

    pub fn id(&self) -> &ComponentId { &self.ctx.identity }
    pub fn state(&self) -> Result<ClientState, ProtocolError> { Ok(self.store.read_state()?) }
    pub fn round(&self) -> RoundId { self.inner.lock().round }
    pub fn global_models(&self) -> ModelMap { self.inner.lock().global_models.clone() }
    pub fn global_model_id(&self) -> Option<ModelSetId> { self.inner.lock().global_model_id.clone() }

    // Callers hold the inner lock, which serialises in-process access to the state file.
    fn transition(&self, event: AgentEvent) -> Result<ClientState, ProtocolError> {
        let from = self.store.read_state()?;
        let to = from.on(event)?;
        if to != from {
            self.store.write_state(to)?;
            PROTOCOL_METRICS.state_transitions.add(1, &[KeyValue::new("to", to.to_string())]);
            info!(agent = %self.ctx.identity, %from, %to, ?event, "agent state transition");
        }
        Ok(to)
    }

    fn new_model_id(&self, generation_time: f64) -> ModelSetId {
        generate_model_set_identity(ComponentType::Agent, &self.ctx.identity, generation_time)
    }

    pub fn participate(&self, local_models: ModelMap, init_flag: bool, similarity_flag: bool, exchange_socket: impl Into<String>, meta_data: MetaData) -> Result<AgentMessage, ProtocolError> {
        let mut inner = self.inner.lock();
        if inner.participated { return Err(ProtocolError::AlreadyParticipated); }
        self.transition(AgentEvent::Participate)?;
        inner.participated = true;
        let generation_time = unix_time();
        Ok(AgentMessage::Participate(Participate {
            agent_id: self.ctx.identity.clone(),
            model_id: self.new_model_id(generation_time),
            local_models,
            init_flag,
            similarity_flag,
            exchange_socket: exchange_socket.into(),
            generation_time,
            meta_data,
            agent_ip: self.ctx.ip.to_string(),
        }))
    }

    /// Applies an aggregator message. Returns the new state, or `None` when the
    /// message was stale and ignored.
    pub fn handle(&self, msg: AggregatorMessage) -> Result<Option<ClientState>, ProtocolError> {
        let mut inner = self.inner.lock();
        match msg {
            AggregatorMessage::Welcome(w) => {
                if w.agent_id != self.ctx.identity { return Err(ProtocolError::WrongRecipient(w.agent_id)); }
                let to = self.transition(AgentEvent::Welcome)?;
                inner.round = w.round;
                inner.aggregator_id = Some(w.aggregator_id);
                inner.global_model_id = Some(w.model_id);
                inner.global_models = w.global_models;
                Ok(Some(to))
            }
            AggregatorMessage::GlobalModels(gm) => {
                if gm.round < inner.round {
                    debug!(agent = %self.ctx.identity, received = gm.round, current = inner.round, "stale global models ignored");
                    return Ok(None);
                }
                let to = self.transition(AgentEvent::GlobalModelsReceived)?;
                inner.round = gm.round;
                inner.aggregator_id = Some(gm.aggregator_id);
                inner.global_model_id = Some(gm.model_id);
                inner.global_models = gm.global_models;
                Ok(Some(to))
            }
        }
    }

    /// training → sending; returns the update carrying the new local models.
    pub fn finish_training(&self, local_models: ModelMap, meta_data: MetaData) -> Result<AgentMessage, ProtocolError> {
        let _inner = self.inner.lock();
        self.transition(AgentEvent::TrainingComplete)?;
        let generation_time = unix_time();
        Ok(AgentMessage::Update(Update {
            agent_id: self.ctx.identity.clone(),
            model_id: self.new_model_id(generation_time),
            local_models,
            generation_time,
            meta_data,
        }))
    }

    /// gm_ready → training; returns the global models to train from.
    pub fn resume_training(&self) -> Result<ModelMap, ProtocolError> {
        let inner = self.inner.lock();
        self.transition(AgentEvent::Resume)?;
        Ok(inner.global_models.clone())
    }
}
