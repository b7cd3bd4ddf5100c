//! Aggregator Module - routes coordinator output to agents and the database.
use anyhow::Result;
use fl_core::coordinator::{AggregatorCoordinator, Outbound};
use fl_core::identity::ComponentId;
use fl_core::messages::AgentMessage;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::Frame;

pub struct AggregatorModule {
    coordinator: AggregatorCoordinator,
    agents: HashMap<ComponentId, mpsc::Sender<Frame>>,
    database: mpsc::Sender<Frame>,
}

impl AggregatorModule {
    pub fn new(coordinator: AggregatorCoordinator, agents: HashMap<ComponentId, mpsc::Sender<Frame>>, database: mpsc::Sender<Frame>) -> Self {
        Self { coordinator, agents, database }
    }

    /// Runs until every agent has hung up.
    pub async fn run(self, mut inbox: mpsc::Receiver<Frame>) -> Result<AggregatorCoordinator> {
        while let Some(frame) = inbox.recv().await {
            let msg = match AgentMessage::decode(&frame) {
                Ok(m) => m,
                Err(e) => { warn!(error = %e, "dropping undecodable agent frame"); continue; }
            };
            let from = msg.agent_id().clone();
            let outbound = match self.coordinator.handle(msg) {
                Ok(out) => out,
                Err(e) => { warn!(agent = %from, error = %e, "agent message rejected"); continue; }
            };
            for o in outbound { self.dispatch(o).await?; }
        }
        info!(round = self.coordinator.round(), agents = self.coordinator.agents().len(), "aggregator inbox closed");
        Ok(self.coordinator)
    }

    async fn dispatch(&self, o: Outbound) -> Result<()> {
        match o {
            Outbound::ToAgent { agent_id, message } => {
                let Some(tx) = self.agents.get(&agent_id) else { warn!(agent = %agent_id, "no route to agent"); return Ok(()); };
                // finished agents close their inbox; late distributions are dropped
                if tx.send(message.encode()?).await.is_err() { warn!(agent = %agent_id, "agent inbox closed"); }
            }
            Outbound::ToDatabase(msg) => self.database.send(msg.encode()?).await?,
            Outbound::UpdateRejected { agent_id, error } => warn!(agent = %agent_id, error = %error, "update left out of the round"),
        }
        Ok(())
    }
}
