use anyhow::{Context, Result};
use fl_core::coordinator::{AgentCoordinator, AggregatorCoordinator, AggregatorSettings, DatabaseHandler};
use fl_core::identity::{generate_component_identity, ComponentType, StaticFingerprint};
use fl_core::{config_path, init_tracing, load_config, outbound_ip, ComponentConfig, ComponentContext, StateStore};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::info;

mod modules;
use modules::{AgentModule, AggregatorModule, DatabaseModule};

const CHANNEL_DEPTH: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("fl-sim")?;
    let cfg = match std::env::var("FL_SIM_CONFIG") {
        Ok(path) => load_config(Path::new(&path)).with_context(|| format!("loading {path}"))?,
        Err(_) => ComponentConfig::default(),
    };
    let agents = cfg.get_u64("agents").unwrap_or(2).max(1) as usize;
    let rounds = cfg.get_u64("rounds").unwrap_or(2).max(1);
    let state_root = PathBuf::from(cfg.get_str("state_dir").unwrap_or("./state"));
    let db_dir = PathBuf::from(cfg.get_str("db_dir").unwrap_or("./db"));
    let ip = outbound_ip();
    info!(agents, rounds, %ip, state_root = %state_root.display(), db_dir = %db_dir.display(), "starting federated learning simulation");

    let (agg_tx, agg_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (db_tx, db_rx) = mpsc::channel(CHANNEL_DEPTH);

    let mut routes = HashMap::new();
    let mut agent_tasks = Vec::with_capacity(agents);
    for i in 0..agents {
        let id = generate_component_identity(&StaticFingerprint(format!("sim-agent-{i}")))?;
        let store = StateStore::new(state_root.join(format!("agent{i}")), "state").with_poll(cfg.state_poll());
        let ctx = ComponentContext::new(ComponentType::Agent, id.clone(), ip).with_state(store);
        let module = AgentModule::new(AgentCoordinator::new(ctx)?, 0.1 * (i + 1) as f64, 10 * (i as u64 + 1), i == 0, rounds);
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        routes.insert(id, tx);
        agent_tasks.push(tokio::spawn(module.run(agg_tx.clone(), rx)));
    }
    // agents own the only remaining senders; the aggregator stops once they all finish
    drop(agg_tx);

    let aggregator = aggregator_from_setup(&cfg, agents)?;
    let agg_task = tokio::spawn(AggregatorModule::new(aggregator, routes, db_tx).run(agg_rx));
    let db_task = tokio::spawn(DatabaseModule::new(DatabaseHandler::open(&db_dir)?).run(db_rx));

    for task in agent_tasks {
        let agent = task.await??;
        info!(agent = %agent.id(), state = %agent.state()?, round = agent.round(), "agent finished");
    }
    let aggregator = agg_task.await??;
    let database = db_task.await??;
    info!(rounds_completed = aggregator.round() - 1, stored_model_sets = database.records().len(), "simulation complete");
    Ok(())
}

/// Regular aggregator startup: `setups/config_aggregator.json` when present (else the
/// simulation config), then identity and address through the context bootstrap.
fn aggregator_from_setup(sim_cfg: &ComponentConfig, agents: usize) -> Result<AggregatorCoordinator> {
    let path = config_path(ComponentType::Aggregator)?;
    let mut cfg = if path.exists() { load_config(&path).with_context(|| format!("loading {}", path.display()))? } else { sim_cfg.clone() };
    // containers often expose no MAC address
    cfg.set_default("fingerprint", json!("sim-aggregator"));
    let ctx = ComponentContext::bootstrap(ComponentType::Aggregator, &cfg)?;
    let settings = AggregatorSettings { min_agents: agents, ..AggregatorSettings::from_config(&cfg) };
    Ok(AggregatorCoordinator::new(ctx, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_starts_through_bootstrap() {
        // no setups/ under the package directory, so the simulation config is used
        let cfg = ComponentConfig::from_value(json!({"aggregation_threshold": 0.5}));
        let aggregator = aggregator_from_setup(&cfg, 3).unwrap();
        assert_eq!(aggregator.id().0.len(), 64);
        assert_eq!(aggregator.required_updates(1), 2);
        assert_eq!(aggregator.round(), 1);
    }
}
