use fl_core::coordinator::{AgentCoordinator, AggregatorCoordinator, AggregatorSettings, DatabaseHandler, DbReply, Outbound};
use fl_core::identity::{ComponentId, ComponentType};
use fl_core::messages::{AgentMessage, AggregatorMessage, DbGetList, DbMessage, MetaData, ModelMap, ModelType};
use fl_core::resilience::PollConfig;
use fl_core::{ClientState, ComponentContext, StateStore};
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

fn models(v: f64) -> ModelMap { json!({"layer": [v, v * 2.0]}).as_object().unwrap().clone() }

fn meta(samples: u64) -> MetaData { json!({"num_samples": samples}).as_object().unwrap().clone() }

fn agent(root: &Path, name: &str) -> AgentCoordinator {
    let store = StateStore::new(root.join(name), "state").with_poll(PollConfig { interval: Duration::from_millis(1), timeout: Duration::from_millis(50) });
    let ctx = ComponentContext::new(ComponentType::Agent, ComponentId::from(name), IpAddr::V4(Ipv4Addr::LOCALHOST)).with_state(store);
    AgentCoordinator::new(ctx).unwrap()
}

/// Routes aggregator output through the byte-level codec, as a transport would.
fn deliver(out: Vec<Outbound>, agents: &HashMap<ComponentId, &AgentCoordinator>, db: &DatabaseHandler) {
    for o in out {
        match o {
            Outbound::ToAgent { agent_id, message } => {
                let decoded = AggregatorMessage::decode(&message.encode().unwrap()).unwrap();
                agents[&agent_id].handle(decoded).unwrap();
            }
            Outbound::ToDatabase(msg) => {
                let decoded = DbMessage::decode(&msg.encode().unwrap()).unwrap();
                assert!(matches!(db.handle(decoded).unwrap(), DbReply::Ack { .. }));
            }
            Outbound::UpdateRejected { agent_id, error } => panic!("update from {agent_id} rejected: {error}"),
        }
    }
}

fn send(agg: &AggregatorCoordinator, msg: AgentMessage) -> Vec<Outbound> {
    agg.handle(AgentMessage::decode(&msg.encode().unwrap()).unwrap()).unwrap()
}

#[test]
fn two_agent_round_ends_in_gm_ready() {
    let dir = tempfile::tempdir().unwrap();
    let a1 = agent(dir.path(), "a1");
    let a2 = agent(dir.path(), "a2");
    let routes: HashMap<ComponentId, &AgentCoordinator> = [(a1.id().clone(), &a1), (a2.id().clone(), &a2)].into_iter().collect();
    let db = DatabaseHandler::open(dir.path().join("db")).unwrap();
    let agg_ctx = ComponentContext::new(ComponentType::Aggregator, ComponentId::from("agg"), IpAddr::V4(Ipv4Addr::LOCALHOST));
    let agg = AggregatorCoordinator::new(agg_ctx, AggregatorSettings::default());

    for (a, init) in [(&a1, true), (&a2, false)] {
        let p = a.participate(models(0.0), init, false, "7000", MetaData::new()).unwrap();
        assert_eq!(a.state().unwrap(), ClientState::WaitingGm);
        deliver(send(&agg, p), &routes, &db);
        assert_eq!(a.state().unwrap(), ClientState::Training);
        assert_eq!(a.round(), 1);
    }

    let u1 = a1.finish_training(models(1.0), meta(10)).unwrap();
    assert_eq!(a1.state().unwrap(), ClientState::Sending);
    deliver(send(&agg, u1), &routes, &db);
    assert_eq!(a2.state().unwrap(), ClientState::Training);
    assert_eq!(agg.round(), 1);

    let u2 = a2.finish_training(models(3.0), meta(30)).unwrap();
    deliver(send(&agg, u2), &routes, &db);

    assert_eq!(agg.round(), 2);
    for a in [&a1, &a2] {
        assert_eq!(a.state().unwrap(), ClientState::GmReady);
        assert_eq!(a.round(), 2);
        // (1*10 + 3*30) / 40 = 2.5
        let gm = a.global_models();
        assert!((gm["layer"][0].as_f64().unwrap() - 2.5).abs() < 1e-9);
        assert!((gm["layer"][1].as_f64().unwrap() - 5.0).abs() < 1e-9);
    }

    let trained_from = a1.resume_training().unwrap();
    assert_eq!(trained_from, a1.global_models());
    assert_eq!(a1.state().unwrap(), ClientState::Training);

    let DbReply::List(cluster) = db.handle(DbMessage::GetList(DbGetList { component_id: "a1".into(), model_type: ModelType::Cluster })).unwrap() else { panic!("expected list") };
    assert_eq!(cluster.len(), 1);
    assert_eq!(cluster[0].request_ids.len(), 2);
    let DbReply::List(local) = db.handle(DbMessage::GetList(DbGetList { component_id: "a1".into(), model_type: ModelType::Local })).unwrap() else { panic!("expected list") };
    // two participations plus two updates
    assert_eq!(local.len(), 4);
}

#[test]
fn agent_state_is_visible_to_other_readers() {
    let dir = tempfile::tempdir().unwrap();
    let a = agent(dir.path(), "a1");
    let observer = StateStore::new(dir.path().join("a1"), "state");
    a.participate(ModelMap::new(), false, false, "7000", MetaData::new()).unwrap();
    assert_eq!(observer.read_state().unwrap(), ClientState::WaitingGm);
}
