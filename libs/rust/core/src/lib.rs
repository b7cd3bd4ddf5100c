//! Core protocol library for the federated-learning coordination system:
//! identities, the agent state file, positional message codec, model bundles
//! and the round coordination logic shared by agents, aggregator and database.

pub mod bundle;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod identity;
pub mod messages;
pub mod metrics;
pub mod net;
pub mod resilience;
pub mod state;
pub mod telemetry;

pub use bundle::{load_model_file, save_model_file, BundleError, PerformanceMap, PERFORMANCE_KEY};
pub use config::{config_path, load_config, ComponentConfig, ConfigError};
pub use context::{ComponentContext, ContextError};
pub use coordinator::{AgentCoordinator, AggregatorCoordinator, AggregatorSettings, DatabaseHandler, DbReply, FedAvg, Outbound, ProtocolError};
pub use identity::{generate_component_identity, generate_model_set_identity, ComponentId, ComponentType, ModelSetId};
pub use messages::{decode_model_payload, AgentMessage, AggregatorMessage, CodecError, DbMessage, ModelMap, ModelPayload};
pub use net::outbound_ip;
pub use state::{ClientState, StateError, StateStore};
pub use telemetry::init_tracing;
