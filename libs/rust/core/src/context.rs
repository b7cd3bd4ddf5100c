//! Per-process component context.
//!
//! Identity, address and (for agents) the state store are fixed for the life of
//! the process and handed to coordination logic explicitly.

use std::net::IpAddr;
use thiserror::Error;
use tracing::info;

use crate::config::ComponentConfig;
use crate::identity::{generate_component_identity, ComponentId, ComponentType, FallbackFingerprint, IdentityError, MacAddressFingerprint, StaticFingerprint};
use crate::net::outbound_ip;
use crate::state::{StateError, StateStore};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("cannot assign component identity: {0}")] Identity(#[from] IdentityError),
    #[error("cannot initialise state store: {0}")] State(#[from] StateError),
}

#[derive(Debug, Clone)]
pub struct ComponentContext {
    pub component_type: ComponentType,
    pub identity: ComponentId,
    pub ip: IpAddr,
    pub state: Option<StateStore>,
}

impl ComponentContext {
    pub fn new(component_type: ComponentType, identity: ComponentId, ip: IpAddr) -> Self {
        Self { component_type, identity, ip, state: None }
    }

    pub fn with_state(mut self, store: StateStore) -> Self { self.state = Some(store); self }

    /// Startup sequence: identity from the hardware fingerprint (or the configured
    /// `fingerprint` when lookup fails), outbound address, and for agents a fresh
    /// state file in `waiting_gm`.
    pub fn bootstrap(component_type: ComponentType, cfg: &ComponentConfig) -> Result<Self, ContextError> {
        let identity = match cfg.get_str("fingerprint") {
            Some(fp) => generate_component_identity(&FallbackFingerprint { primary: MacAddressFingerprint, fallback: StaticFingerprint(fp.to_string()) })?,
            None => generate_component_identity(&MacAddressFingerprint)?,
        };
        let ctx = Self::new(component_type, identity, outbound_ip());
        let ctx = if component_type == ComponentType::Agent {
            let store = cfg.state_store();
            store.init()?;
            ctx.with_state(store)
        } else {
            ctx
        };
        info!(component = %ctx.component_type, id = %ctx.identity, ip = %ctx.ip, "component context ready");
        Ok(ctx)
    }
}
