//! Component and model-set identifiers.
//!
//! Both identifiers are SHA-256 hex digests over a concatenated string:
//! - component: `{fingerprint}{creation_time}`
//! - model set: `{type_prefix}{creator_id}{generation_time}`
//!
//! The model-set derivation is pure, which lets the payload decoder recompute an
//! identifier that older message formats never carried.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("machine fingerprint unavailable: {0}")] FingerprintUnavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ComponentId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ModelSetId(pub String);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl fmt::Display for ModelSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ComponentId { fn from(s: &str) -> Self { Self(s.to_string()) } }
impl From<&str> for ModelSetId { fn from(s: &str) -> Self { Self(s.to_string()) } }

/// Kind of component that creates identifiers. The prefix string is hashed into
/// model-set identifiers, so it is part of the wire contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType { Agent, Aggregator, Database }

impl ComponentType {
    pub fn prefix(&self) -> &'static str {
        match self { ComponentType::Agent => "agent", ComponentType::Aggregator => "aggregator", ComponentType::Database => "database" }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.prefix()) }
}

impl std::str::FromStr for ComponentType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "agent" => Ok(ComponentType::Agent),
            "aggregator" => Ok(ComponentType::Aggregator),
            "database" | "db" => Ok(ComponentType::Database),
            other => Err(format!("unknown component type: {other}")),
        }
    }
}

/// Stable per-machine input to component identity generation.
pub trait FingerprintSource {
    fn fingerprint(&self) -> Result<String, IdentityError>;
}

/// Hardware address of the first usable network interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacAddressFingerprint;

impl FingerprintSource for MacAddressFingerprint {
    fn fingerprint(&self) -> Result<String, IdentityError> {
        match mac_address::get_mac_address() {
            Ok(Some(mac)) => Ok(mac.to_string().to_ascii_lowercase()),
            Ok(None) => Err(IdentityError::FingerprintUnavailable("no network interface with a hardware address".into())),
            Err(e) => Err(IdentityError::FingerprintUnavailable(e.to_string())),
        }
    }
}

/// Configured fingerprint, used when hardware lookup is not possible.
#[derive(Debug, Clone)]
pub struct StaticFingerprint(pub String);

impl FingerprintSource for StaticFingerprint {
    fn fingerprint(&self) -> Result<String, IdentityError> { Ok(self.0.clone()) }
}

/// Tries `primary`, then `fallback`.
pub struct FallbackFingerprint<P, F> { pub primary: P, pub fallback: F }

impl<P: FingerprintSource, F: FingerprintSource> FingerprintSource for FallbackFingerprint<P, F> {
    fn fingerprint(&self) -> Result<String, IdentityError> {
        self.primary.fingerprint().or_else(|e| {
            tracing::warn!(error = %e, "primary fingerprint unavailable, using fallback");
            self.fallback.fingerprint()
        })
    }
}

/// Current wall-clock time as float seconds since the Unix epoch (microsecond resolution).
pub fn unix_time() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Shortest round-trip rendering with a fractional part (`100.0`, `1700000000.25`).
/// Matches Python's float repr for `0` and `1e-4 <= |t| < 1e16`; outside that range
/// the exponent is written without sign padding (`1e16`, not `1e+16`).
pub fn render_time(t: f64) -> String { format!("{t:?}") }

fn sha256_hex(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn component_identity_from(fingerprint: &str, created_at: f64) -> ComponentId {
    ComponentId(sha256_hex(&format!("{fingerprint}{}", render_time(created_at))))
}

pub fn generate_component_identity(source: &dyn FingerprintSource) -> Result<ComponentId, IdentityError> {
    let fingerprint = source.fingerprint()?;
    let id = component_identity_from(&fingerprint, unix_time());
    tracing::debug!(component_id = %id, "component identity generated");
    Ok(id)
}

pub fn generate_model_set_identity(component_type: ComponentType, creator: &ComponentId, generation_time: f64) -> ModelSetId {
    ModelSetId(sha256_hex(&format!("{}{}{}", component_type.prefix(), creator.0, render_time(generation_time))))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;
    impl FingerprintSource for Broken {
        fn fingerprint(&self) -> Result<String, IdentityError> { Err(IdentityError::FingerprintUnavailable("test".into())) }
    }

    #[test]
    fn component_identity_is_deterministic_hex() {
        let a = component_identity_from("aa:bb:cc:dd:ee:ff", 1700000000.5);
        let b = component_identity_from("aa:bb:cc:dd:ee:ff", 1700000000.5);
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 64);
        assert!(a.0.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, component_identity_from("aa:bb:cc:dd:ee:ff", 1700000000.25));
    }

    #[test]
    fn matches_known_sha256_of_concatenation() {
        // sha256("agentX100.0")
        let id = generate_model_set_identity(ComponentType::Agent, &ComponentId::from("X"), 100.0);
        assert_eq!(id.0, sha256_hex("agentX100.0"));
        assert_eq!(sha256_hex(""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }

    #[test]
    fn model_set_identity_changes_with_each_input() {
        let creator = ComponentId::from("c1");
        let base = generate_model_set_identity(ComponentType::Agent, &creator, 10.0);
        assert_eq!(base, generate_model_set_identity(ComponentType::Agent, &creator, 10.0));
        assert_ne!(base, generate_model_set_identity(ComponentType::Aggregator, &creator, 10.0));
        assert_ne!(base, generate_model_set_identity(ComponentType::Agent, &ComponentId::from("c2"), 10.0));
        assert_ne!(base, generate_model_set_identity(ComponentType::Agent, &creator, 10.5));
    }

    #[test]
    fn time_rendering_keeps_fraction() {
        assert_eq!(render_time(100.0), "100.0");
        assert_eq!(render_time(1700000000.25), "1700000000.25");
        assert_eq!(render_time(0.0), "0.0");
        assert_eq!(render_time(0.0001), "0.0001");
        assert_eq!(render_time(1e15), "1000000000000000.0");
        assert_eq!(render_time(1e16), "1e16");
    }

    #[test]
    fn fallback_fingerprint_used_on_failure() {
        let src = FallbackFingerprint { primary: Broken, fallback: StaticFingerprint("node-7".into()) };
        assert_eq!(src.fingerprint().unwrap(), "node-7");
        assert!(generate_component_identity(&Broken).is_err());
        assert_eq!(generate_component_identity(&src).unwrap().0.len(), 64);
    }

    #[test]
    fn component_type_parses_prefixes() {
        assert_eq!("aggregator".parse::<ComponentType>().unwrap(), ComponentType::Aggregator);
        assert_eq!("db".parse::<ComponentType>().unwrap(), ComponentType::Database);
        assert!("trainer".parse::<ComponentType>().is_err());
    }
}
