//! Positional wire layouts.
//!
//! Every protocol message travels as a JSON array. The index of each field is
//! part of the contract, so each layout is declared once as a `#[repr(usize)]`
//! location enum and both the encoder and the decoder address fields through it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;

use super::CodecError;

pub trait Location: Copy + 'static {
    const LAYOUT: &'static str;
    const ORDER: &'static [Self];
    fn index(self) -> usize;
    fn field(self) -> &'static str;
}

macro_rules! wire_layout {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($var:ident = $idx:literal => $field:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(usize)]
        pub enum $name { $($var = $idx),+ }

        impl Location for $name {
            const LAYOUT: &'static str = $label;
            const ORDER: &'static [Self] = &[$($name::$var),+];
            fn index(self) -> usize { self as usize }
            fn field(self) -> &'static str { match self { $($name::$var => $field),+ } }
        }
    };
}

wire_layout!(
    /// Agent → aggregator registration.
    ParticipateLocation, "participate" {
        MsgType = 0 => "msg_type",
        AgentId = 1 => "agent_id",
        ModelId = 2 => "model_id",
        LocalModels = 3 => "local_models",
        InitFlag = 4 => "init_flag",
        SimilarityFlag = 5 => "similarity_flag",
        ExchangeSocket = 6 => "exchange_socket",
        GenerationTime = 7 => "generation_time",
        MetaData = 8 => "meta_data",
        AgentIp = 9 => "agent_ip",
    }
);

wire_layout!(
    /// Agent → aggregator local model upload after a training pass.
    UpdateLocation, "update" {
        MsgType = 0 => "msg_type",
        AgentId = 1 => "agent_id",
        ModelId = 2 => "model_id",
        LocalModels = 3 => "local_models",
        GenerationTime = 4 => "generation_time",
        MetaData = 5 => "meta_data",
    }
);

wire_layout!(
    /// Aggregator → agent participation confirmation.
    WelcomeLocation, "welcome" {
        MsgType = 0 => "msg_type",
        AggregatorId = 1 => "aggregator_id",
        ModelId = 2 => "model_id",
        GlobalModels = 3 => "global_models",
        Round = 4 => "round",
        AgentId = 5 => "agent_id",
        ExchangeSocket = 6 => "exchange_socket",
        ReceiveSocket = 7 => "receive_socket",
    }
);

wire_layout!(
    /// Aggregator → agent global model distribution.
    GmDistributionLocation, "global model distribution" {
        MsgType = 0 => "msg_type",
        AggregatorId = 1 => "aggregator_id",
        ModelId = 2 => "model_id",
        Round = 3 => "round",
        GlobalModels = 4 => "global_models",
    }
);

wire_layout!(
    DbPushLocation, "database push" {
        MsgType = 0 => "msg_type",
        ComponentId = 1 => "component_id",
        Round = 2 => "round",
        ModelType = 3 => "model_type",
        Models = 4 => "models",
        ModelId = 5 => "model_id",
        GenerationTime = 6 => "generation_time",
        MetaData = 7 => "meta_data",
        RequestIdList = 8 => "request_id_list",
    }
);

wire_layout!(
    DbGetListLocation, "database get_list" {
        MsgType = 0 => "msg_type",
        ComponentId = 1 => "component_id",
        ModelType = 2 => "model_type",
    }
);

wire_layout!(
    DbGetModelsLocation, "database get_models" {
        MsgType = 0 => "msg_type",
        ComponentId = 1 => "component_id",
        ModelType = 2 => "model_type",
        ModelId = 3 => "model_id",
    }
);

/// Reads the discriminant every layout keeps at position 0.
pub(crate) fn message_code<'a>(value: &'a Value, family: &'static str) -> Result<(&'a [Value], i64), CodecError> {
    let items = value.as_array().ok_or(CodecError::NotASequence { layout: family })?;
    let code = items
        .first()
        .ok_or(CodecError::MissingField { layout: family, field: "msg_type", index: 0 })?
        .as_i64()
        .ok_or(CodecError::InvalidMessageType { family })?;
    Ok((items, code))
}

pub(crate) struct WireReader<'a, L> {
    items: &'a [Value],
    _layout: PhantomData<L>,
}

impl<'a, L: Location> WireReader<'a, L> {
    pub(crate) fn new(items: &'a [Value]) -> Self { Self { items, _layout: PhantomData } }

    pub(crate) fn raw(&self, loc: L) -> Option<&'a Value> {
        self.items.get(loc.index()).filter(|v| !v.is_null())
    }

    pub(crate) fn required<T: DeserializeOwned>(&self, loc: L) -> Result<T, CodecError> {
        let v = self.raw(loc).ok_or(CodecError::MissingField { layout: L::LAYOUT, field: loc.field(), index: loc.index() })?;
        self.convert(loc, v)
    }

    /// Absent or `null` positions decode as `None`; present but ill-typed ones are errors.
    pub(crate) fn optional<T: DeserializeOwned>(&self, loc: L) -> Result<Option<T>, CodecError> {
        self.raw(loc).map(|v| self.convert(loc, v)).transpose()
    }

    fn convert<T: DeserializeOwned>(&self, loc: L, v: &Value) -> Result<T, CodecError> {
        serde_json::from_value(v.clone()).map_err(|source| CodecError::InvalidField { layout: L::LAYOUT, field: loc.field(), index: loc.index(), source })
    }
}

pub(crate) struct WireWriter<L> {
    slots: Vec<Option<Value>>,
    _layout: PhantomData<L>,
}

impl<L: Location> WireWriter<L> {
    pub(crate) fn new() -> Self { Self { slots: vec![None; L::ORDER.len()], _layout: PhantomData } }

    pub(crate) fn set<T: Serialize + ?Sized>(&mut self, loc: L, value: &T) -> Result<&mut Self, CodecError> {
        self.slots[loc.index()] = Some(serde_json::to_value(value)?);
        Ok(self)
    }

    pub(crate) fn finish(self) -> Result<Value, CodecError> {
        let mut out = Vec::with_capacity(self.slots.len());
        for (slot, loc) in self.slots.into_iter().zip(L::ORDER) {
            out.push(slot.ok_or(CodecError::MissingField { layout: L::LAYOUT, field: loc.field(), index: loc.index() })?);
        }
        Ok(Value::Array(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_dense<L: Location + std::fmt::Debug>() {
        for (i, loc) in L::ORDER.iter().enumerate() { assert_eq!(loc.index(), i, "{} {:?}", L::LAYOUT, loc); }
    }

    #[test]
    fn layouts_are_dense_and_ordered() {
        assert_dense::<ParticipateLocation>();
        assert_dense::<UpdateLocation>();
        assert_dense::<WelcomeLocation>();
        assert_dense::<GmDistributionLocation>();
        assert_dense::<DbPushLocation>();
        assert_dense::<DbGetListLocation>();
        assert_dense::<DbGetModelsLocation>();
        assert_eq!(ParticipateLocation::ORDER.len(), 10);
        assert_eq!(DbPushLocation::ORDER.len(), 9);
        assert_eq!(GmDistributionLocation::ORDER.len(), 5);
    }

    #[test]
    fn participate_indices_match_contract() {
        assert_eq!(ParticipateLocation::LocalModels.index(), 3);
        assert_eq!(ParticipateLocation::ExchangeSocket.index(), 6);
        assert_eq!(ParticipateLocation::AgentIp.index(), 9);
        assert_eq!(DbPushLocation::RequestIdList.index(), 8);
        assert_eq!(GmDistributionLocation::GlobalModels.index(), 4);
    }

    #[test]
    fn writer_rejects_unfilled_slot() {
        let mut w = WireWriter::<DbGetListLocation>::new();
        w.set(DbGetListLocation::MsgType, &1).unwrap();
        w.set(DbGetListLocation::ModelType, &0).unwrap();
        let err = w.finish().unwrap_err();
        assert!(matches!(err, CodecError::MissingField { index: 1, .. }));
    }

    #[test]
    fn reader_distinguishes_missing_null_and_bad() {
        let items = vec![Value::from(0), Value::Null, Value::from("x")];
        let r = WireReader::<DbGetListLocation>::new(&items);
        assert_eq!(r.optional::<String>(DbGetListLocation::ComponentId).unwrap(), None);
        assert!(r.required::<String>(DbGetListLocation::ComponentId).is_err());
        assert!(matches!(r.required::<u8>(DbGetListLocation::ModelType), Err(CodecError::InvalidField { index: 2, .. })));
    }

    #[test]
    fn message_code_borrows_items_from_value() {
        let value = serde_json::json!([2, "db", 1, "set"]);
        let (items, code) = message_code(&value, "database").unwrap();
        assert_eq!(code, 2);
        assert_eq!(items.len(), 4);
        assert!(matches!(message_code(&serde_json::json!({}), "agent"), Err(CodecError::NotASequence { layout: "agent" })));
        assert!(matches!(message_code(&serde_json::json!([]), "agent"), Err(CodecError::MissingField { index: 0, .. })));
        assert!(matches!(message_code(&serde_json::json!(["x"]), "agent"), Err(CodecError::InvalidMessageType { family: "agent" })));
    }
}
