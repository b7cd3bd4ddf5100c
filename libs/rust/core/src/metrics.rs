//! Protocol counters on the global OpenTelemetry meter. Without an installed
//! meter provider these are no-ops.
use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Meter};

static PROTOCOL_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fl_protocol"));

#[derive(Clone)]
pub struct ProtocolMetrics {
    pub messages_encoded: Counter<u64>,
    pub messages_decoded: Counter<u64>,
    pub decode_failures: Counter<u64>,
    pub state_transitions: Counter<u64>,
    pub rounds_completed: Counter<u64>,
    pub aggregation_failures: Counter<u64>,
}

pub static PROTOCOL_METRICS: Lazy<ProtocolMetrics> = Lazy::new(|| ProtocolMetrics {
    messages_encoded: PROTOCOL_METER.u64_counter("fl_messages_encoded_total").with_description("Protocol messages encoded").init(),
    messages_decoded: PROTOCOL_METER.u64_counter("fl_messages_decoded_total").with_description("Protocol messages decoded").init(),
    decode_failures: PROTOCOL_METER.u64_counter("fl_decode_failures_total").with_description("Protocol messages rejected by the decoder").init(),
    state_transitions: PROTOCOL_METER.u64_counter("fl_agent_state_transitions_total").with_description("Agent lifecycle transitions").init(),
    rounds_completed: PROTOCOL_METER.u64_counter("fl_rounds_completed_total").with_description("Aggregation rounds completed").init(),
    aggregation_failures: PROTOCOL_METER.u64_counter("fl_aggregation_failures_total").with_description("Updates rejected because they did not aggregate").init(),
});
