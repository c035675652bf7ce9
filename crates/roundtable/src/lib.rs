pub mod adapter_protocol;
pub mod client;
pub mod model;
pub mod protocol;
pub mod signal;
pub mod wire;

/// Default rendezvous service address used when none is configured.
pub const DEFAULT_RENDEZVOUS_HOST: &str = "127.0.0.1:50200";

/// Label applied when grouping discovered agent endpoints.
pub const ENDPOINT_GROUP_LABEL: &str = "AI Roundtable";
