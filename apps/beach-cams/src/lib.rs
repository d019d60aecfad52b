pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod telemetry;
pub mod transport;
