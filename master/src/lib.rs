pub mod attestation;
pub mod auth;
pub mod constants;
pub mod event_bridge;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod settings;
pub mod store;
pub mod supervisor;
