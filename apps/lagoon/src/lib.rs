pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod guards;
pub mod mutation;
pub mod protocol;
pub mod reconcile;
pub mod store;
pub mod telemetry;
pub mod typing;
