pub mod config;
pub mod docker;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod ports;
pub mod registry;
pub mod server;
pub mod store;

pub use error::InstancerError;
pub use orchestrator::Orchestrator;
