// Common library shared by the endpoint agent and the record signer

pub mod config;
pub mod errors;
pub mod executor;
pub mod models;
pub mod operations;
pub mod records;
pub mod scheduler;
pub mod signing;
pub mod telemetry;
