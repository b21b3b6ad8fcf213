//! Daemon surfaces of the Memory Overcommitment Manager: configuration
//! loading and the health/metrics HTTP API

pub mod api;
pub mod config;
