//! Memory Overcommitment Manager library
//!
//! This crate provides the core functionality for:
//! - Host and guest statistics collection
//! - Guest discovery and per-guest monitoring
//! - The host control loop (inquire, allocate, notify, balloon)
//! - The guest RPC server, policy and resource control
//! - Health checks and observability

pub mod communication;
pub mod config;
pub mod daemon;
pub mod data_log;
pub mod error;
pub mod guest;
pub mod guest_manager;
pub mod health;
pub mod host_policy;
pub mod hypervisor;
pub mod memory;
pub mod monitor;
pub mod observability;
pub mod record;
pub mod registry;
pub mod terminable;

#[cfg(test)]
mod testing;

pub use config::{GuestConfig, HostConfig};
pub use daemon::{MomGuestDaemon, MomHostDaemon};
pub use health::{
    ComponentHealth, ComponentStatus, DaemonStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use observability::{MomMetrics, StructuredLogger};
pub use record::Record;
pub use terminable::Terminable;
