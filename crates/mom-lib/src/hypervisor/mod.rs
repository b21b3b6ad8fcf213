//! Hypervisor interface
//!
//! The control loop only needs to enumerate running domains, read their
//! memory configuration and resize their balloon. [`VirshHypervisor`] does
//! this through the `virsh` command line tool.

mod virsh;

pub use virsh::VirshHypervisor;

use crate::record::Record;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// libvirt domain state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
}

impl DomainState {
    /// Numeric code as reported by libvirt
    pub fn code(&self) -> u8 {
        match self {
            DomainState::NoState => 0,
            DomainState::Running => 1,
            DomainState::Blocked => 2,
            DomainState::Paused => 3,
            DomainState::Shutdown => 4,
            DomainState::Shutoff => 5,
            DomainState::Crashed => 6,
            DomainState::Suspended => 7,
        }
    }

    /// Parse the state string printed by `virsh dominfo`
    pub fn parse(state: &str) -> Self {
        match state.trim() {
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" | "shutdown" => DomainState::Shutdown,
            "shut off" | "shutoff" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::Suspended,
            _ => DomainState::NoState,
        }
    }
}

/// Static and memory information about one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub id: String,
    pub name: String,
    pub uuid: Option<String>,
    pub state: DomainState,
    pub max_mem_mb: f64,
    pub cur_mem_mb: f64,
    /// Address of the guest server, when the hypervisor knows it
    pub address: Option<String>,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Ids of the currently active domains
    async fn list_domain_ids(&self) -> Result<Vec<String>>;

    async fn domain_info(&self, id: &str) -> Result<DomainInfo>;

    /// Balloon driver statistics, memory sizes in MB
    async fn memory_stats(&self, id: &str) -> Result<Record>;

    /// Resize the domain's balloon to `target_mb`
    async fn set_memory(&self, id: &str, target_mb: f64) -> Result<()>;
}
