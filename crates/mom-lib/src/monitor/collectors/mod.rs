//! Data collectors
//!
//! A collector produces one partial record per call. Monitors construct
//! their collectors by name from a [`CollectorRegistry`], in the order the
//! configuration lists them.

mod applications_stats;
mod cpu_usage;
mod guest_stats;
mod hypervisor_stats;
mod ksm_stats;
mod memory_stats;

pub use applications_stats::ApplicationsStats;
pub use cpu_usage::CpuUsage;
pub use guest_stats::GuestStats;
pub use hypervisor_stats::GuestHypervisor;
pub use ksm_stats::KsmStats;
pub use memory_stats::MemoryStatistics;

/// Kernel clock ticks per second (`USER_HZ`), the unit of `/proc` CPU times
pub(crate) const CLOCK_TICKS: f64 = 100.0;

use super::Properties;
use crate::hypervisor::Hypervisor;
use crate::record::Record;
use crate::registry::Registry;
use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

pub use async_trait::async_trait;

/// Trait for data collection implementations
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    /// Collect one partial record
    async fn collect(&self) -> Result<Record>;
}

/// What a collector factory may bind to
#[derive(Clone)]
pub struct CollectorContext {
    pub properties: Properties,
    pub hypervisor: Option<Arc<dyn Hypervisor>>,
    /// Process patterns for `ApplicationsStats`
    pub applications: Vec<String>,
}

impl CollectorContext {
    pub fn new(properties: Properties) -> Self {
        Self {
            properties,
            hypervisor: None,
            applications: Vec::new(),
        }
    }

    pub fn with_applications(mut self, applications: Vec<String>) -> Self {
        self.applications = applications;
        self
    }

    pub fn with_hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }
}

pub type CollectorFactory = fn(&CollectorContext) -> Result<Arc<dyn Collector>>;

/// Collector factories by name
#[derive(Clone)]
pub struct CollectorRegistry {
    inner: Registry<CollectorFactory>,
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CollectorRegistry {
    pub fn empty() -> Self {
        Self {
            inner: Registry::new("collector"),
        }
    }

    /// Registry holding the built-in collectors
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let builtin: [(&str, CollectorFactory); 6] = [
            ("MemoryStatistics", MemoryStatistics::create),
            ("CpuUsage", CpuUsage::create),
            ("KsmStats", KsmStats::create),
            ("ApplicationsStats", ApplicationsStats::create),
            ("GuestStats", GuestStats::create),
            ("GuestHypervisor", GuestHypervisor::create),
        ];
        for (name, factory) in builtin {
            registry.inner.insert(name, factory);
        }
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: CollectorFactory,
    ) -> Result<(), crate::error::RegistryError> {
        self.inner.register(name, factory)
    }

    /// Build the named collectors in order.
    ///
    /// Unknown names are configuration errors. A collector that fails to
    /// construct for this subject is logged and left out.
    pub fn create_all(
        &self,
        names: &[String],
        context: &CollectorContext,
    ) -> Result<Vec<Arc<dyn Collector>>> {
        let mut collectors = Vec::with_capacity(names.len());
        for name in names {
            let factory = self.inner.get(name)?;
            match factory(context) {
                Ok(collector) => collectors.push(collector),
                Err(e) => warn!(
                    monitor = %context.properties.name,
                    collector = %name,
                    error = %e,
                    "Failed to initiate collector"
                ),
            }
        }
        Ok(collectors)
    }
}
