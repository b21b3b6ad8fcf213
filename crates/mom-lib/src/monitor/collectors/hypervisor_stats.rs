//! Hypervisor view of a guest's memory

use super::{Collector, CollectorContext};
use crate::hypervisor::Hypervisor;
use crate::record::Record;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Reports, under the `libvirt` key, the domain `state`, `maxmem` and
/// `curmem` (MB) plus the balloon driver statistics when available.
pub struct GuestHypervisor {
    hypervisor: Arc<dyn Hypervisor>,
    domain_id: String,
    memstats_available: AtomicBool,
}

impl GuestHypervisor {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, domain_id: impl Into<String>) -> Self {
        Self {
            hypervisor,
            domain_id: domain_id.into(),
            memstats_available: AtomicBool::new(true),
        }
    }

    pub fn create(context: &CollectorContext) -> Result<Arc<dyn Collector>> {
        let hypervisor = context
            .hypervisor
            .clone()
            .context("GuestHypervisor requires a hypervisor connection")?;
        let domain_id = context
            .properties
            .id
            .clone()
            .with_context(|| format!("{} has no domain id", context.properties.name))?;
        Ok(Arc::new(Self::new(hypervisor, domain_id)))
    }
}

#[async_trait]
impl Collector for GuestHypervisor {
    fn name(&self) -> &str {
        "GuestHypervisor"
    }

    async fn collect(&self) -> Result<Record> {
        let info = self
            .hypervisor
            .domain_info(&self.domain_id)
            .await
            .context("Failed to get domain info")?;

        let mut stats = Record::new();
        stats.insert("state".to_string(), Value::from(info.state.code()));
        stats.insert("maxmem".to_string(), Value::from(info.max_mem_mb));
        stats.insert("curmem".to_string(), Value::from(info.cur_mem_mb));

        // Balloon statistics depend on the guest driver; only log the first miss
        match self.hypervisor.memory_stats(&self.domain_id).await {
            Ok(memory_stats) => {
                stats.extend(memory_stats);
                self.memstats_available.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                if self.memstats_available.swap(false, Ordering::SeqCst) {
                    debug!(domain = %self.domain_id, error = %e, "Memory stats are not available");
                }
            }
        }

        let mut record = Record::new();
        record.insert("libvirt".to_string(), Value::Object(stats));
        Ok(record)
    }
}
