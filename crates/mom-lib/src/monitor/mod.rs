//! Monitors and their collected history
//!
//! A [`Monitor`] runs its collectors, merges their output into one record
//! and keeps a bounded history of those records. The control loop never
//! reads a monitor directly: it asks for an [`Entity`] snapshot through
//! [`Monitor::interrogate`] and commits policy state back with
//! [`Entity::store_variables`].

pub mod collectors;
mod entity;
mod guest_monitor;
mod host_monitor;

#[cfg(test)]
mod tests;

pub use collectors::{Collector, CollectorContext, CollectorRegistry};
pub use entity::Entity;
pub use guest_monitor::GuestMonitor;
pub use host_monitor::HostMonitor;

use crate::communication::GuestClient;
use crate::data_log::DataLogger;
use crate::observability::MomMetrics;
use crate::record::{merge_records, now_secs, Record};
use crate::terminable::Terminable;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{info, warn};

/// Static identity of a monitored subject
#[derive(Debug, Clone, Default)]
pub struct Properties {
    pub name: String,
    /// `host` for the host monitor, the guest name otherwise
    pub source: String,
    /// Hypervisor domain id
    pub id: Option<String>,
    pub uuid: Option<String>,
    /// Address of the guest server
    pub address: Option<String>,
    pub guest_client: Option<GuestClient>,
}

impl Properties {
    pub fn host() -> Self {
        Self {
            name: "host".to_string(),
            source: "host".to_string(),
            ..Default::default()
        }
    }
}

/// Persistent monitor state shared with the entities taken from it
#[derive(Debug, Default)]
pub struct MonitorData {
    /// Merged samples, oldest first
    pub statistics: VecDeque<Record>,
    /// Policy variables committed by [`Entity::store_variables`]
    pub variables: Record,
}

pub(crate) fn lock_data(data: &Mutex<MonitorData>) -> MutexGuard<'_, MonitorData> {
    data.lock().unwrap_or_else(|e| e.into_inner())
}

/// Collector runner with a bounded sample history
pub struct Monitor {
    properties: Properties,
    collectors: Vec<Arc<dyn Collector>>,
    data: Arc<Mutex<MonitorData>>,
    history_length: usize,
    ready: AtomicBool,
    terminable: Terminable,
    data_logger: DataLogger,
    metrics: MomMetrics,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.properties.name)
            .field(
                "collectors",
                &self.collectors.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("history_length", &self.history_length)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Monitor {
    pub fn new(
        properties: Properties,
        collectors: Vec<Arc<dyn Collector>>,
        history_length: usize,
        terminable: Terminable,
    ) -> Self {
        let data_logger = DataLogger::new("monitor", properties.source.clone());
        Self {
            properties,
            collectors,
            data: Arc::new(Mutex::new(MonitorData::default())),
            history_length: history_length.max(1),
            ready: AtomicBool::new(false),
            terminable,
            data_logger,
            metrics: MomMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn terminable(&self) -> &Terminable {
        &self.terminable
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!(monitor = %self.name(), "Ready");
        }
    }

    pub fn set_not_ready(&self, reason: &str) {
        self.ready.store(false, Ordering::SeqCst);
        warn!(monitor = %self.name(), reason = %reason, "Not ready");
    }

    /// Run every collector once and push the merged record on the history.
    ///
    /// Collectors are merged in order, so a later collector wins on a key
    /// both produce. A failing collector is logged and skipped.
    pub async fn collect(&self) -> Record {
        let sample_start = now_secs();
        let timer = Instant::now();

        let mut merged = Record::new();
        for collector in &self.collectors {
            match collector.collect().await {
                Ok(data) => merge_records(&mut merged, data),
                Err(e) => {
                    self.metrics.inc_collection_errors();
                    if self.terminable.should_run() {
                        warn!(
                            monitor = %self.name(),
                            collector = %collector.name(),
                            error = %e,
                            "Collection error"
                        );
                    }
                }
            }
        }

        let sample_end = now_secs();
        self.metrics
            .observe_collection_latency(timer.elapsed().as_secs_f64());

        {
            let mut data = lock_data(&self.data);
            data.statistics.push_back(merged.clone());
            while data.statistics.len() > self.history_length {
                data.statistics.pop_front();
            }
        }

        self.data_logger
            .append_data(merged.clone(), sample_start, sample_end);
        merged
    }

    /// Snapshot the monitor for one control cycle; `None` until ready
    pub fn interrogate(&self) -> Option<Entity> {
        if !self.is_ready() {
            warn!(monitor = %self.name(), "Not ready yet for interrogation");
            return None;
        }

        let data = lock_data(&self.data);
        Some(Entity::new(
            self.properties.clone(),
            data.statistics.iter().cloned().collect(),
            data.variables.clone(),
            self.data.clone(),
        ))
    }

    /// Merge `variables` into the persistent variables
    pub fn update_variables(&self, variables: Record) {
        lock_data(&self.data).variables.extend(variables);
    }

    pub fn variables(&self) -> Record {
        lock_data(&self.data).variables.clone()
    }

    /// Most recent merged sample
    pub fn latest(&self) -> Option<Record> {
        lock_data(&self.data).statistics.back().cloned()
    }

    pub fn history_len(&self) -> usize {
        lock_data(&self.data).statistics.len()
    }
}
