//! Host monitor task

use super::{CollectorContext, CollectorRegistry, Entity, Monitor, Properties};
use crate::config::{secs, HostConfig};
use crate::hypervisor::Hypervisor;
use crate::terminable::Terminable;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Collects host statistics on a fixed interval. Ready immediately.
#[derive(Debug, Clone)]
pub struct HostMonitor {
    monitor: Arc<Monitor>,
    interval: Duration,
}

impl HostMonitor {
    pub fn new(
        config: &HostConfig,
        registry: &CollectorRegistry,
        hypervisor: Option<Arc<dyn Hypervisor>>,
        terminable: Terminable,
    ) -> Result<Self> {
        let properties = Properties::host();
        let mut context = CollectorContext::new(properties.clone())
            .with_applications(config.host_monitor.applications.clone());
        context.hypervisor = hypervisor;
        let collectors = registry.create_all(&config.host_monitor.collectors, &context)?;

        let monitor = Monitor::new(
            properties,
            collectors,
            config.monitor.sample_history_length,
            terminable,
        );
        monitor.set_ready();

        Ok(Self {
            monitor: Arc::new(monitor),
            interval: secs(config.host_monitor.interval),
        })
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn interrogate(&self) -> Option<Entity> {
        self.monitor.interrogate()
    }

    /// Collect, then sleep out the rest of the interval, until terminated
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            "Starting host monitor"
        );

        let terminable = self.monitor.terminable().clone();
        while terminable.should_run() {
            let start = Instant::now();
            self.monitor.collect().await;
            terminable
                .terminable_sleep(self.interval.saturating_sub(start.elapsed()))
                .await;
        }

        info!("Host monitor ended");
    }
}
