//! Per-guest monitor task

use super::{CollectorContext, CollectorRegistry, Entity, Monitor, Properties};
use crate::communication::{Allocation, Connector, GuestClient};
use crate::config::{secs, HostConfig};
use crate::hypervisor::Hypervisor;
use crate::terminable::Terminable;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-attempt timeout while probing the guest server
const READINESS_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe attempts before the guest is given up on
const READINESS_MAX_RETRIES: u32 = 24;

/// Monitor bound to one running guest.
///
/// The monitor becomes ready once the guest server answers and has been
/// told its current memory allocation.
#[derive(Clone)]
pub struct GuestMonitor {
    monitor: Arc<Monitor>,
    domain_id: String,
    client: GuestClient,
    hypervisor: Arc<dyn Hypervisor>,
    interval: Duration,
    readiness_interval: Duration,
}

impl std::fmt::Debug for GuestMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMonitor")
            .field("name", &self.name())
            .field("domain_id", &self.domain_id)
            .field("ready", &self.monitor.is_ready())
            .finish()
    }
}

impl GuestMonitor {
    pub async fn new(
        domain_id: &str,
        config: &HostConfig,
        registry: &CollectorRegistry,
        hypervisor: Arc<dyn Hypervisor>,
        connector: &dyn Connector,
        terminable: Terminable,
    ) -> Result<Self> {
        let info = hypervisor
            .domain_info(domain_id)
            .await
            .with_context(|| format!("Failed to get information of domain {}", domain_id))?;

        let address = info.address.clone().unwrap_or_else(|| info.name.clone());
        let client = connector.connect(&info.name, &address);

        let properties = Properties {
            name: info.name.clone(),
            source: info.name.clone(),
            id: Some(domain_id.to_string()),
            uuid: info.uuid.clone(),
            address: Some(address),
            guest_client: Some(client.clone()),
        };
        let context =
            CollectorContext::new(properties.clone()).with_hypervisor(hypervisor.clone());
        let collectors = registry.create_all(&config.guest_monitor.collectors, &context)?;

        let monitor = Monitor::new(
            properties,
            collectors,
            config.monitor.sample_history_length,
            terminable,
        );

        Ok(Self {
            monitor: Arc::new(monitor),
            domain_id: domain_id.to_string(),
            client,
            hypervisor,
            interval: secs(config.guest_monitor.interval),
            readiness_interval: secs(config.guest_monitor.check_readiness_interval),
        })
    }

    pub fn name(&self) -> &str {
        self.monitor.name()
    }

    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn is_ready(&self) -> bool {
        self.monitor.is_ready()
    }

    pub fn interrogate(&self) -> Option<Entity> {
        self.monitor.interrogate()
    }

    pub fn terminate(&self) {
        self.monitor.terminable().terminate();
    }

    /// Wait for the guest server, then push the current allocation as an
    /// authoritative notification. Returns `false` if terminated first.
    pub async fn check_guest_readiness(&self) -> Result<bool> {
        debug!(guest = %self.name(), "Checking readiness");

        let terminable = self.monitor.terminable();
        let ready = self
            .client
            .wait_for_server(
                self.readiness_interval,
                READINESS_PROBE_TIMEOUT,
                READINESS_MAX_RETRIES,
                terminable,
            )
            .await?;
        if !ready {
            return Ok(false);
        }

        let info = self.hypervisor.domain_info(&self.domain_id).await?;
        let alloc = Allocation::from([("memory".to_string(), info.cur_mem_mb.floor())]);
        self.client
            .notify(alloc, None, self.client.default_timeout())
            .await
            .context("Failed to notify the guest of its current allocation")?;

        self.monitor.set_ready();
        Ok(true)
    }

    /// Readiness handshake, then collect on the configured interval until
    /// terminated
    pub async fn run(self) -> Result<()> {
        let result = self.monitor_loop().await;
        self.client.close().await;
        result
    }

    async fn monitor_loop(&self) -> Result<()> {
        if !self.check_guest_readiness().await? {
            return Ok(());
        }

        info!(
            guest = %self.name(),
            interval_secs = self.interval.as_secs_f64(),
            "Monitoring guest"
        );

        let terminable = self.monitor.terminable().clone();
        while terminable.should_run() {
            let start = Instant::now();
            self.monitor.collect().await;
            terminable
                .terminable_sleep(self.interval.saturating_sub(start.elapsed()))
                .await;
        }
        Ok(())
    }
}
