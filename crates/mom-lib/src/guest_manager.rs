//! Guest discovery and monitor lifecycle
//!
//! Polls the hypervisor's active domain list, starts one [`GuestMonitor`]
//! task per new domain and reaps monitors whose task ended or whose domain
//! disappeared.

use crate::communication::Connector;
use crate::config::{secs, HostConfig};
use crate::hypervisor::Hypervisor;
use crate::monitor::{CollectorRegistry, Entity, GuestMonitor};
use crate::observability::{MomMetrics, StructuredLogger};
use crate::terminable::Terminable;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct TrackedGuest {
    monitor: GuestMonitor,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// Registry of monitored guests, keyed by domain id
pub struct GuestManager {
    guests: DashMap<String, TrackedGuest>,
    config: HostConfig,
    hypervisor: Arc<dyn Hypervisor>,
    connector: Arc<dyn Connector>,
    registry: CollectorRegistry,
    interval: Duration,
    max_guests: usize,
    terminable: Terminable,
    metrics: MomMetrics,
    logger: StructuredLogger,
}

impl std::fmt::Debug for GuestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestManager")
            .field("guests", &self.len())
            .field("interval", &self.interval)
            .field("max_guests", &self.max_guests)
            .finish()
    }
}

impl GuestManager {
    pub fn new(
        config: &HostConfig,
        hypervisor: Arc<dyn Hypervisor>,
        connector: Arc<dyn Connector>,
        registry: CollectorRegistry,
        terminable: Terminable,
    ) -> Self {
        Self {
            guests: DashMap::new(),
            config: config.clone(),
            hypervisor,
            connector,
            registry,
            interval: secs(config.guest_manager.interval),
            max_guests: config.guest_manager.max_guests,
            terminable,
            metrics: MomMetrics::new(),
            logger: StructuredLogger::new("momhostd"),
        }
    }

    pub fn len(&self) -> usize {
        self.guests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guests.is_empty()
    }

    /// Guest name → readiness of its monitor
    pub fn get_guests_readiness(&self) -> BTreeMap<String, bool> {
        self.guests
            .iter()
            .map(|guest| (guest.monitor.name().to_string(), guest.monitor.is_ready()))
            .collect()
    }

    /// Snapshot every ready guest, keyed by domain id
    pub fn interrogate(&self) -> BTreeMap<String, Entity> {
        self.guests
            .iter()
            .filter_map(|guest| {
                guest
                    .monitor
                    .interrogate()
                    .map(|entity| (guest.key().clone(), entity))
            })
            .collect()
    }

    /// Start monitors for domains not tracked yet.
    ///
    /// Monitor construction talks to the hypervisor, so the table is only
    /// locked to compute the spawn set and to register the result.
    pub async fn spawn_guest_monitors(&self, domain_ids: &[String]) {
        let mut spawn_list: Vec<&String> = domain_ids
            .iter()
            .filter(|id| !self.guests.contains_key(id.as_str()))
            .collect();

        let free_slots = self.max_guests.saturating_sub(self.guests.len());
        if spawn_list.len() > free_slots {
            warn!(
                new_guests = spawn_list.len(),
                free_slots = free_slots,
                max_guests = self.max_guests,
                "Guest limit reached, skipping domains"
            );
            spawn_list.truncate(free_slots);
        }

        for id in spawn_list {
            if !self.terminable.should_run() {
                return;
            }

            let monitor = match GuestMonitor::new(
                id,
                &self.config,
                &self.registry,
                self.hypervisor.clone(),
                self.connector.as_ref(),
                self.terminable.child(),
            )
            .await
            {
                Ok(monitor) => monitor,
                Err(e) => {
                    warn!(domain_id = %id, error = %format!("{:#}", e), "Failed to create guest monitor");
                    continue;
                }
            };

            match self.guests.entry(id.clone()) {
                Entry::Occupied(_) => {
                    debug!(domain_id = %id, "Guest is already monitored");
                }
                Entry::Vacant(slot) => {
                    self.logger.log_guest_added(monitor.name(), id);
                    let handle = tokio::spawn(monitor.clone().run());
                    slot.insert(TrackedGuest { monitor, handle });
                }
            }
        }
    }

    /// Remove monitors whose task ended and stop those whose domain is gone
    pub async fn check_threads(&self, domain_ids: &[String]) {
        let active: HashSet<&str> = domain_ids.iter().map(String::as_str).collect();

        let stale: Vec<(String, &'static str)> = self
            .guests
            .iter()
            .filter_map(|guest| {
                if guest.handle.is_finished() {
                    Some((guest.key().clone(), "monitor ended"))
                } else if !active.contains(guest.key().as_str()) {
                    Some((guest.key().clone(), "domain ended"))
                } else {
                    None
                }
            })
            .collect();

        for (id, reason) in stale {
            let Some((_, guest)) = self.guests.remove(&id) else {
                continue;
            };
            guest.monitor.terminate();
            self.logger.log_guest_removed(guest.monitor.name(), reason);

            if guest.handle.is_finished() {
                match guest.handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(guest = %guest.monitor.name(), error = %format!("{:#}", e), "Guest monitor failed")
                    }
                    Err(e) => warn!(guest = %guest.monitor.name(), error = %e, "Guest monitor panicked"),
                }
            }
        }
    }

    /// Terminate every guest monitor and wait for the tasks to end
    pub async fn wait_for_guest_monitors(&self) {
        let ids: Vec<String> = self.guests.iter().map(|guest| guest.key().clone()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, guest)) = self.guests.remove(&id) {
                guest.monitor.terminate();
                handles.push(guest.handle);
            }
        }
        futures::future::join_all(handles).await;
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            max_guests = self.max_guests,
            "Starting guest manager"
        );

        while self.terminable.should_run() {
            let start = Instant::now();
            match self.hypervisor.list_domain_ids().await {
                Ok(domain_ids) => {
                    self.spawn_guest_monitors(&domain_ids).await;
                    self.check_threads(&domain_ids).await;
                }
                Err(e) => warn!(error = %format!("{:#}", e), "Failed to list active domains"),
            }
            self.metrics.set_guests_monitored(self.len() as i64);

            self.terminable
                .terminable_sleep(self.interval.saturating_sub(start.elapsed()))
                .await;
        }

        self.wait_for_guest_monitors().await;
        self.metrics.set_guests_monitored(0);
        info!("Guest manager ended");
    }
}
