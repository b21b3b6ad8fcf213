//! Guest-side resource control
//!
//! Waits for allocation targets from the local guest server and resizes the
//! application's memory to follow them. Grows are applied only once the
//! hypervisor has actually delivered the memory; shrinks are applied
//! `decrease_mem_time` seconds before the grace period runs out.

use crate::communication::{Allocation, GuestClient, TargetAllocation};
use crate::config::{secs, ResourceControlConfig};
use crate::memory::{is_memory_close, is_valid_mem, MemoryStats};
use crate::record::now_secs;
use crate::terminable::Terminable;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Step between two memory polls while waiting for a grow
const STATS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Retry delay when a grow has not fully materialized yet
const GROW_RETRY_WAIT: Duration = Duration::from_millis(100);

/// Remaining grace below this is treated as none (seconds)
const MIN_GRACE_PERIOD: f64 = 1e-2;

/// The application whose memory is being controlled
#[async_trait]
pub trait ApplicationControl: Send + Sync {
    /// Resize the application to fit `total` MB of guest memory.
    ///
    /// Returns the memory target the application settled on, if any.
    async fn change_mem(
        &self,
        total: f64,
        used: f64,
        cache_and_buff: f64,
        app_rss: f64,
    ) -> Result<Option<f64>>;

    /// Resident memory of the application in MB
    async fn application_rss(&self) -> f64 {
        f64::NAN
    }
}

/// Application control that only reports the memory it was handed
#[derive(Debug, Default)]
pub struct ReportingApplication;

#[async_trait]
impl ApplicationControl for ReportingApplication {
    async fn change_mem(
        &self,
        total: f64,
        used: f64,
        cache_and_buff: f64,
        _app_rss: f64,
    ) -> Result<Option<f64>> {
        info!(total_mb = total, used_mb = used, cache_mb = cache_and_buff, "Memory target");
        Ok(Some(total))
    }
}

/// Local memory statistics
#[async_trait]
pub trait MemorySource: Send + Sync {
    async fn memory_stats(&self) -> Result<MemoryStats>;
}

/// Reads a `/proc/meminfo`-formatted file
#[derive(Debug, Clone)]
pub struct MeminfoSource {
    path: PathBuf,
}

impl MeminfoSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for MeminfoSource {
    fn default() -> Self {
        Self::new("/proc/meminfo")
    }
}

#[async_trait]
impl MemorySource for MeminfoSource {
    async fn memory_stats(&self) -> Result<MemoryStats> {
        MemoryStats::load(&self.path).await
    }
}

pub struct DynamicResourceControl {
    client: GuestClient,
    application: Arc<dyn ApplicationControl>,
    memory: Arc<dyn MemorySource>,
    wait_timeout: Duration,
    decrease_mem_time: f64,
    epsilon: f64,
    stats_poll_timeout: Duration,
    /// Gap between the memory the host allocates and what the guest sees;
    /// unknown until the first authoritative notification
    memory_diff: Option<f64>,
    available_memory: f64,
    terminable: Terminable,
}

impl std::fmt::Debug for DynamicResourceControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicResourceControl")
            .field("wait_timeout", &self.wait_timeout)
            .field("memory_diff", &self.memory_diff)
            .field("available_memory", &self.available_memory)
            .finish()
    }
}

impl DynamicResourceControl {
    pub fn new(
        config: &ResourceControlConfig,
        client: GuestClient,
        application: Arc<dyn ApplicationControl>,
        memory: Arc<dyn MemorySource>,
        terminable: Terminable,
    ) -> Self {
        Self {
            client,
            application,
            memory,
            wait_timeout: secs(config.wait_timeout.max(1.0)),
            decrease_mem_time: config.decrease_mem_time.max(0.0),
            epsilon: config.epsilon.max(0.0),
            stats_poll_timeout: secs(config.stats_poll_timeout),
            memory_diff: None,
            available_memory: f64::NAN,
            terminable,
        }
    }

    pub fn memory_diff(&self) -> Option<f64> {
        self.memory_diff
    }

    pub async fn run(mut self) {
        info!(wait_timeout_secs = self.wait_timeout.as_secs_f64(), "Starting resource control");

        let mut wait_time = self.wait_timeout;
        while self.terminable.should_run() {
            let target = tokio::select! {
                target = self.request_target(wait_time) => target,
                _ = self.terminable.terminated() => break,
            };

            let stats = match self.memory.memory_stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    error!(error = %e, "Failed getting data on available memory");
                    self.terminable.terminable_sleep(wait_time).await;
                    continue;
                }
            };
            let app_rss = self.application.application_rss().await;
            if !self.terminable.should_run() {
                break;
            }

            self.available_memory = stats.available;
            let (next_wait, target_memory) = self.update_memory(target.as_ref()).await;
            wait_time = next_wait;
            debug!(
                next_secs = wait_time.as_secs_f64(),
                target_mb = ?target_memory,
                available_mb = self.available_memory,
                used_mb = stats.used,
                rss_mb = app_rss,
                cache_mb = stats.cache_and_buff,
                diff_mb = ?self.memory_diff,
                "Resource control state"
            );
            if !self.terminable.should_run() {
                break;
            }

            let total = self.clamp_target(target_memory);
            match self
                .application
                .change_mem(total, stats.used, stats.cache_and_buff, app_rss)
                .await
            {
                Ok(Some(app_target)) => self.report_application_target(app_target),
                Ok(None) => {}
                Err(e) => error!(target_mb = total, error = %e, "Failed to update the application memory"),
            }
        }

        self.client.close().await;
        info!("Resource control ended");
    }

    /// Never hand the application more than the guest currently has
    fn clamp_target(&self, target_memory: Option<f64>) -> f64 {
        match target_memory {
            Some(target) if target > 0.0 => target.min(self.available_memory),
            _ => self.available_memory,
        }
    }

    /// Wait up to `wait` for a new notification and return the latest one,
    /// with its grace period reduced by the time since it arrived
    async fn request_target(&self, wait: Duration) -> Option<TargetAllocation> {
        let rpc_timeout = (wait + Duration::from_secs(1)).max(Duration::from_secs(1));
        let mut target = match self
            .client
            .target_allocation(Some(wait.as_secs_f64()), Some(rpc_timeout))
            .await
        {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "Failed getting hint on target allocation");
                return None;
            }
        };

        if let Some(grace_period) = target.grace_period {
            let now = now_secs();
            let update_time = target.update_time.unwrap_or(now);
            let remaining = grace_period - (now - update_time);
            target.grace_period = (remaining >= MIN_GRACE_PERIOD).then_some(remaining);
        }
        Some(target)
    }

    /// Decide how long to wait before the next tick and whether to resize
    /// now. `available_memory` must hold this tick's measurement.
    pub async fn update_memory(
        &mut self,
        target: Option<&TargetAllocation>,
    ) -> (Duration, Option<f64>) {
        let Some(target) = target else {
            return (self.wait_timeout, None);
        };

        let grace_period = target.grace_period;
        let Some(mut memory_alloc) = target.memory() else {
            warn!("Notification did not include memory allocation");
            return (self.wait_timeout, None);
        };

        // The first authoritative notification marks a settled allocation
        if self.memory_diff.is_none() && grace_period.is_none() {
            let diff = (memory_alloc - self.available_memory).max(0.0);
            self.memory_diff = Some(diff);
            self.report_resource_diff(diff);
        }

        let Some(memory_diff) = self.memory_diff else {
            return (self.wait_timeout, None);
        };

        memory_alloc -= memory_diff;
        let available = self.available_memory;

        if is_memory_close(memory_alloc, available, self.epsilon) {
            (self.wait_timeout, None)
        } else if memory_alloc > available {
            if let Some(grace_period) = grace_period {
                return (secs(grace_period), None);
            }

            let (now_available, stable_for) = self.poll_stats(memory_alloc, available).await;
            self.available_memory = now_available;

            let reached = is_memory_close(memory_alloc, now_available, self.epsilon);
            let stable = stable_for.as_secs_f64() + MIN_GRACE_PERIOD
                > self.stats_poll_timeout.as_secs_f64();
            if reached || stable {
                let diff = (memory_alloc + memory_diff - now_available).max(0.0);
                debug!(diff_mb = diff, "Recalibrated memory diff");
                self.memory_diff = Some(diff);
                (self.wait_timeout, Some(memory_alloc))
            } else {
                (GROW_RETRY_WAIT, Some(memory_alloc))
            }
        } else {
            match grace_period {
                Some(grace_period) if grace_period > self.decrease_mem_time => {
                    (secs(grace_period - self.decrease_mem_time), None)
                }
                _ => (self.wait_timeout, Some(memory_alloc.min(available))),
            }
        }
    }

    /// Poll available memory until it reaches `target` or the poll times out.
    ///
    /// Returns the last value and for how long it has not changed.
    async fn poll_stats(&self, target: f64, mut current: f64) -> (f64, Duration) {
        let end = Instant::now() + self.stats_poll_timeout;
        let mut stable_since = Instant::now();

        while Instant::now() < end && !is_memory_close(target, current, self.epsilon) {
            if !self.terminable.terminable_sleep(STATS_POLL_INTERVAL).await {
                break;
            }
            let available = match self.memory.memory_stats().await {
                Ok(stats) => stats.available,
                Err(e) => {
                    warn!(error = %e, "Failed polling available memory");
                    break;
                }
            };
            if !is_memory_close(available, current, self.epsilon) {
                stable_since = Instant::now();
            }
            current = available;
        }
        (current, stable_since.elapsed())
    }

    fn report_resource_diff(&self, diff: f64) {
        if !is_valid_mem(diff) {
            return;
        }
        let client = self.client.clone();
        let timeout = self.wait_timeout;
        tokio::spawn(async move {
            let diff = Allocation::from([("memory".to_string(), diff)]);
            if let Err(e) = client.update_resource_diff(diff, Some(timeout)).await {
                warn!(error = %e, "Failed to update the policy about the memory diff");
            }
        });
    }

    fn report_application_target(&self, app_target: f64) {
        if !is_valid_mem(app_target) {
            return;
        }
        let client = self.client.clone();
        let timeout = self.wait_timeout;
        tokio::spawn(async move {
            let target = Allocation::from([("memory".to_string(), app_target)]);
            if let Err(e) = client.update_application_target(target, Some(timeout)).await {
                warn!(error = %e, "Failed to update the application target");
            }
        });
    }
}
