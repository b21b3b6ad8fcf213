//! Host control loop
//!
//! Once per interval the policy snapshots the host and every ready guest,
//! asks each guest what it wants, lets the allocator decide, announces the
//! decision with a grace period, applies it through the controllers and
//! finally confirms it to the guests.

mod allocator;
mod controller;


pub use allocator::{Allocator, AllocatorFactory, AllocatorRegistry, InquiryAllocator, INQUIRY_VAR};
pub use controller::{Balloon, Controller, ControllerContext, ControllerFactory, ControllerRegistry};

use crate::communication::{Allocation, InquiryContent};
use crate::config::{secs, HostConfig};
use crate::data_log::DataLogger;
use crate::guest_manager::GuestManager;
use crate::monitor::{Entity, Monitor};
use crate::observability::{MomMetrics, StructuredLogger};
use crate::record::{now_secs, Record};
use crate::terminable::{DeferredStart, Terminable};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How a control cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to control yet, or terminated before starting
    Skipped,
    /// Stopped by an allocator failure or by termination
    Aborted,
    Completed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Aborted => "aborted",
            CycleOutcome::Completed => "completed",
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct HostPolicy {
    host_monitor: Arc<Monitor>,
    guest_manager: Arc<GuestManager>,
    resources: Vec<String>,
    allocator: Mutex<Box<dyn Allocator>>,
    controllers: Vec<Box<dyn Controller>>,
    interval: Duration,
    grace_period: f64,
    inquiry_timeout: f64,
    max_parallel_rpcs: usize,
    start_gate: Option<DeferredStart>,
    terminable: Terminable,
    metrics: MomMetrics,
    logger: StructuredLogger,
}

impl std::fmt::Debug for HostPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPolicy")
            .field("resources", &self.resources)
            .field(
                "controllers",
                &self.controllers.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("interval", &self.interval)
            .field("grace_period", &self.grace_period)
            .field("inquiry_timeout", &self.inquiry_timeout)
            .finish()
    }
}

impl HostPolicy {
    /// Build the policy with the configured allocator and one controller per
    /// resource. A controller that cannot be created is logged and left out.
    pub fn new(
        config: &HostConfig,
        host_monitor: Arc<Monitor>,
        guest_manager: Arc<GuestManager>,
        allocators: &AllocatorRegistry,
        controllers: &ControllerRegistry,
        controller_context: &ControllerContext,
        terminable: Terminable,
    ) -> Result<Self> {
        let policy = &config.policy;
        let interval = policy.interval.max(1.0);
        let resources: Vec<String> = policy
            .resources
            .iter()
            .map(|resource| resource.trim().to_string())
            .collect();

        let allocator = allocators.create(&policy.allocator, &resources)?;

        let mut built = Vec::new();
        for resource in &resources {
            let Some(name) = policy.controllers.get(resource) else {
                warn!(resource = %resource, "No controller configured for resource");
                continue;
            };
            match controllers.create(name, resource, controller_context) {
                Ok(controller) => {
                    debug!(resource = %resource, controller = %name, "Loaded controller");
                    built.push(controller);
                }
                Err(e) => {
                    error!(resource = %resource, controller = %name, error = %format!("{:#}", e), "Unable to create controller")
                }
            }
        }

        Ok(Self {
            host_monitor,
            guest_manager,
            resources,
            allocator: Mutex::new(allocator),
            controllers: built,
            interval: secs(interval),
            grace_period: policy.grace_period.min(interval).max(0.0),
            inquiry_timeout: policy.inquiry_timeout.min(interval).max(0.0),
            max_parallel_rpcs: policy.max_parallel_rpcs.max(1),
            start_gate: None,
            terminable,
            metrics: MomMetrics::new(),
            logger: StructuredLogger::new("momhostd"),
        })
    }

    /// Hold the main loop until the gate opens
    pub fn with_start_gate(mut self, gate: DeferredStart) -> Self {
        self.start_gate = Some(gate);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn grace_period(&self) -> f64 {
        self.grace_period
    }

    pub fn inquiry_timeout(&self) -> f64 {
        self.inquiry_timeout
    }

    /// Run `task` for every guest with at most `max_parallel_rpcs` in
    /// flight; results come back in guest order
    async fn for_each_guest<'a, F, Fut, T>(&self, guests: &'a [Entity], task: F) -> Vec<T>
    where
        F: Fn(&'a Entity) -> Fut,
        Fut: Future<Output = T> + 'a,
    {
        let tasks: Vec<Fut> = guests.iter().map(task).collect();
        stream::iter(tasks)
            .buffered(self.max_parallel_rpcs)
            .collect()
            .await
    }

    async fn inquire_guest(&self, guest: &Entity) -> Value {
        let client = match guest.guest_client() {
            Ok(client) => client,
            Err(e) => {
                warn!(guest = %guest.name(), error = %e, "Cannot inquire guest");
                return Value::Null;
            }
        };

        let content = InquiryContent {
            last_alloc: guest.last_control(),
            grace_period: Some(self.grace_period),
            timeout: Some(self.inquiry_timeout),
        };
        match client.inquire(content, Some(secs(self.inquiry_timeout))).await {
            Ok(answer) => allocation_value(&answer),
            Err(e) => {
                self.metrics.inc_rpc_failures("Inquiry");
                if self.terminable.should_run() {
                    if e.is_timeout() {
                        error!(guest = %guest.name(), error = %e, "Could not inquire guest");
                    } else {
                        warn!(guest = %guest.name(), error = %e, "Failed to inquire guest");
                    }
                }
                Value::Null
            }
        }
    }

    async fn notify_guest(&self, guest: &Entity, grace_period: Option<f64>) {
        let alloc: Allocation = self
            .resources
            .iter()
            .filter_map(|resource| {
                guest
                    .get_control(resource)
                    .map(|value| (resource.clone(), value))
            })
            .collect();
        if alloc.is_empty() {
            debug!(guest = %guest.name(), "Nothing to notify");
            return;
        }

        let client = match guest.guest_client() {
            Ok(client) => client,
            Err(e) => {
                warn!(guest = %guest.name(), error = %e, "Cannot notify guest");
                return;
            }
        };

        let timeout = grace_period.map_or(self.inquiry_timeout, |grace| {
            grace.max(self.inquiry_timeout)
        });
        if let Err(e) = client.notify(alloc, grace_period, Some(secs(timeout))).await {
            self.metrics.inc_rpc_failures("Notify");
            if self.terminable.should_run() {
                if e.is_timeout() {
                    error!(guest = %guest.name(), error = %e, "Could not notify guest");
                } else {
                    warn!(guest = %guest.name(), error = %e, "Failed to notify guest");
                }
            }
        }
    }

    async fn notify_guests(&self, guests: &[Entity], grace_period: Option<f64>) {
        self.for_each_guest(guests, |guest| self.notify_guest(guest, grace_period))
            .await;
    }

    /// Grace left after the time already spent since the inquiry
    fn remaining_grace(&self, inquiry_time: Instant) -> f64 {
        (self.grace_period - inquiry_time.elapsed().as_secs_f64()).max(0.0)
    }

    /// Run one control cycle
    pub async fn do_controls(&self) -> CycleOutcome {
        if !self.terminable.should_run() {
            return CycleOutcome::Skipped;
        }

        let Some(mut host) = self.host_monitor.interrogate() else {
            return CycleOutcome::Skipped;
        };
        let mut guests: Vec<Entity> = self.guest_manager.interrogate().into_values().collect();

        // Ask every guest about its next allocation
        let inquiry_time = Instant::now();
        let answers = self
            .for_each_guest(&guests, |guest| self.inquire_guest(guest))
            .await;
        for (guest, answer) in guests.iter_mut().zip(answers) {
            guest.set_var(INQUIRY_VAR, answer);
        }
        if !self.terminable.should_run() {
            return CycleOutcome::Aborted;
        }

        {
            let mut allocator = self.allocator.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = allocator.apply_policy(&mut host, &mut guests) {
                self.metrics.inc_policy_failures();
                error!(allocator = %allocator.name(), error = %format!("{:#}", e), "Exception while applying policy");
                return CycleOutcome::Aborted;
            }
        }
        if !self.terminable.should_run() {
            return CycleOutcome::Aborted;
        }

        // Announce the decision, giving guests until the end of the grace
        // period to prepare
        let notify_start = now_secs();
        self.notify_guests(&guests, Some(self.remaining_grace(inquiry_time)))
            .await;
        let notify_end = now_secs();
        if !self.terminable.should_run() {
            return CycleOutcome::Aborted;
        }

        for entity in std::iter::once(&host).chain(guests.iter()) {
            let mut record = Record::new();
            record.insert("notify".to_string(), allocation_value(entity.controls()));
            policy_logger(entity).append_data(record, notify_start, notify_end);
        }

        if !self
            .terminable
            .terminable_sleep_secs(self.remaining_grace(inquiry_time))
            .await
        {
            return CycleOutcome::Aborted;
        }

        let policy_start = now_secs();
        for controller in &self.controllers {
            if let Err(e) = controller.apply_control(&host, &mut guests).await {
                self.metrics.inc_controller_failures();
                error!(
                    controller = %controller.name(),
                    resource = %controller.resource(),
                    error = %format!("{:#}", e),
                    "Controller failed"
                );
            }
        }
        let policy_end = now_secs();

        for entity in std::iter::once(&host).chain(guests.iter()) {
            let mut record = Record::new();
            record.insert("controls".to_string(), allocation_value(entity.controls()));
            record.insert(
                "variables".to_string(),
                Value::Object(entity.variables().clone()),
            );
            policy_logger(entity).append_data(record, policy_start, policy_end);
            entity.store_variables();
        }
        if !self.terminable.should_run() {
            return CycleOutcome::Aborted;
        }

        // Confirm what was applied
        self.notify_guests(&guests, None).await;
        CycleOutcome::Completed
    }

    pub async fn run(self: Arc<Self>) {
        if let Some(gate) = &self.start_gate {
            if !gate.wait(&self.terminable, "host-policy").await {
                return;
            }
        }

        info!(
            interval_secs = self.interval.as_secs_f64(),
            grace_period_secs = self.grace_period,
            inquiry_timeout_secs = self.inquiry_timeout,
            "Starting host policy"
        );

        while self.terminable.should_run() {
            let start = Instant::now();
            let outcome = self.do_controls().await;
            let elapsed = start.elapsed();

            self.metrics.inc_cycles(outcome.as_str());
            self.metrics.observe_cycle_latency(elapsed.as_secs_f64());
            if outcome != CycleOutcome::Skipped {
                self.logger
                    .log_cycle(outcome.as_str(), self.guest_manager.len(), elapsed.as_secs_f64());
            }

            self.terminable
                .terminable_sleep(self.interval.saturating_sub(elapsed))
                .await;
        }

        info!("Host policy ended");
    }
}

fn policy_logger(entity: &Entity) -> DataLogger {
    DataLogger::new("policy", entity.prop().source.clone())
}

fn allocation_value(allocation: &Allocation) -> Value {
    Value::Object(
        allocation
            .iter()
            .map(|(resource, value)| (resource.clone(), Value::from(*value)))
            .collect(),
    )
}
