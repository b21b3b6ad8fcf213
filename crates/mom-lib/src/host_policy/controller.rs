//! Controllers apply computed controls to the real system

use crate::hypervisor::Hypervisor;
use crate::memory::is_memory_close;
use crate::monitor::Entity;
use crate::observability::{MomMetrics, StructuredLogger};
use crate::registry::Registry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Balloon changes smaller than this are not worth a hypervisor call (MB)
const BALLOON_EPSILON: f64 = 5.0;

#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    /// Resource this controller is responsible for
    fn resource(&self) -> &str;

    /// Apply the guests' controls. A controller may rewrite a control it
    /// could not honor.
    async fn apply_control(&self, host: &Entity, guests: &mut [Entity]) -> Result<()>;
}

/// What a controller factory may bind to
#[derive(Clone)]
pub struct ControllerContext {
    pub hypervisor: Arc<dyn Hypervisor>,
}

/// Resizes guest memory through the hypervisor's balloon driver.
///
/// Guests are serviced shrinkers first, so memory released by one guest is
/// available to the next.
pub struct Balloon {
    resource: String,
    hypervisor: Arc<dyn Hypervisor>,
    metrics: MomMetrics,
    logger: StructuredLogger,
}

impl Balloon {
    pub fn new(resource: impl Into<String>, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            resource: resource.into(),
            hypervisor,
            metrics: MomMetrics::new(),
            logger: StructuredLogger::new("momhostd"),
        }
    }

    pub fn create(resource: &str, context: &ControllerContext) -> Result<Box<dyn Controller>> {
        Ok(Box::new(Self::new(resource, context.hypervisor.clone())))
    }

    /// `target − current`; negative for guests about to shrink
    fn sort_key(&self, guest: &Entity) -> f64 {
        let Some(target) = guest.get_control(&self.resource) else {
            return 0.0;
        };
        match guest.stat_f64("libvirt.curmem") {
            Ok(current) => target - current,
            Err(e) => {
                warn!(guest = %guest.name(), error = %e, "Could not calculate sort key");
                0.0
            }
        }
    }

    async fn apply_guest_control(&self, guest: &mut Entity) -> Result<()> {
        let Some(mut target) = guest.get_control(&self.resource) else {
            return Ok(());
        };
        let Some(id) = guest.prop().id.clone() else {
            return Ok(());
        };

        let info = self
            .hypervisor
            .domain_info(&id)
            .await
            .with_context(|| format!("Failed to get domain info of {}", guest.name()))?;

        if target > info.max_mem_mb {
            self.logger
                .log_balloon_clamped(guest.name(), target, info.max_mem_mb);
            target = info.max_mem_mb;
            guest.control(self.resource.clone(), target);
        }

        if is_memory_close(target, info.cur_mem_mb, BALLOON_EPSILON) {
            return Ok(());
        }

        self.logger.log_balloon(guest.name(), info.cur_mem_mb, target);
        self.hypervisor
            .set_memory(&id, target)
            .await
            .with_context(|| format!("Error while ballooning {} to {:.0} MB", guest.name(), target))?;
        self.metrics.inc_balloon_operations();
        Ok(())
    }
}

#[async_trait]
impl Controller for Balloon {
    fn name(&self) -> &str {
        "Balloon"
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    async fn apply_control(&self, _host: &Entity, guests: &mut [Entity]) -> Result<()> {
        let mut order: Vec<(f64, usize)> = guests
            .iter()
            .enumerate()
            .map(|(index, guest)| (self.sort_key(guest), index))
            .collect();
        order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        for (_, index) in order {
            let guest = &mut guests[index];
            if let Err(e) = self.apply_guest_control(guest).await {
                warn!(guest = %guest.name(), resource = %self.resource, error = %format!("{:#}", e), "Balloon failed");
            }
        }
        debug!(guests = guests.len(), "Balloon controls applied");
        Ok(())
    }
}

pub type ControllerFactory = fn(&str, &ControllerContext) -> Result<Box<dyn Controller>>;

/// Controller factories by name
#[derive(Clone)]
pub struct ControllerRegistry {
    inner: Registry<ControllerFactory>,
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ControllerRegistry {
    pub fn empty() -> Self {
        Self {
            inner: Registry::new("controller"),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .inner
            .insert("Balloon", Balloon::create as ControllerFactory);
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: ControllerFactory,
    ) -> Result<(), crate::error::RegistryError> {
        self.inner.register(name, factory)
    }

    pub fn create(
        &self,
        name: &str,
        resource: &str,
        context: &ControllerContext,
    ) -> Result<Box<dyn Controller>> {
        let factory = self.inner.get(name)?;
        factory(resource, context)
            .with_context(|| format!("Failed to create {} controller for {}", name, resource))
    }
}
