//! Guest-side policy answering host inquiries

use crate::communication::Allocation;
use crate::config::{GuestPolicyConfig, ResponseScript};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Desired amount of a resource given the seconds since the first inquiry
pub type Script = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Answers inquiries from per-resource response scripts corrected by the
/// reported resource diff, and wakes `TargetAllocation` waiters whenever a
/// notification arrives.
pub struct GuestPolicy {
    scripts: BTreeMap<String, Script>,
    resource_diff: Mutex<Allocation>,
    notified: Notify,
    init_time: OnceLock<Instant>,
}

impl Default for GuestPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GuestPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestPolicy")
            .field("resources", &self.scripts.keys().collect::<Vec<_>>())
            .field("resource_diff", &self.resource_diff())
            .finish()
    }
}

impl GuestPolicy {
    /// A policy without scripts answers every inquiry with an empty map
    pub fn new() -> Self {
        Self {
            scripts: BTreeMap::new(),
            resource_diff: Mutex::new(Allocation::new()),
            notified: Notify::new(),
            init_time: OnceLock::new(),
        }
    }

    pub fn from_config(config: &GuestPolicyConfig) -> Self {
        config
            .responses
            .iter()
            .fold(Self::new(), |policy, (resource, script)| {
                let script: ResponseScript = script.clone();
                policy.with_script(resource.clone(), move |elapsed| script.evaluate(elapsed))
            })
    }

    pub fn with_script<F>(mut self, resource: impl Into<String>, script: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.scripts.insert(resource.into(), Arc::new(script));
        self
    }

    /// Merge reported per-resource corrections into the stored diff
    pub fn update_resource_diff(&self, diff: Allocation) {
        self.resource_diff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(diff);
    }

    pub fn resource_diff(&self) -> Allocation {
        self.resource_diff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Desired allocation per scripted resource.
    ///
    /// Scripts are evaluated at the time the allocation would take effect:
    /// the elapsed time since the first inquiry plus the grace period.
    pub fn inquiry(&self, grace_period: Option<f64>) -> Allocation {
        let mut elapsed = match self.init_time.get() {
            Some(init_time) => init_time.elapsed().as_secs_f64(),
            None => {
                self.init_time.get_or_init(Instant::now);
                0.0
            }
        };

        if self.scripts.is_empty() {
            return Allocation::new();
        }

        if let Some(grace_period) = grace_period.filter(|g| *g > 0.0) {
            elapsed += grace_period;
        }

        let diff = self.resource_diff();
        self.scripts
            .iter()
            .map(|(resource, script)| {
                let correction = diff.get(resource).copied().unwrap_or(0.0);
                (resource.clone(), script(elapsed) + correction)
            })
            .collect()
    }

    /// Record that a notification arrived
    pub fn notify(&self) {
        self.notified.notify_one();
    }

    /// Wait for a notification that was not yet consumed.
    ///
    /// Returns `true` if one arrived before the timeout. A notification
    /// that arrived while nobody was waiting is consumed immediately.
    pub async fn wait_for_notify(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.notified.notified())
                .await
                .is_ok(),
            None => {
                self.notified.notified().await;
                true
            }
        }
    }
}
