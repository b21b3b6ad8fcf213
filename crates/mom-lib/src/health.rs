//! Liveness of the MOM daemons
//!
//! Every long-running task of a daemon is registered here. The daemon's
//! liveness check marks tasks that ended early as dead and publishes the
//! readiness of the guests it tracks; the HTTP API serves the result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle of one daemon task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Registered, not spawned yet
    Starting,
    Running,
    /// Ended while the daemon was still supposed to run
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix time of the last status change
    pub since: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: chrono::Utc::now().timestamp(),
        }
    }
}

/// Overall daemon status; any dead task makes the daemon unhealthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: DaemonStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub dead_components: Vec<String>,
    /// Guest name → guest server answered the readiness handshake
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub guests: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Task names
pub mod components {
    pub const HOST_MONITOR: &str = "host_monitor";
    pub const GUEST_MANAGER: &str = "guest_manager";
    pub const HOST_POLICY: &str = "host_policy";
    pub const GUEST_SERVER: &str = "guest_server";
    pub const RESOURCE_CONTROL: &str = "resource_control";
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    guests: BTreeMap<String, bool>,
    ready: bool,
}

impl HealthState {
    fn dead_components(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|(_, health)| health.status == ComponentStatus::Dead)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn set(&mut self, name: &str, status: ComponentStatus, message: Option<String>) {
        self.components
            .insert(name.to_string(), ComponentHealth::new(status, message));
    }
}

/// Shared view of the daemon's tasks and guests
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.state
            .write()
            .await
            .set(name, ComponentStatus::Starting, None);
    }

    pub async fn set_running(&self, name: &str) {
        self.state
            .write()
            .await
            .set(name, ComponentStatus::Running, None);
    }

    pub async fn set_dead(&self, name: &str, message: impl Into<String>) {
        self.state
            .write()
            .await
            .set(name, ComponentStatus::Dead, Some(message.into()));
    }

    /// Replace the published guest readiness
    pub async fn set_guests(&self, guests: BTreeMap<String, bool>) {
        self.state.write().await.guests = guests;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    /// Names of the tasks marked dead, sorted
    pub async fn dead_components(&self) -> Vec<String> {
        self.state.read().await.dead_components()
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let dead_components = state.dead_components();
        let status = if dead_components.is_empty() {
            DaemonStatus::Healthy
        } else {
            DaemonStatus::Unhealthy
        };
        HealthResponse {
            status,
            components: state.components.clone(),
            dead_components,
            guests: state.guests.clone(),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        let dead = state.dead_components();

        let reason = if !dead.is_empty() {
            Some(format!("Components died: {}", dead.join(", ")))
        } else if !state.ready {
            Some("Daemon not running".to_string())
        } else {
            None
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_components_start_healthy() {
        let registry = HealthRegistry::new();
        registry.register(components::HOST_MONITOR).await;
        registry.register(components::HOST_POLICY).await;
        registry.set_running(components::HOST_POLICY).await;

        let health = registry.health().await;
        assert_eq!(health.status, DaemonStatus::Healthy);
        assert_eq!(
            health.components[components::HOST_MONITOR].status,
            ComponentStatus::Starting
        );
        assert_eq!(
            health.components[components::HOST_POLICY].status,
            ComponentStatus::Running
        );
        assert!(health.dead_components.is_empty());
    }

    #[tokio::test]
    async fn test_dead_component_makes_daemon_unhealthy() {
        let registry = HealthRegistry::new();
        for name in [
            components::HOST_MONITOR,
            components::GUEST_MANAGER,
            components::HOST_POLICY,
        ] {
            registry.register(name).await;
            registry.set_running(name).await;
        }
        registry.set_ready(true).await;

        registry.set_dead(components::HOST_POLICY, "Task ended unexpectedly").await;
        registry.set_dead(components::GUEST_MANAGER, "Task ended unexpectedly").await;

        let health = registry.health().await;
        assert_eq!(health.status, DaemonStatus::Unhealthy);
        assert_eq!(
            health.dead_components,
            vec![components::GUEST_MANAGER, components::HOST_POLICY]
        );
        assert_eq!(
            health.components[components::HOST_POLICY].message.as_deref(),
            Some("Task ended unexpectedly")
        );

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Components died: guest_manager, host_policy")
        );
    }

    #[tokio::test]
    async fn test_readiness_follows_ready_flag() {
        let registry = HealthRegistry::new();
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        let readiness = registry.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.reason.is_none());
    }

    #[tokio::test]
    async fn test_guest_readiness_published() {
        let registry = HealthRegistry::new();
        registry
            .set_guests(BTreeMap::from([
                ("vm-1".to_string(), true),
                ("vm-2".to_string(), false),
            ]))
            .await;

        let health = registry.health().await;
        assert_eq!(health.guests["vm-1"], true);
        assert_eq!(health.guests["vm-2"], false);

        let body = serde_json::to_value(&health).unwrap();
        assert_eq!(body["guests"]["vm-2"], false);
        assert_eq!(body["status"], "healthy");
    }
}
