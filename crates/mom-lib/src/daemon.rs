//! Daemon wiring and liveness supervision
//!
//! [`MomHostDaemon`] starts the host monitor, the guest manager and the host
//! policy, then checks on an interval that all three are still running. Any
//! of them ending early is fatal: the daemon marks it dead and shuts
//! everything down. [`MomGuestDaemon`] serves the guest RPC endpoint and
//! optionally runs the guest resource control.

use crate::communication::{Connector, GuestClient, GuestServer, LocalTransport, TcpConnector};
use crate::config::{secs, DataLogConfig, GuestConfig, HostConfig};
use crate::data_log::{start_data_logging, stop_data_logging};
use crate::guest::{
    ApplicationControl, DynamicResourceControl, GuestPolicy, MeminfoSource, ReportingApplication,
};
use crate::guest_manager::GuestManager;
use crate::health::{components, HealthRegistry};
use crate::host_policy::{AllocatorRegistry, ControllerContext, ControllerRegistry, HostPolicy};
use crate::hypervisor::{Hypervisor, VirshHypervisor};
use crate::monitor::{CollectorContext, CollectorRegistry, HostMonitor, Monitor, Properties};
use crate::observability::StructuredLogger;
use crate::terminable::{DeferredStart, Terminable};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn start_data_log(config: &DataLogConfig) -> Result<()> {
    match &config.path {
        Some(path) => start_data_logging(path),
        None => Ok(()),
    }
}

pub struct MomHostDaemon {
    config: HostConfig,
    host_monitor: HostMonitor,
    guest_manager: Arc<GuestManager>,
    host_policy: Arc<HostPolicy>,
    start_gate: DeferredStart,
    health: HealthRegistry,
    terminable: Terminable,
    logger: StructuredLogger,
}

impl MomHostDaemon {
    /// Wire the host components against an explicit hypervisor and guest
    /// connector
    pub fn new(
        config: HostConfig,
        hypervisor: Arc<dyn Hypervisor>,
        connector: Arc<dyn Connector>,
        health: HealthRegistry,
        terminable: Terminable,
    ) -> Result<Self> {
        let collectors = CollectorRegistry::with_defaults();

        let host_monitor = HostMonitor::new(
            &config,
            &collectors,
            Some(hypervisor.clone()),
            terminable.clone(),
        )
        .context("Failed to create host monitor")?;

        let guest_manager = Arc::new(GuestManager::new(
            &config,
            hypervisor.clone(),
            connector,
            collectors,
            terminable.clone(),
        ));

        let start_gate = DeferredStart::new();
        let host_policy = HostPolicy::new(
            &config,
            host_monitor.monitor().clone(),
            guest_manager.clone(),
            &AllocatorRegistry::with_defaults(),
            &ControllerRegistry::with_defaults(),
            &ControllerContext { hypervisor },
            terminable.clone(),
        )
        .context("Failed to create host policy")?
        .with_start_gate(start_gate.clone());

        Ok(Self {
            config,
            host_monitor,
            guest_manager,
            host_policy: Arc::new(host_policy),
            start_gate,
            health,
            terminable,
            logger: StructuredLogger::new("momhostd"),
        })
    }

    /// Wire the host components against `virsh` and TCP guest servers
    pub fn from_config(
        config: HostConfig,
        health: HealthRegistry,
        terminable: Terminable,
    ) -> Result<Self> {
        let hypervisor = Arc::new(VirshHypervisor::new(config.hypervisor.uri.clone()));
        let timeout = config.guest_client.timeout;
        let connector = Arc::new(TcpConnector {
            port: config.guest_client.port,
            default_timeout: (timeout > 0.0).then(|| secs(timeout)),
        });
        Self::new(config, hypervisor, connector, health, terminable)
    }

    pub fn guest_manager(&self) -> &Arc<GuestManager> {
        &self.guest_manager
    }

    pub fn terminable(&self) -> &Terminable {
        &self.terminable
    }

    /// Run until terminated or until a component dies
    pub async fn run(self) -> Result<()> {
        self.logger.log_startup(VERSION);
        start_data_log(&self.config.data_log)?;

        for name in [
            components::HOST_MONITOR,
            components::GUEST_MANAGER,
            components::HOST_POLICY,
        ] {
            self.health.register(name).await;
        }

        let tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
            (
                components::HOST_MONITOR,
                tokio::spawn(self.host_monitor.clone().run()),
            ),
            (
                components::GUEST_MANAGER,
                tokio::spawn(self.guest_manager.clone().run()),
            ),
            (
                components::HOST_POLICY,
                tokio::spawn(self.host_policy.clone().run()),
            ),
        ];
        for (name, _) in &tasks {
            self.health.set_running(name).await;
        }
        self.start_gate.go();
        self.health.set_ready(true).await;

        let interval = secs(self.config.main.check_loop_interval);
        let reason = loop {
            if !self.terminable.terminable_sleep(interval).await {
                break "terminated";
            }
            self.health
                .set_guests(self.guest_manager.get_guests_readiness())
                .await;

            let dead: Vec<&str> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(name, _)| *name)
                .collect();
            if dead.is_empty() {
                continue;
            }

            for name in &dead {
                self.logger.log_component_died(name);
                self.health.set_dead(name, "Task ended unexpectedly").await;
            }
            if self.terminable.should_run() {
                warn!(components = ?dead, "One of the tasks ended before it should. Terminating.");
            }
            break "component died";
        };

        self.logger.log_shutdown(reason);
        self.terminable.terminate();
        self.health.set_ready(false).await;

        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(component = %name, error = %e, "Task panicked");
            }
        }
        stop_data_logging();
        info!("Daemon ending");
        Ok(())
    }
}

pub struct MomGuestDaemon {
    config: GuestConfig,
    server: Arc<GuestServer>,
    application: Option<Arc<dyn ApplicationControl>>,
    health: HealthRegistry,
    terminable: Terminable,
    logger: StructuredLogger,
}

impl MomGuestDaemon {
    pub fn new(
        config: GuestConfig,
        name: &str,
        health: HealthRegistry,
        terminable: Terminable,
    ) -> Result<Self> {
        let properties = Properties {
            name: name.to_string(),
            source: name.to_string(),
            ..Default::default()
        };
        let collectors = CollectorRegistry::with_defaults()
            .create_all(
                &config.monitor.collectors,
                &CollectorContext::new(properties.clone())
                    .with_applications(config.monitor.applications.clone()),
            )
            .context("Failed to create guest monitor")?;
        let monitor = Monitor::new(
            properties,
            collectors,
            config.monitor.sample_history_length,
            terminable.clone(),
        );
        monitor.set_ready();

        let policy = GuestPolicy::from_config(&config.policy);
        let server = GuestServer::new(name, Some(Arc::new(monitor)), Arc::new(policy));

        Ok(Self {
            config,
            server: Arc::new(server),
            application: None,
            health,
            terminable,
            logger: StructuredLogger::new("momguestd"),
        })
    }

    /// Application resized by the resource control, when enabled
    pub fn with_application(mut self, application: Arc<dyn ApplicationControl>) -> Self {
        self.application = Some(application);
        self
    }

    pub fn server(&self) -> &Arc<GuestServer> {
        &self.server
    }

    /// Serve until terminated or until the server dies
    pub async fn run(self) -> Result<()> {
        self.logger.log_startup(VERSION);
        start_data_log(&self.config.data_log)?;

        let address = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to listen on {}", address))?;
        info!(address = %address, "Starting guest server");

        self.health.register(components::GUEST_SERVER).await;
        let mut server_task = tokio::spawn(
            self.server
                .clone()
                .serve(listener, self.terminable.clone()),
        );
        self.health.set_running(components::GUEST_SERVER).await;

        let mut control_task = None;
        if self.config.resource_control.enabled {
            self.health.register(components::RESOURCE_CONTROL).await;
            let client = GuestClient::new(
                self.server.name(),
                Arc::new(LocalTransport::new(self.server.clone())),
                None,
            );
            let application = self
                .application
                .clone()
                .unwrap_or_else(|| Arc::new(ReportingApplication));
            let control = DynamicResourceControl::new(
                &self.config.resource_control,
                client,
                application,
                Arc::new(MeminfoSource::default()),
                self.terminable.clone(),
            );
            control_task = Some(tokio::spawn(control.run()));
            self.health.set_running(components::RESOURCE_CONTROL).await;
        }
        self.health.set_ready(true).await;

        let reason = tokio::select! {
            _ = self.terminable.terminated() => "terminated",
            result = &mut server_task => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %format!("{:#}", e), "Guest server failed"),
                    Err(e) => warn!(error = %e, "Guest server panicked"),
                }
                self.logger.log_component_died(components::GUEST_SERVER);
                self.health
                    .set_dead(components::GUEST_SERVER, "Task ended unexpectedly")
                    .await;
                "component died"
            }
        };

        self.logger.log_shutdown(reason);
        self.terminable.terminate();
        self.health.set_ready(false).await;

        if reason == "terminated" {
            match server_task.await {
                Ok(Err(e)) => warn!(error = %format!("{:#}", e), "Guest server failed"),
                Err(e) => warn!(component = %components::GUEST_SERVER, error = %e, "Task panicked"),
                Ok(Ok(())) => {}
            }
        }
        if let Some(task) = control_task {
            if let Err(e) = task.await {
                warn!(component = %components::RESOURCE_CONTROL, error = %e, "Task panicked");
            }
        }
        stop_data_logging();
        info!("Guest daemon ending");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::InquiryContent;
    use crate::config::ResponseScript;
    use crate::testing::{FakeHypervisor, LocalConnector};
    use std::time::Duration;

    #[tokio::test]
    async fn test_host_daemon_stops_on_termination() {
        let mut config = HostConfig::default();
        config.main.check_loop_interval = 0.05;
        config.host_monitor.collectors = Vec::new();

        let health = HealthRegistry::new();
        let terminable = Terminable::new();
        let daemon = MomHostDaemon::new(
            config,
            FakeHypervisor::new(),
            LocalConnector::new(),
            health.clone(),
            terminable.clone(),
        )
        .unwrap();

        let handle = tokio::spawn(daemon.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(health.readiness().await.ready);
        assert!(health.dead_components().await.is_empty());

        terminable.terminate();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_host_daemon_stops_when_component_dies() {
        let mut config = HostConfig::default();
        config.main.check_loop_interval = 0.05;
        config.host_monitor.collectors = Vec::new();

        let hypervisor = FakeHypervisor::new();
        hypervisor.crash_on_list();
        let health = HealthRegistry::new();
        let terminable = Terminable::new();
        let daemon = MomHostDaemon::new(
            config,
            hypervisor,
            LocalConnector::new(),
            health.clone(),
            terminable.clone(),
        )
        .unwrap();

        // Nobody terminates the daemon; the dead guest manager has to
        let result = tokio::time::timeout(Duration::from_millis(500), daemon.run())
            .await
            .expect("daemon kept running with a dead component");
        result.unwrap();

        assert_eq!(health.dead_components().await, vec![components::GUEST_MANAGER]);
        let status = health.health().await;
        assert_eq!(status.status, crate::health::DaemonStatus::Unhealthy);
        assert_eq!(
            status.components[components::HOST_POLICY].status,
            crate::health::ComponentStatus::Running
        );
        let readiness = health.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Components died: guest_manager"));
        assert!(!terminable.should_run());
    }

    #[tokio::test]
    async fn test_host_daemon_publishes_guest_readiness() {
        let mut config = HostConfig::default();
        config.main.check_loop_interval = 0.05;
        config.host_monitor.collectors = Vec::new();
        config.guest_manager.interval = 0.05;

        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain("1", "vm-1", 4096.0, 2048.0);
        let health = HealthRegistry::new();
        let terminable = Terminable::new();
        let daemon = MomHostDaemon::new(
            config,
            hypervisor,
            LocalConnector::new(),
            health.clone(),
            terminable.clone(),
        )
        .unwrap();

        let handle = tokio::spawn(daemon.run());
        let mut guests = Default::default();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            guests = health.health().await.guests;
            if !guests.is_empty() {
                break;
            }
        }
        // The guest has no server to answer, so it stays not ready
        assert_eq!(guests.get("vm-1"), Some(&false));

        terminable.terminate();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_guest_daemon_with_resource_control_shuts_down() {
        let mut config = GuestConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.monitor.collectors = Vec::new();
        config.resource_control.enabled = true;

        let health = HealthRegistry::new();
        let terminable = Terminable::new();
        let daemon = MomGuestDaemon::new(config, "vm-1", health.clone(), terminable.clone()).unwrap();

        let handle = tokio::spawn(daemon.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = health.health().await;
        assert_eq!(
            status.components[components::RESOURCE_CONTROL].status,
            crate::health::ComponentStatus::Running
        );
        assert!(health.readiness().await.ready);

        terminable.terminate();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(health.dead_components().await.is_empty());
        assert!(!health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_guest_daemon_serves_policy() {
        let mut config = GuestConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.monitor.collectors = Vec::new();
        config
            .policy
            .responses
            .insert("memory".to_string(), ResponseScript::Constant(1536.0));

        let terminable = Terminable::new();
        let daemon =
            MomGuestDaemon::new(config, "vm-1", HealthRegistry::new(), terminable.clone()).unwrap();
        let server = daemon.server().clone();

        let handle = tokio::spawn(daemon.run());
        let client = GuestClient::new("vm-1", Arc::new(LocalTransport::new(server)), None);
        let answer = client.inquire(InquiryContent::default(), None).await.unwrap();
        assert_eq!(answer["memory"], 1536.0);

        terminable.terminate();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
