//! Monitor tests against in-memory collectors, guests and hypervisor

use super::*;
use crate::communication::{GuestServer, InquiryContent};
use crate::config::HostConfig;
use crate::guest::GuestPolicy;
use crate::testing::{FailingCollector, FakeHypervisor, LocalConnector, StaticCollector};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn monitor(collectors: Vec<Arc<dyn Collector>>, history_length: usize) -> Monitor {
    Monitor::new(
        Properties {
            name: "vm-1".to_string(),
            source: "vm-1".to_string(),
            ..Default::default()
        },
        collectors,
        history_length,
        Terminable::new(),
    )
}

mod collection_tests {
    use super::*;

    #[tokio::test]
    async fn test_history_is_bounded() {
        let collector = StaticCollector::new("Static", json!({"mem": 1}));
        let monitor = monitor(vec![collector.clone() as Arc<dyn Collector>], 3);

        for _ in 0..5 {
            monitor.collect().await;
        }

        assert_eq!(monitor.history_len(), 3);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 5);
        // Oldest samples were dropped
        assert_eq!(monitor.latest().unwrap()["sample"], 4);
        monitor.set_ready();
        let entity = monitor.interrogate().unwrap();
        assert_eq!(entity.statistics()[0]["sample"], 2);
    }

    #[tokio::test]
    async fn test_later_collector_wins_on_shared_keys() {
        let first = StaticCollector::new("First", json!({"libvirt": {"curmem": 1, "maxmem": 4}}));
        let second = StaticCollector::new("Second", json!({"libvirt": {"curmem": 2}}));
        let monitor = monitor(vec![first as Arc<dyn Collector>, second], 10);

        let record = monitor.collect().await;
        assert_eq!(record["libvirt"]["curmem"], 2);
        assert_eq!(record["libvirt"]["maxmem"], 4);
    }

    #[tokio::test]
    async fn test_failing_collector_is_skipped() {
        let good = StaticCollector::new("Good", json!({"mem": 7}));
        let monitor = monitor(vec![Arc::new(FailingCollector) as Arc<dyn Collector>, good], 10);

        let record = monitor.collect().await;
        assert_eq!(record["mem"], 7);
        assert_eq!(monitor.history_len(), 1);
    }
}

mod interrogation_tests {
    use super::*;

    #[tokio::test]
    async fn test_not_ready_monitor_yields_nothing() {
        let monitor = monitor(vec![StaticCollector::new("Static", json!({})) as Arc<dyn Collector>], 10);
        monitor.collect().await;
        assert!(monitor.interrogate().is_none());

        monitor.set_ready();
        assert!(monitor.interrogate().is_some());

        monitor.set_not_ready("guest went away");
        assert!(monitor.interrogate().is_none());
    }

    #[tokio::test]
    async fn test_stored_variables_reach_next_snapshot() {
        let monitor = monitor(vec![StaticCollector::new("Static", json!({})) as Arc<dyn Collector>], 10);
        monitor.set_ready();
        monitor.collect().await;

        let mut entity = monitor.interrogate().unwrap();
        entity.set_var("pressure", 0.5);
        entity.control("memory", 1024.0);

        // Nothing reaches the monitor until committed
        assert!(monitor.variables().is_empty());
        entity.store_variables();

        let next = monitor.interrogate().unwrap();
        assert_eq!(next.get_var("pressure"), Some(&json!(0.5)));
        assert_eq!(next.last_control()["memory"], 1024.0);
        assert!(next.controls().is_empty());
    }

    #[tokio::test]
    async fn test_update_variables_merges() {
        let monitor = monitor(Vec::new(), 10);
        monitor.update_variables(json!({"a": 1, "b": 2}).as_object().cloned().unwrap());
        monitor.update_variables(json!({"b": 3}).as_object().cloned().unwrap());

        let variables = monitor.variables();
        assert_eq!(variables["a"], 1);
        assert_eq!(variables["b"], 3);
    }
}

mod registry_tests {
    use super::*;

    #[test]
    fn test_unknown_collector_is_error() {
        let registry = CollectorRegistry::with_defaults();
        let context = CollectorContext::new(Properties::host());
        let err = registry
            .create_all(&["NoSuchCollector".to_string()], &context)
            .err()
            .unwrap();
        assert!(err.to_string().contains("NoSuchCollector"));
    }

    #[test]
    fn test_collector_without_requirements_is_skipped() {
        // GuestStats needs a guest client, which the host does not have
        let registry = CollectorRegistry::with_defaults();
        let context = CollectorContext::new(Properties::host());
        let collectors = registry
            .create_all(
                &["GuestStats".to_string(), "MemoryStatistics".to_string()],
                &context,
            )
            .unwrap();
        assert_eq!(collectors.len(), 1);
        assert_eq!(collectors[0].name(), "MemoryStatistics");
    }

    #[test]
    fn test_system_collectors_are_built_by_name() {
        let registry = CollectorRegistry::with_defaults();
        let names: Vec<String> = ["CpuUsage", "KsmStats", "ApplicationsStats"]
            .iter()
            .map(|name| name.to_string())
            .collect();

        let bare = registry
            .create_all(&names, &CollectorContext::new(Properties::host()))
            .unwrap();
        let bare: Vec<&str> = bare.iter().map(|c| c.name()).collect();
        assert_eq!(bare, vec!["CpuUsage", "KsmStats"]);

        let context = CollectorContext::new(Properties::host())
            .with_applications(vec!["qemu-kvm".to_string()]);
        let collectors = registry.create_all(&names, &context).unwrap();
        let built: Vec<&str> = collectors.iter().map(|c| c.name()).collect();
        assert_eq!(built, vec!["CpuUsage", "KsmStats", "ApplicationsStats"]);
    }
}

mod guest_monitor_tests {
    use super::*;

    fn config() -> HostConfig {
        let mut config = HostConfig::default();
        config.guest_monitor.interval = 0.05;
        config.guest_monitor.check_readiness_interval = 0.02;
        config.guest_monitor.collectors =
            vec!["GuestStats".to_string(), "GuestHypervisor".to_string()];
        config
    }

    #[tokio::test]
    async fn test_readiness_notifies_current_allocation() {
        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain("1", "vm-1", 4096.0, 2048.7);

        let policy = Arc::new(GuestPolicy::new().with_script("memory", |_| 1024.0));
        let server = Arc::new(GuestServer::new("vm-1", None, policy));
        let connector = LocalConnector::new();
        connector.add_server(server.clone());

        let guest = GuestMonitor::new(
            "1",
            &config(),
            &CollectorRegistry::with_defaults(),
            hypervisor.clone(),
            connector.as_ref(),
            Terminable::new(),
        )
        .await
        .unwrap();

        assert!(!guest.is_ready());
        assert!(guest.check_guest_readiness().await.unwrap());
        assert!(guest.is_ready());

        let notify = server.interrogate().notify.unwrap();
        assert_eq!(notify.content.alloc["memory"], 2048.0);
        assert_eq!(notify.content.grace_period, None);
    }

    #[tokio::test]
    async fn test_run_collects_guest_and_hypervisor_data() {
        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain("1", "vm-1", 4096.0, 2048.0);

        let policy = Arc::new(GuestPolicy::new().with_script("memory", |_| 1024.0));
        let server = Arc::new(GuestServer::new("vm-1", None, policy));
        let connector = LocalConnector::new();
        connector.add_server(server.clone());

        let terminable = Terminable::new();
        let guest = GuestMonitor::new(
            "1",
            &config(),
            &CollectorRegistry::with_defaults(),
            hypervisor,
            connector.as_ref(),
            terminable.clone(),
        )
        .await
        .unwrap();

        let handle = tokio::spawn(guest.clone().run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminable.terminate();
        handle.await.unwrap().unwrap();

        let entity = guest.interrogate().unwrap();
        assert_eq!(entity.stat_f64("libvirt.curmem").unwrap(), 2048.0);
        assert_eq!(entity.stat_f64("libvirt.maxmem").unwrap(), 4096.0);
        assert!(entity.stat("notify.update-time").is_ok());

        let answer = entity
            .guest_client()
            .unwrap()
            .inquire(InquiryContent::default(), None)
            .await
            .unwrap();
        assert_eq!(answer["memory"], 1024.0);
    }

    #[tokio::test]
    async fn test_terminated_before_guest_answers() {
        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain("1", "vm-1", 4096.0, 2048.0);

        let terminable = Terminable::new();
        let guest = GuestMonitor::new(
            "1",
            &config(),
            &CollectorRegistry::with_defaults(),
            hypervisor,
            LocalConnector::new().as_ref(),
            terminable.clone(),
        )
        .await
        .unwrap();

        let handle = tokio::spawn(guest.clone().run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        terminable.terminate();
        handle.await.unwrap().unwrap();
        assert!(!guest.is_ready());
    }

    #[tokio::test]
    async fn test_unknown_domain_fails_construction() {
        let result = GuestMonitor::new(
            "42",
            &config(),
            &CollectorRegistry::with_defaults(),
            FakeHypervisor::new(),
            LocalConnector::new().as_ref(),
            Terminable::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
