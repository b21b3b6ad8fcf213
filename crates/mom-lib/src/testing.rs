//! In-memory stand-ins for the hypervisor, guest servers and collectors

use crate::communication::{Connector, GuestClient, GuestServer, LocalTransport, Message, Transport};
use crate::error::RpcError;
use crate::hypervisor::{DomainInfo, DomainState, Hypervisor};
use crate::monitor::Collector;
use crate::record::Record;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Hypervisor keeping its domains in memory
#[derive(Default)]
pub struct FakeHypervisor {
    domains: Mutex<BTreeMap<String, DomainInfo>>,
    set_memory_calls: Mutex<Vec<(String, f64)>>,
    crash_on_list: AtomicBool,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_domain(&self, id: &str, name: &str, max_mem_mb: f64, cur_mem_mb: f64) {
        self.domains.lock().unwrap().insert(
            id.to_string(),
            DomainInfo {
                id: id.to_string(),
                name: name.to_string(),
                uuid: Some(format!("uuid-{}", id)),
                state: DomainState::Running,
                max_mem_mb,
                cur_mem_mb,
                address: None,
            },
        );
    }

    pub fn remove_domain(&self, id: &str) {
        self.domains.lock().unwrap().remove(id);
    }

    pub fn cur_mem(&self, id: &str) -> Option<f64> {
        self.domains.lock().unwrap().get(id).map(|d| d.cur_mem_mb)
    }

    pub fn set_memory_calls(&self) -> Vec<(String, f64)> {
        self.set_memory_calls.lock().unwrap().clone()
    }

    /// Make the next domain listing panic, killing the calling task
    pub fn crash_on_list(&self) {
        self.crash_on_list.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn list_domain_ids(&self) -> Result<Vec<String>> {
        if self.crash_on_list.load(Ordering::SeqCst) {
            panic!("domain listing crashed");
        }
        Ok(self.domains.lock().unwrap().keys().cloned().collect())
    }

    async fn domain_info(&self, id: &str) -> Result<DomainInfo> {
        self.domains
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("Domain not found: {}", id))
    }

    async fn memory_stats(&self, id: &str) -> Result<Record> {
        let cur_mem = self
            .cur_mem(id)
            .ok_or_else(|| anyhow!("Domain not found: {}", id))?;
        let mut record = Record::new();
        record.insert("actual".to_string(), Value::from(cur_mem));
        Ok(record)
    }

    async fn set_memory(&self, id: &str, target_mb: f64) -> Result<()> {
        self.set_memory_calls
            .lock()
            .unwrap()
            .push((id.to_string(), target_mb));
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(id)
            .ok_or_else(|| anyhow!("Domain not found: {}", id))?;
        domain.cur_mem_mb = target_mb;
        Ok(())
    }
}

/// Transport to a guest that never answers
pub struct UnreachableTransport;

#[async_trait]
impl Transport for UnreachableTransport {
    async fn send_receive(
        &self,
        _message: &Message,
        _timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        Err(RpcError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        )))
    }
}

/// Routes guest names to in-process guest servers. The route is resolved on
/// every call, so removing a server makes its guest unreachable.
#[derive(Default)]
pub struct LocalConnector {
    servers: Arc<DashMap<String, Arc<GuestServer>>>,
}

impl LocalConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_server(&self, server: Arc<GuestServer>) {
        self.servers.insert(server.name().to_string(), server);
    }

    pub fn remove_server(&self, name: &str) {
        self.servers.remove(name);
    }
}

impl Connector for LocalConnector {
    fn connect(&self, name: &str, _address: &str) -> GuestClient {
        let transport = RoutedTransport {
            name: name.to_string(),
            servers: self.servers.clone(),
        };
        GuestClient::new(name, Arc::new(transport), Some(Duration::from_secs(1)))
    }
}

struct RoutedTransport {
    name: String,
    servers: Arc<DashMap<String, Arc<GuestServer>>>,
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn send_receive(
        &self,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let server = self.servers.get(&self.name).map(|server| server.clone());
        match server {
            Some(server) => {
                LocalTransport::new(server)
                    .send_receive(message, timeout)
                    .await
            }
            None => UnreachableTransport.send_receive(message, timeout).await,
        }
    }
}

/// Collector returning a fixed record and counting its calls
pub struct StaticCollector {
    name: String,
    record: Record,
    pub calls: AtomicUsize,
}

impl StaticCollector {
    pub fn new(name: &str, record: Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            record: record.as_object().cloned().unwrap_or_default(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Collector for StaticCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> Result<Record> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut record = self.record.clone();
        record.insert("sample".to_string(), Value::from(call));
        Ok(record)
    }
}

pub struct FailingCollector;

#[async_trait]
impl Collector for FailingCollector {
    fn name(&self) -> &str {
        "Failing"
    }

    async fn collect(&self) -> Result<Record> {
        Err(anyhow!("collector exploded"))
    }
}
