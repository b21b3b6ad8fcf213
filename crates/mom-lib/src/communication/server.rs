//! Guest server
//!
//! Dispatches received [`Message`]s against the server's stored data, the
//! guest's local monitor and its [`GuestPolicy`]. Every request is answered
//! with an [`Envelope`]; processing failures become `ack = false`.

use super::client::Transport;
use super::codec::{read_frame, write_frame};
use super::messages::{Allocation, Envelope, InquiryContent, Message, NotifyContent};
use crate::error::RpcError;
use crate::guest::GuestPolicy;
use crate::monitor::Monitor;
use crate::record::{merge_records, now_secs, Record};
use crate::terminable::Terminable;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Last inquiry as stored by the guest
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoredInquiry {
    #[serde(flatten)]
    pub content: InquiryContent,
    pub update_time: f64,
}

/// Last notification as stored by the guest
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoredNotify {
    #[serde(flatten)]
    pub content: NotifyContent,
    pub update_time: f64,
}

/// Application target as stored by the guest
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoredAppTarget {
    #[serde(flatten)]
    pub target: Allocation,
    pub update_time: f64,
}

/// Data received from the host and the local resource control
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify: Option<StoredNotify>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inquiry: Option<StoredInquiry>,
    #[serde(rename = "app-target", skip_serializing_if = "Option::is_none")]
    pub app_target: Option<StoredAppTarget>,
}

impl ServerData {
    pub fn to_record(&self) -> Result<Record> {
        match serde_json::to_value(self)? {
            Value::Object(record) => Ok(record),
            other => anyhow::bail!("server data serialized to {}", other),
        }
    }
}

pub struct GuestServer {
    name: String,
    data: Mutex<ServerData>,
    monitor: Option<Arc<Monitor>>,
    policy: Arc<GuestPolicy>,
}

impl std::fmt::Debug for GuestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestServer")
            .field("name", &self.name)
            .field("data", &self.interrogate())
            .finish()
    }
}

impl GuestServer {
    pub fn new(
        name: impl Into<String>,
        monitor: Option<Arc<Monitor>>,
        policy: Arc<GuestPolicy>,
    ) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(ServerData::default()),
            monitor,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &Arc<GuestPolicy> {
        &self.policy
    }

    fn data(&self) -> MutexGuard<'_, ServerData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the stored data
    pub fn interrogate(&self) -> ServerData {
        self.data().clone()
    }

    /// Process one request and wrap the outcome in an envelope
    pub async fn process_message(&self, message: Message) -> Envelope {
        let start = Instant::now();
        let kind = message.kind();

        match self.dispatch(message).await {
            Ok(response) => Envelope::ok(response, start.elapsed().as_secs_f64()),
            Err(e) => {
                error!(guest = %self.name, message = %kind, error = %e, "Failed to process message");
                Envelope::failed(format!("{:#}", e), start.elapsed().as_secs_f64())
            }
        }
    }

    async fn dispatch(&self, message: Message) -> Result<Record> {
        match message {
            Message::Echo(_) => Ok(Record::new()),

            Message::Inquiry(content) => {
                let grace_period = content.grace_period;
                self.data().inquiry = Some(StoredInquiry {
                    content,
                    update_time: now_secs(),
                });
                Ok(self
                    .policy
                    .inquiry(grace_period)
                    .into_iter()
                    .map(|(resource, value)| (resource, Value::from(value)))
                    .collect())
            }

            Message::Notify(content) => {
                self.data().notify = Some(StoredNotify {
                    content,
                    update_time: now_secs(),
                });
                self.policy.notify();
                Ok(Record::new())
            }

            Message::Stats(_) => {
                let collected = match &self.monitor {
                    Some(monitor) => monitor.collect().await,
                    None => Record::new(),
                };
                let mut merged = self.interrogate().to_record()?;
                merge_records(&mut merged, collected);

                let mut response = Record::new();
                response.insert("monitor".to_string(), Value::Object(merged));
                Ok(response)
            }

            Message::TargetAllocation(content) => {
                let timeout = content.timeout.map(crate::config::secs);
                let is_new_notification = self.policy.wait_for_notify(timeout).await;

                let mut response = match &self.interrogate().notify {
                    Some(notify) => match serde_json::to_value(notify)? {
                        Value::Object(record) => record,
                        _ => Record::new(),
                    },
                    None => Record::new(),
                };
                response.insert(
                    "is-new-notification".to_string(),
                    Value::from(is_new_notification),
                );
                Ok(response)
            }

            Message::UpdateResourceDiff(diff) => {
                self.policy.update_resource_diff(diff);
                Ok(Record::new())
            }

            Message::UpdateApplicationTarget(target) => {
                let mut data = self.data();
                let mut stored = data.app_target.take().map(|t| t.target).unwrap_or_default();
                stored.extend(target);
                data.app_target = Some(StoredAppTarget {
                    target: stored,
                    update_time: now_secs(),
                });
                Ok(Record::new())
            }
        }
    }

    /// Accept connections on `listener` until terminated
    pub async fn serve(self: Arc<Self>, listener: TcpListener, terminable: Terminable) -> Result<()> {
        let address = listener
            .local_addr()
            .context("Failed to read listener address")?;
        info!(guest = %self.name, address = %address, "Guest server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted connection");
                            let server = self.clone();
                            let terminable = terminable.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, terminable).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = terminable.terminated() => {
                    info!(guest = %self.name, "Shutting down guest server");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream, terminable: Terminable) {
        loop {
            let frame: Option<Value> = tokio::select! {
                frame = read_frame(&mut stream) => match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "Dropping connection");
                        return;
                    }
                },
                _ = terminable.terminated() => return,
            };
            let Some(frame) = frame else {
                return;
            };

            let envelope = match serde_json::from_value::<Message>(frame) {
                Ok(message) => self.process_message(message).await,
                Err(e) => Envelope::failed(format!("Malformed message: {}", e), 0.0),
            };

            if let Err(e) = write_frame(&mut stream, &envelope).await {
                debug!(error = %e, "Failed to send response");
                return;
            }
        }
    }
}

/// In-process transport dispatching straight into a [`GuestServer`]
#[derive(Debug, Clone)]
pub struct LocalTransport {
    server: Arc<GuestServer>,
}

impl LocalTransport {
    pub fn new(server: Arc<GuestServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_receive(
        &self,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let process = self.server.process_message(message.clone());
        let envelope = match timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, process)
                    .await
                    .map_err(|_| RpcError::Timeout {
                        message: message.kind(),
                        timeout,
                    })?
            }
            None => process.await,
        };
        Ok(serde_json::to_value(envelope)?)
    }
}
