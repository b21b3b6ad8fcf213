//! Guest client
//!
//! A [`GuestClient`] sends [`Message`]s through a [`Transport`] and checks
//! the reply envelope. [`TcpTransport`] keeps a single connection to a guest
//! server, serializes calls on it and reconnects after any failure.

use super::codec::{read_frame, write_frame};
use super::messages::{
    Allocation, InquiryContent, Message, NotifyContent, TargetAllocation,
    TargetAllocationContent,
};
use crate::error::RpcError;
use crate::record::Record;
use crate::terminable::Terminable;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Request/reply channel to one guest server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` and return the raw reply envelope.
    ///
    /// `timeout` bounds the whole exchange; `None` waits indefinitely.
    async fn send_receive(
        &self,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError>;

    /// Release the underlying connection; later calls may reconnect
    async fn close(&self) {}
}

/// TCP transport with one lazily established connection
pub struct TcpTransport {
    address: String,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn exchange(
        stream: &mut Option<TcpStream>,
        address: &str,
        message: &Message,
    ) -> Result<Value, RpcError> {
        if stream.is_none() {
            let connected =
                TcpStream::connect(address)
                    .await
                    .map_err(|source| RpcError::Connect {
                        address: address.to_string(),
                        source,
                    })?;
            connected.set_nodelay(true)?;
            *stream = Some(connected);
        }
        let connection = stream.as_mut().ok_or(RpcError::Closed)?;

        write_frame(connection, message).await?;
        read_frame(connection).await?.ok_or_else(|| {
            RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by guest server",
            ))
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_receive(
        &self,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let mut stream = self.stream.lock().await;

        let exchange = Self::exchange(&mut stream, &self.address, message);
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or(Err(RpcError::Timeout {
                    message: message.kind(),
                    timeout,
                })),
            None => exchange.await,
        };

        // A failed exchange may leave half a frame in flight
        if result.is_err() {
            *stream = None;
        }
        result
    }

    async fn close(&self) {
        self.stream.lock().await.take();
    }
}

/// Creates guest clients for newly discovered guests
pub trait Connector: Send + Sync {
    fn connect(&self, name: &str, address: &str) -> GuestClient;
}

/// Connects guests over TCP on a fixed port
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub port: u16,
    pub default_timeout: Option<Duration>,
}

impl Connector for TcpConnector {
    fn connect(&self, name: &str, address: &str) -> GuestClient {
        let transport = TcpTransport::new(format!("{}:{}", address, self.port));
        GuestClient::new(name, Arc::new(transport), self.default_timeout)
    }
}

/// Typed access to one guest server
#[derive(Clone)]
pub struct GuestClient {
    name: String,
    transport: Arc<dyn Transport>,
    default_timeout: Option<Duration>,
}

impl std::fmt::Debug for GuestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestClient")
            .field("name", &self.name)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl GuestClient {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            default_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Send with the client's default timeout
    pub async fn send_receive(&self, message: &Message) -> Result<Record, RpcError> {
        self.send_receive_with_timeout(message, self.default_timeout)
            .await
    }

    /// Send and validate the reply envelope
    pub async fn send_receive_with_timeout(
        &self,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<Record, RpcError> {
        let envelope = self.transport.send_receive(message, timeout).await?;
        unwrap_envelope(message.kind(), envelope)
    }

    pub async fn close(&self) {
        self.transport.close().await;
        info!(guest = %self.name, "Closed guest client");
    }

    pub async fn echo(&self, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.send_receive_with_timeout(&Message::echo(), timeout)
            .await
            .map(|_| ())
    }

    /// Ask the guest for its desired allocation
    pub async fn inquire(
        &self,
        content: InquiryContent,
        timeout: Option<Duration>,
    ) -> Result<Allocation, RpcError> {
        let message = Message::Inquiry(content);
        let response = self.send_receive_with_timeout(&message, timeout).await?;
        parse_response(message.kind(), response)
    }

    pub async fn notify(
        &self,
        alloc: Allocation,
        grace_period: Option<f64>,
        timeout: Option<Duration>,
    ) -> Result<(), RpcError> {
        let message = Message::Notify(NotifyContent {
            alloc,
            grace_period,
        });
        self.send_receive_with_timeout(&message, timeout)
            .await
            .map(|_| ())
    }

    /// Fetch the guest's merged monitor record
    pub async fn stats(&self, timeout: Option<Duration>) -> Result<Record, RpcError> {
        let mut response = self
            .send_receive_with_timeout(&Message::stats(), timeout)
            .await?;
        match response.remove("monitor") {
            Some(Value::Object(record)) => Ok(record),
            other => Err(RpcError::InvalidResponse {
                message: "Stats",
                reason: format!("monitor data must be a map, got {:?}", other),
            }),
        }
    }

    /// Wait up to `wait` seconds for a new notification and return the latest
    pub async fn target_allocation(
        &self,
        wait: Option<f64>,
        timeout: Option<Duration>,
    ) -> Result<TargetAllocation, RpcError> {
        let message = Message::TargetAllocation(TargetAllocationContent { timeout: wait });
        let response = self.send_receive_with_timeout(&message, timeout).await?;
        parse_response(message.kind(), response)
    }

    pub async fn update_resource_diff(
        &self,
        diff: Allocation,
        timeout: Option<Duration>,
    ) -> Result<(), RpcError> {
        self.send_receive_with_timeout(&Message::UpdateResourceDiff(diff), timeout)
            .await
            .map(|_| ())
    }

    pub async fn update_application_target(
        &self,
        target: Allocation,
        timeout: Option<Duration>,
    ) -> Result<(), RpcError> {
        self.send_receive_with_timeout(&Message::UpdateApplicationTarget(target), timeout)
            .await
            .map(|_| ())
    }

    /// Probe the server with Echo until it answers.
    ///
    /// Connection failures are retried every `interval`, up to
    /// `max_retries` attempts. Returns `Ok(false)` when terminated while
    /// waiting.
    pub async fn wait_for_server(
        &self,
        interval: Duration,
        attempt_timeout: Duration,
        max_retries: u32,
        terminable: &Terminable,
    ) -> Result<bool, RpcError> {
        let start_wait = Instant::now();
        debug!(guest = %self.name, "Waiting for guest server");

        for attempt in 0..max_retries {
            if !terminable.should_run() {
                return Ok(false);
            }

            let start_attempt = Instant::now();
            match self.echo(Some(attempt_timeout)).await {
                Ok(()) => {
                    info!(guest = %self.name, "Guest server is ready");
                    return Ok(true);
                }
                Err(e) if e.is_message_error() => return Err(e),
                Err(e) => {
                    debug!(guest = %self.name, attempt = attempt + 1, error = %e, "Guest server not ready");
                }
            }

            if attempt + 1 < max_retries {
                let remaining = interval.saturating_sub(start_attempt.elapsed());
                terminable.terminable_sleep(remaining).await;
            }
        }

        if !terminable.should_run() {
            return Ok(false);
        }
        Err(RpcError::ServerUnavailable {
            attempts: max_retries,
            elapsed: start_wait.elapsed(),
        })
    }
}

fn unwrap_envelope(message: &'static str, envelope: Value) -> Result<Record, RpcError> {
    let mut envelope = match envelope {
        Value::Object(envelope) => envelope,
        other => {
            return Err(RpcError::InvalidResponse {
                message,
                reason: format!("envelope must be a map, got {}", other),
            })
        }
    };

    if !envelope.get("ack").and_then(Value::as_bool).unwrap_or(false) {
        let error = envelope
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("<no error message>")
            .to_string();
        return Err(RpcError::Rejected { message, error });
    }

    match envelope.remove("response") {
        Some(Value::Object(response)) => Ok(response),
        other => Err(RpcError::InvalidResponse {
            message,
            reason: format!("response data must be a map, got {:?}", other),
        }),
    }
}

fn parse_response<T: DeserializeOwned>(
    message: &'static str,
    response: Record,
) -> Result<T, RpcError> {
    serde_json::from_value(Value::Object(response)).map_err(|e| RpcError::InvalidResponse {
        message,
        reason: e.to_string(),
    })
}
