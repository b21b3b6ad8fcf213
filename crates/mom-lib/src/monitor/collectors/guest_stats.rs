//! Guest-reported statistics fetched over the guest RPC channel

use super::{Collector, CollectorContext};
use crate::communication::GuestClient;
use crate::record::Record;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Runs on the host and asks the guest server for its merged record.
///
/// Failures before the first successful call are swallowed, since the guest
/// may simply not be up yet.
#[derive(Debug)]
pub struct GuestStats {
    client: GuestClient,
    guest_ready: AtomicBool,
}

impl GuestStats {
    pub fn new(client: GuestClient) -> Self {
        Self {
            client,
            guest_ready: AtomicBool::new(false),
        }
    }

    pub fn create(context: &CollectorContext) -> Result<Arc<dyn Collector>> {
        let client = context
            .properties
            .guest_client
            .clone()
            .with_context(|| format!("{} has no guest client", context.properties.name))?;
        Ok(Arc::new(Self::new(client)))
    }
}

#[async_trait]
impl Collector for GuestStats {
    fn name(&self) -> &str {
        "GuestStats"
    }

    async fn collect(&self) -> Result<Record> {
        match self.client.stats(self.client.default_timeout()).await {
            Ok(record) => {
                self.guest_ready.store(true, Ordering::SeqCst);
                Ok(record)
            }
            Err(_) if !self.guest_ready.load(Ordering::SeqCst) => Ok(Record::new()),
            Err(e) => Err(e.into()),
        }
    }
}
