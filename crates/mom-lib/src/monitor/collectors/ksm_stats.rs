//! Kernel samepage merging counters from `/sys/kernel/mm/ksm`

use super::{Collector, CollectorContext};
use crate::record::Record;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Reports every numeric file of the KSM sysfs directory under the `ksm` key
#[derive(Debug, Clone)]
pub struct KsmStats {
    path: PathBuf,
}

impl Default for KsmStats {
    fn default() -> Self {
        Self::new("/sys/kernel/mm/ksm")
    }
}

impl KsmStats {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn create(_context: &CollectorContext) -> Result<Arc<dyn Collector>> {
        Ok(Arc::new(Self::default()))
    }
}

#[async_trait]
impl Collector for KsmStats {
    fn name(&self) -> &str {
        "KsmStats"
    }

    async fn collect(&self) -> Result<Record> {
        let mut entries = tokio::fs::read_dir(&self.path)
            .await
            .with_context(|| format!("Failed to list {}", self.path.display()))?;

        let mut ksm = Map::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let contents = tokio::fs::read_to_string(entry.path())
                .await
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            // Newer kernels expose a few textual knobs next to the counters
            match contents.trim().parse::<i64>() {
                Ok(value) => {
                    ksm.insert(name, Value::from(value));
                }
                Err(_) => debug!(file = %name, "Skipping non-numeric KSM file"),
            }
        }

        let mut record = Record::new();
        record.insert("ksm".to_string(), Value::Object(ksm));
        Ok(record)
    }
}
