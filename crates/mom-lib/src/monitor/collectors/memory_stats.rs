//! Local memory statistics from `/proc/meminfo` and `/proc/vmstat`

use super::{Collector, CollectorContext};
use crate::memory::{parse_meminfo, MemoryStats, VmStat};
use crate::record::Record;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Reports, under the `memory` key, every `/proc/meminfo` field in MB plus
/// `available`, `unused`, `free`, `cache_and_buff` and `used`, and the
/// cumulative swap/paging counters of `/proc/vmstat`.
#[derive(Debug, Clone)]
pub struct MemoryStatistics {
    meminfo_path: PathBuf,
    vmstat_path: Option<PathBuf>,
}

impl Default for MemoryStatistics {
    fn default() -> Self {
        Self::new("/proc/meminfo", Some("/proc/vmstat".into()))
    }
}

impl MemoryStatistics {
    pub fn new(meminfo_path: impl Into<PathBuf>, vmstat_path: Option<PathBuf>) -> Self {
        Self {
            meminfo_path: meminfo_path.into(),
            vmstat_path,
        }
    }

    pub fn create(_context: &CollectorContext) -> Result<Arc<dyn Collector>> {
        Ok(Arc::new(Self::default()))
    }
}

#[async_trait]
impl Collector for MemoryStatistics {
    fn name(&self) -> &str {
        "MemoryStatistics"
    }

    async fn collect(&self) -> Result<Record> {
        let contents = tokio::fs::read_to_string(&self.meminfo_path)
            .await
            .with_context(|| format!("Failed to read {}", self.meminfo_path.display()))?;
        let fields = parse_meminfo(&contents);
        let stats = MemoryStats::from_meminfo(&fields)?;

        let mut memory: Record = fields
            .iter()
            .map(|(key, kb)| (key.clone(), Value::from(*kb as f64 / 1024.0)))
            .collect();
        if let Value::Object(summary) = serde_json::to_value(stats)? {
            memory.extend(summary);
        }

        if let Some(vmstat_path) = &self.vmstat_path {
            let contents = tokio::fs::read_to_string(vmstat_path)
                .await
                .with_context(|| format!("Failed to read {}", vmstat_path.display()))?;
            if let Value::Object(counters) = serde_json::to_value(VmStat::parse(&contents))? {
                memory.extend(counters);
            }
        }

        let mut record = Record::new();
        record.insert("memory".to_string(), Value::Object(memory));
        Ok(record)
    }
}
