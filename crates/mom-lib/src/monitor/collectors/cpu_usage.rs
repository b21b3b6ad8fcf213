//! Cumulative CPU times from `/proc/stat`

use super::{Collector, CollectorContext, CLOCK_TICKS};
use crate::record::{now_secs, Record};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

const FIELDS: [&str; 10] = [
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

/// One `cpu` line of `/proc/stat`, in clock ticks
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuTimes([u64; 10]);

impl CpuTimes {
    fn parse<'a>(values: impl Iterator<Item = &'a str>) -> Result<Self> {
        let mut times = [0u64; 10];
        // Older kernels print fewer columns; the missing ones stay zero
        for (slot, value) in times.iter_mut().zip(values) {
            *slot = value
                .parse()
                .with_context(|| format!("Invalid CPU time '{}'", value))?;
        }
        Ok(Self(times))
    }

    /// Raw columns plus the aggregates `top` derives from them, in seconds.
    ///
    /// Guest time is already accounted in `user` and `nice`, so it is taken
    /// out of `user-non-virtual` and counted once in `total`.
    fn to_value(self) -> Value {
        let [user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice] =
            self.0.map(|ticks| ticks as f64);
        let user_time = user - guest;
        let nice_time = nice - guest_nice;
        let idle_all = idle + iowait;
        let system_all = system + irq + softirq;
        let virtual_time = guest + guest_nice;
        let total = user_time + nice_time + system_all + idle_all + steal + virtual_time;

        let mut stats = Map::new();
        for (name, ticks) in [
            ("total", total),
            ("virtual", virtual_time),
            ("system-all", system_all),
            ("idle-all", idle_all),
            ("user-non-virtual", user_time),
        ] {
            stats.insert(name.to_string(), Value::from(ticks / CLOCK_TICKS));
        }
        for (name, ticks) in FIELDS.iter().zip(self.0) {
            stats.insert(name.to_string(), Value::from(ticks as f64 / CLOCK_TICKS));
        }
        Value::Object(stats)
    }
}

/// Reports, under the `cpu` key, the sample `time` and per line of
/// `/proc/stat` a `cpu-total` or `cpu-<n>` entry of cumulative seconds
#[derive(Debug, Clone)]
pub struct CpuUsage {
    path: PathBuf,
}

impl Default for CpuUsage {
    fn default() -> Self {
        Self::new("/proc/stat")
    }
}

impl CpuUsage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn create(_context: &CollectorContext) -> Result<Arc<dyn Collector>> {
        Ok(Arc::new(Self::default()))
    }
}

fn parse_proc_stat(contents: &str) -> Result<Vec<(String, CpuTimes)>> {
    let mut cpus = Vec::new();
    for line in contents.lines().filter(|line| line.starts_with("cpu")) {
        let mut tokens = line.split_whitespace();
        let Some(label) = tokens.next() else {
            continue;
        };
        let key = match &label[3..] {
            "" => "cpu-total".to_string(),
            id => format!("cpu-{}", id),
        };
        cpus.push((key, CpuTimes::parse(tokens)?));
    }
    if cpus.is_empty() {
        bail!("No cpu lines found");
    }
    Ok(cpus)
}

#[async_trait]
impl Collector for CpuUsage {
    fn name(&self) -> &str {
        "CpuUsage"
    }

    async fn collect(&self) -> Result<Record> {
        let time = now_secs();
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let cpus = parse_proc_stat(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        let mut cpu = Map::new();
        cpu.insert("time".to_string(), Value::from(time));
        for (key, times) in cpus {
            cpu.insert(key, times.to_value());
        }

        let mut record = Record::new();
        record.insert("cpu".to_string(), Value::Object(cpu));
        Ok(record)
    }
}
