//! Per-application CPU and memory usage from `/proc/<pid>/stat`

use super::{Collector, CollectorContext, CLOCK_TICKS};
use crate::record::{now_secs, Record};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const PAGES_PER_MB: f64 = 256.0;
const BYTES_PER_MB: f64 = 1048576.0;
const DEFAULT_MISSING_TIMEOUT: Duration = Duration::from_secs(60);

/// Usage of one process, CPU in seconds and memory in MB
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ProcessStats {
    utime: f64,
    stime: f64,
    rss: f64,
    vsize: f64,
}

impl ProcessStats {
    /// Parse a `/proc/<pid>/stat` line. The command name may hold spaces and
    /// parentheses, so fields are counted from the last `)`.
    fn parse(contents: &str) -> Result<Self> {
        let Some((_, rest)) = contents.rsplit_once(')') else {
            bail!("Missing command name");
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // `fields[0]` is field 3 (state) of proc(5)
        let field = |number: usize| -> Result<f64> {
            let value = fields
                .get(number - 3)
                .with_context(|| format!("Missing field {}", number))?;
            let value: u64 = value
                .parse()
                .with_context(|| format!("Invalid field {} '{}'", number, value))?;
            Ok(value as f64)
        };

        Ok(Self {
            utime: field(14)? / CLOCK_TICKS,
            stime: field(15)? / CLOCK_TICKS,
            vsize: field(23)? / BYTES_PER_MB,
            rss: field(24)? / PAGES_PER_MB,
        })
    }
}

#[derive(Debug)]
struct Tracking {
    applications: Vec<String>,
    /// Application → when it was first found without processes
    missing: HashMap<String, Instant>,
}

/// Reports, for each configured application pattern, an `<app>-stats` entry
/// summing `cpu.{utime,stime,total}` and `memory.{rss,vsize}` over every
/// process whose command line contains the pattern.
///
/// Applications without a process for longer than the missing timeout are
/// no longer looked for.
#[derive(Debug)]
pub struct ApplicationsStats {
    proc_root: PathBuf,
    missing_timeout: Duration,
    tracking: Mutex<Tracking>,
}

impl ApplicationsStats {
    pub fn new(proc_root: impl Into<PathBuf>, applications: Vec<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            missing_timeout: DEFAULT_MISSING_TIMEOUT,
            tracking: Mutex::new(Tracking {
                applications,
                missing: HashMap::new(),
            }),
        }
    }

    pub fn with_missing_timeout(mut self, timeout: Duration) -> Self {
        self.missing_timeout = timeout;
        self
    }

    pub fn create(context: &CollectorContext) -> Result<Arc<dyn Collector>> {
        if context.applications.is_empty() {
            bail!("No applications configured");
        }
        Ok(Arc::new(Self::new("/proc", context.applications.clone())))
    }

    /// Applications still looked for
    pub fn applications(&self) -> Vec<String> {
        self.tracking().applications.clone()
    }

    fn tracking(&self) -> std::sync::MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pid and space-joined command line of every process
    async fn processes(&self) -> Result<Vec<(u32, String)>> {
        let mut entries = tokio::fs::read_dir(&self.proc_root)
            .await
            .with_context(|| format!("Failed to list {}", self.proc_root.display()))?;

        let own_pid = std::process::id();
        let mut processes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            // Processes may exit while the directory is scanned
            let Ok(cmdline) = tokio::fs::read(entry.path().join("cmdline")).await else {
                continue;
            };
            let cmdline = String::from_utf8_lossy(&cmdline)
                .split('\0')
                .filter(|arg| !arg.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if !cmdline.is_empty() {
                processes.push((pid, cmdline));
            }
        }
        Ok(processes)
    }

    async fn read_pid_stat(root: &Path, pid: u32) -> Result<ProcessStats> {
        let path = root.join(pid.to_string()).join("stat");
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        ProcessStats::parse(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn mark(&self, application: &str, found: bool) {
        let mut tracking = self.tracking();
        if found {
            tracking.missing.remove(application);
        } else {
            tracking
                .missing
                .entry(application.to_string())
                .or_insert_with(Instant::now);
        }
    }

    fn forget_missing(&self) {
        let mut tracking = self.tracking();
        let expired: Vec<String> = tracking
            .missing
            .iter()
            .filter(|(_, since)| since.elapsed() >= self.missing_timeout)
            .map(|(application, _)| application.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        info!(
            applications = ?expired,
            timeout_secs = self.missing_timeout.as_secs_f64(),
            "Applications not found, no longer looking for them"
        );
        for application in &expired {
            tracking.missing.remove(application);
        }
        tracking
            .applications
            .retain(|application| !expired.contains(application));
    }
}

#[async_trait]
impl Collector for ApplicationsStats {
    fn name(&self) -> &str {
        "ApplicationsStats"
    }

    async fn collect(&self) -> Result<Record> {
        let time = now_secs();
        let applications = self.applications();
        let processes = self.processes().await?;

        let mut record = Record::new();
        for application in &applications {
            let pids: Vec<u32> = processes
                .iter()
                .filter(|(_, cmdline)| cmdline.contains(application.as_str()))
                .map(|(pid, _)| *pid)
                .collect();
            self.mark(application, !pids.is_empty());

            let mut found = false;
            let mut sum = ProcessStats::default();
            for pid in pids {
                match Self::read_pid_stat(&self.proc_root, pid).await {
                    Ok(stats) => {
                        found = true;
                        sum.utime += stats.utime;
                        sum.stime += stats.stime;
                        sum.rss += stats.rss;
                        sum.vsize += stats.vsize;
                    }
                    Err(e) => debug!(application = %application, pid = pid, error = %e, "Skipping process"),
                }
            }
            if !found {
                continue;
            }

            record.insert(
                format!("{}-stats", application),
                json!({
                    "time": time,
                    "cpu": {
                        "utime": sum.utime,
                        "stime": sum.stime,
                        "total": sum.utime + sum.stime,
                    },
                    "memory": {"rss": sum.rss, "vsize": sum.vsize},
                }),
            );
        }

        self.forget_missing();
        Ok(record)
    }
}
