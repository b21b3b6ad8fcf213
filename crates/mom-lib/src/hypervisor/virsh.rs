//! `virsh`-backed hypervisor

use super::{DomainInfo, DomainState, Hypervisor};
use crate::record::Record;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

/// Balloon statistics that are counters rather than sizes
const COUNTER_STATS: &[&str] = &[
    "major_fault",
    "minor_fault",
    "last_update",
    "hugetlb_pgalloc",
    "hugetlb_pgfail",
];

#[derive(Debug, Clone, Default)]
pub struct VirshHypervisor {
    uri: Option<String>,
}

impl VirshHypervisor {
    pub fn new(uri: Option<String>) -> Self {
        Self { uri }
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut command = Command::new("virsh");
        if let Some(uri) = &self.uri {
            command.arg("-c").arg(uri);
        }
        command.args(args);

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run virsh {}", args.join(" ")))?;

        if !output.status.success() {
            bail!(
                "virsh {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        String::from_utf8(output.stdout).context("virsh produced non UTF-8 output")
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn list_domain_ids(&self) -> Result<Vec<String>> {
        let output = self.virsh(&["list", "--id"]).await?;
        Ok(parse_domain_ids(&output))
    }

    async fn domain_info(&self, id: &str) -> Result<DomainInfo> {
        let output = self.virsh(&["dominfo", id]).await?;
        let mut info = parse_dominfo(id, &output)?;

        // Guests without a DHCP lease are reached by name
        match self.virsh(&["domifaddr", id]).await {
            Ok(output) => info.address = parse_domifaddr(&output),
            Err(e) => debug!(domain = %id, error = %e, "No interface address"),
        }

        Ok(info)
    }

    async fn memory_stats(&self, id: &str) -> Result<Record> {
        let output = self.virsh(&["dommemstat", id]).await?;
        Ok(parse_dommemstat(&output))
    }

    async fn set_memory(&self, id: &str, target_mb: f64) -> Result<()> {
        let size = format!("{}KiB", (target_mb * 1024.0).round().max(0.0) as u64);
        self.virsh(&["setmem", id, &size, "--live"]).await?;
        Ok(())
    }
}

fn parse_domain_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Parse a memory size such as `2097152 KiB` into MB
fn parse_memory_mb(value: &str) -> Option<f64> {
    let mut tokens = value.split_whitespace();
    let amount: f64 = tokens.next()?.parse().ok()?;
    let factor = match tokens.next().unwrap_or("KiB") {
        "B" | "bytes" => 1.0 / (1024.0 * 1024.0),
        "KiB" | "KB" | "k" => 1.0 / 1024.0,
        "MiB" | "MB" | "M" => 1.0,
        "GiB" | "GB" | "G" => 1024.0,
        _ => return None,
    };
    Some(amount * factor)
}

fn parse_dominfo(id: &str, output: &str) -> Result<DomainInfo> {
    let mut name = None;
    let mut uuid = None;
    let mut state = DomainState::NoState;
    let mut max_mem_mb = None;
    let mut cur_mem_mb = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Name" => name = Some(value.to_string()),
            "UUID" => uuid = Some(value.to_string()),
            "State" => state = DomainState::parse(value),
            "Max memory" => max_mem_mb = parse_memory_mb(value),
            "Used memory" => cur_mem_mb = parse_memory_mb(value),
            _ => {}
        }
    }

    Ok(DomainInfo {
        id: id.to_string(),
        name: name.with_context(|| format!("dominfo of domain {} has no name", id))?,
        uuid,
        state,
        max_mem_mb: max_mem_mb
            .with_context(|| format!("dominfo of domain {} has no max memory", id))?,
        cur_mem_mb: cur_mem_mb
            .with_context(|| format!("dominfo of domain {} has no used memory", id))?,
        address: None,
    })
}

fn parse_dommemstat(output: &str) -> Record {
    let mut stats = Record::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        let (Some(key), Some(value)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        let value = if COUNTER_STATS.contains(&key) {
            value
        } else {
            value / 1024.0
        };
        stats.insert(key.to_string(), Value::from(value));
    }
    stats
}

/// First IPv4 address printed by `virsh domifaddr`, without its prefix length
fn parse_domifaddr(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [_, _, "ipv4", address, ..] => address.split('/').next().map(str::to_string),
            _ => None,
        }
    })
}
