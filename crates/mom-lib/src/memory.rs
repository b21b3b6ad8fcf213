//! Memory quantities and `/proc` memory statistics
//!
//! All memory values handled by the control loop are in MB as `f64`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Default tolerance for treating two memory sizes as equal (MB)
pub const DEFAULT_MEMORY_EPSILON: f64 = 1.0;

/// A memory value is valid when it is a finite number
pub fn is_valid_mem(mem: f64) -> bool {
    mem.is_finite()
}

/// Two memory sizes are close when both are valid and differ by less than `eps`
pub fn is_memory_close(mem1: f64, mem2: f64, eps: f64) -> bool {
    is_valid_mem(mem1) && is_valid_mem(mem2) && mem1 + eps > mem2 && mem2 + eps > mem1
}

/// Memory statistics of the local system, in MB
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Total memory visible to the system
    pub available: f64,
    /// Memory not used for anything
    pub unused: f64,
    /// Unused memory plus reclaimable caches
    pub free: f64,
    /// Page cache plus buffers
    pub cache_and_buff: f64,
    /// `available - unused`
    pub used: f64,
}

impl MemoryStats {
    /// Derive the summary from parsed `/proc/meminfo` fields (values in kB)
    pub fn from_meminfo(fields: &HashMap<String, u64>) -> Result<Self> {
        let field = |name: &str| -> Result<f64> {
            fields
                .get(name)
                .map(|kb| *kb as f64 / 1024.0)
                .with_context(|| format!("meminfo is missing {}", name))
        };

        let available = field("memtotal")?;
        let unused = field("memfree")?;
        let buffers = field("buffers")?;
        let cached = field("cached")?;

        Ok(Self {
            available,
            unused,
            free: unused + buffers + cached,
            cache_and_buff: cached + buffers,
            used: available - unused,
        })
    }

    /// Read and summarize a `/proc/meminfo`-formatted file
    pub async fn load(path: &Path) -> Result<Self> {
        let fields = read_meminfo(path).await?;
        Self::from_meminfo(&fields)
    }
}

/// Parse `/proc/meminfo`-formatted text into lower-cased key → kB value
pub fn parse_meminfo(contents: &str) -> HashMap<String, u64> {
    let mut fields = HashMap::new();
    for line in contents.lines() {
        let mut tokens = line.split_whitespace();
        let Some(key) = tokens.next() else {
            continue;
        };
        let Some(value) = tokens.next() else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        let key = key.trim_end_matches(':').to_lowercase();
        fields.insert(key, value);
    }
    fields
}

pub async fn read_meminfo(path: &Path) -> Result<HashMap<String, u64>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(parse_meminfo(&contents))
}

/// Cumulative paging counters from `/proc/vmstat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VmStat {
    pub swap_in: u64,
    pub swap_out: u64,
    pub page_in: u64,
    pub page_out: u64,
    pub major_fault: u64,
    pub minor_fault: u64,
}

impl VmStat {
    pub fn parse(contents: &str) -> Self {
        let mut result = Self::default();
        for line in contents.lines() {
            let mut tokens = line.split_whitespace();
            let (Some(key), Some(value)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            let field = match key {
                "pswpin" => &mut result.swap_in,
                "pswpout" => &mut result.swap_out,
                "pgpgin" => &mut result.page_in,
                "pgpgout" => &mut result.page_out,
                "pgmajfault" => &mut result.major_fault,
                "pgfault" => &mut result.minor_fault,
                _ => continue,
            };
            if let Ok(value) = value.parse() {
                *field = value;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOCK_MEMINFO: &str = r#"MemTotal:        8388608 kB
MemFree:         2097152 kB
MemAvailable:    6704404 kB
Buffers:          524288 kB
Cached:          1048576 kB
SwapCached:            0 kB
HugePages_Total:       0
"#;

    #[test]
    fn test_is_memory_close() {
        assert!(is_memory_close(100.0, 100.5, 1.0));
        assert!(!is_memory_close(100.0, 101.0, 1.0));
        assert!(is_memory_close(100.0, 104.0, 5.0));
        assert!(!is_memory_close(f64::NAN, 100.0, 1.0));
        assert!(!is_memory_close(f64::INFINITY, f64::INFINITY, 1.0));
    }

    #[test]
    fn test_parse_meminfo() {
        let fields = parse_meminfo(MOCK_MEMINFO);
        assert_eq!(fields["memtotal"], 8388608);
        assert_eq!(fields["hugepages_total"], 0);

        let stats = MemoryStats::from_meminfo(&fields).unwrap();
        assert_eq!(stats.available, 8192.0);
        assert_eq!(stats.unused, 2048.0);
        assert_eq!(stats.cache_and_buff, 1536.0);
        assert_eq!(stats.free, 3584.0);
        assert_eq!(stats.used, 6144.0);
    }

    #[test]
    fn test_meminfo_missing_field() {
        let fields = parse_meminfo("MemTotal: 1024 kB\n");
        assert!(MemoryStats::from_meminfo(&fields).is_err());
    }

    #[test]
    fn test_parse_vmstat() {
        let stat = VmStat::parse("pswpin 10\npswpout 20\npgfault 300\npgmajfault 4\nnr_free 9\n");
        assert_eq!(stat.swap_in, 10);
        assert_eq!(stat.swap_out, 20);
        assert_eq!(stat.minor_fault, 300);
        assert_eq!(stat.major_fault, 4);
        assert_eq!(stat.page_in, 0);
    }

    #[tokio::test]
    async fn test_read_meminfo_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meminfo");
        tokio::fs::write(&path, MOCK_MEMINFO).await.unwrap();

        let fields = read_meminfo(&path).await.unwrap();
        assert_eq!(fields["buffers"], 524288);
    }

    #[tokio::test]
    async fn test_load_summarizes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meminfo");
        tokio::fs::write(&path, MOCK_MEMINFO).await.unwrap();

        let stats = MemoryStats::load(&path).await.unwrap();
        assert_eq!(stats.available, 8192.0);
        assert_eq!(stats.cache_and_buff, 1536.0);

        assert!(MemoryStats::load(&dir.path().join("missing")).await.is_err());
    }
}
