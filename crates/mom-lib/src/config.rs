//! Host and guest daemon configuration
//!
//! Every option has a default, so an empty configuration is a working one.
//! Keys use the kebab-case section/option names of the configuration file
//! (`[policy] grace-period = 20`). Durations are given in seconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Convert a configured number of seconds into a duration; negative and
/// non-finite values become zero
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Host daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostConfig {
    #[serde(default)]
    pub main: MainConfig,
    #[serde(default)]
    pub guest_manager: GuestManagerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub host_monitor: HostMonitorConfig,
    #[serde(default)]
    pub guest_monitor: GuestMonitorConfig,
    #[serde(default)]
    pub guest_client: GuestClientConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub data_log: DataLogConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MainConfig {
    /// How often the daemon checks that its components are alive
    #[serde(default = "default_check_loop_interval")]
    pub check_loop_interval: f64,
}

fn default_check_loop_interval() -> f64 {
    10.0
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            check_loop_interval: default_check_loop_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestManagerConfig {
    /// Domain list polling interval
    #[serde(default = "default_guest_manager_interval")]
    pub interval: f64,

    /// Upper bound on concurrently tracked guests
    #[serde(default = "default_max_guests")]
    pub max_guests: usize,
}

fn default_guest_manager_interval() -> f64 {
    5.0
}

fn default_max_guests() -> usize {
    64
}

impl Default for GuestManagerConfig {
    fn default() -> Self {
        Self {
            interval: default_guest_manager_interval(),
            max_guests: default_max_guests(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonitorConfig {
    /// Number of merged samples kept per monitor
    #[serde(default = "default_sample_history_length")]
    pub sample_history_length: usize,
}

fn default_sample_history_length() -> usize {
    10
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_history_length: default_sample_history_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostMonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval: f64,

    #[serde(default = "default_host_collectors")]
    pub collectors: Vec<String>,

    /// Command-line patterns of the processes `ApplicationsStats` reports
    #[serde(default)]
    pub applications: Vec<String>,
}

fn default_monitor_interval() -> f64 {
    10.0
}

fn default_host_collectors() -> Vec<String> {
    vec!["MemoryStatistics".to_string()]
}

impl Default for HostMonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            collectors: default_host_collectors(),
            applications: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestMonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval: f64,

    /// Retry interval while waiting for the guest server to come up
    #[serde(default = "default_check_readiness_interval")]
    pub check_readiness_interval: f64,

    #[serde(default = "default_guest_collectors")]
    pub collectors: Vec<String>,
}

fn default_check_readiness_interval() -> f64 {
    5.0
}

fn default_guest_collectors() -> Vec<String> {
    vec!["GuestStats".to_string(), "GuestHypervisor".to_string()]
}

impl Default for GuestMonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            check_readiness_interval: default_check_readiness_interval(),
            collectors: default_guest_collectors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestClientConfig {
    #[serde(default = "default_guest_port")]
    pub port: u16,

    /// Default per-call timeout
    #[serde(default = "default_guest_client_timeout")]
    pub timeout: f64,
}

fn default_guest_port() -> u16 {
    2187
}

fn default_guest_client_timeout() -> f64 {
    10.0
}

impl Default for GuestClientConfig {
    fn default() -> Self {
        Self {
            port: default_guest_port(),
            timeout: default_guest_client_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyConfig {
    /// Control cycle length (at least one second is enforced)
    #[serde(default = "default_policy_interval")]
    pub interval: f64,

    #[serde(default = "default_inquiry_timeout")]
    pub inquiry_timeout: f64,

    #[serde(default = "default_grace_period")]
    pub grace_period: f64,

    #[serde(default = "default_resources")]
    pub resources: Vec<String>,

    #[serde(default = "default_allocator")]
    pub allocator: String,

    /// Resource → controller name
    #[serde(default = "default_controllers")]
    pub controllers: BTreeMap<String, String>,

    /// Bound on concurrent inquiry/notify calls per fan-out
    #[serde(default = "default_max_parallel_rpcs")]
    pub max_parallel_rpcs: usize,
}

fn default_policy_interval() -> f64 {
    30.0
}

fn default_inquiry_timeout() -> f64 {
    2.0
}

fn default_grace_period() -> f64 {
    20.0
}

fn default_resources() -> Vec<String> {
    vec!["memory".to_string()]
}

fn default_allocator() -> String {
    "InquiryAllocator".to_string()
}

fn default_controllers() -> BTreeMap<String, String> {
    BTreeMap::from([("memory".to_string(), "Balloon".to_string())])
}

fn default_max_parallel_rpcs() -> usize {
    16
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            interval: default_policy_interval(),
            inquiry_timeout: default_inquiry_timeout(),
            grace_period: default_grace_period(),
            resources: default_resources(),
            allocator: default_allocator(),
            controllers: default_controllers(),
            max_parallel_rpcs: default_max_parallel_rpcs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataLogConfig {
    /// JSON-lines output file; data logging is disabled when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiConfig {
    /// Health and metrics server port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HypervisorConfig {
    /// libvirt connection URI; the local default when unset
    #[serde(default)]
    pub uri: Option<String>,
}

/// Guest daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: GuestSideMonitorConfig,
    #[serde(default)]
    pub policy: GuestPolicyConfig,
    #[serde(default)]
    pub resource_control: ResourceControlConfig,
    #[serde(default)]
    pub data_log: DataLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_guest_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_guest_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestSideMonitorConfig {
    #[serde(default = "default_sample_history_length")]
    pub sample_history_length: usize,

    #[serde(default = "default_host_collectors")]
    pub collectors: Vec<String>,

    #[serde(default)]
    pub applications: Vec<String>,
}

impl Default for GuestSideMonitorConfig {
    fn default() -> Self {
        Self {
            sample_history_length: default_sample_history_length(),
            collectors: default_host_collectors(),
            applications: Vec::new(),
        }
    }
}

/// Desired allocation for one resource as a function of time since the
/// first inquiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseScript {
    /// Always answer the same value
    Constant(f64),
    /// Answer the value of the latest step whose `at` has passed
    Schedule(Vec<ResponseStep>),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponseStep {
    /// Seconds since the first inquiry
    pub at: f64,
    pub value: f64,
}

impl ResponseScript {
    pub fn evaluate(&self, elapsed: f64) -> f64 {
        match self {
            ResponseScript::Constant(value) => *value,
            ResponseScript::Schedule(steps) => steps
                .iter()
                .take_while(|step| step.at <= elapsed)
                .last()
                .or_else(|| steps.first())
                .map(|step| step.value)
                .unwrap_or(f64::NAN),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestPolicyConfig {
    /// Resource → response script answered to inquiries
    #[serde(default)]
    pub responses: BTreeMap<String, ResponseScript>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceControlConfig {
    /// Run the resource control loop inside the guest daemon
    #[serde(default)]
    pub enabled: bool,

    /// Longest wait for a new notification (at least one second)
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: f64,

    /// Lead time kept before a shrink deadline
    #[serde(default = "default_decrease_mem_time")]
    pub decrease_mem_time: f64,

    /// Memory sizes closer than this are treated as equal (MB)
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// How long a grow waits for the new memory to show up
    #[serde(default = "default_stats_poll_timeout")]
    pub stats_poll_timeout: f64,
}

fn default_wait_timeout() -> f64 {
    60.0
}

fn default_decrease_mem_time() -> f64 {
    1.0
}

fn default_epsilon() -> f64 {
    crate::memory::DEFAULT_MEMORY_EPSILON
}

fn default_stats_poll_timeout() -> f64 {
    0.5
}

impl Default for ResourceControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_timeout: default_wait_timeout(),
            decrease_mem_time: default_decrease_mem_time(),
            epsilon: default_epsilon(),
            stats_poll_timeout: default_stats_poll_timeout(),
        }
    }
}
