use crate::utils::errors::MonitoringError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_ENABLED: &str = "WORKER_ENERGY_ENABLED";
pub const ENV_STRATEGY: &str = "WORKER_ENERGY_STRATEGY";

/// Which strategies the factory should try.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RawStrategy", into = "RawStrategy")]
pub enum StrategyRequest {
    /// Fixed preference order: kernel probe, out-of-band, performance counter
    #[default]
    Auto,
    /// Every registered strategy except the null one
    All,
    Named(String),
    List(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawStrategy {
    One(String),
    Many(Vec<String>),
}

impl From<RawStrategy> for StrategyRequest {
    fn from(raw: RawStrategy) -> Self {
        match raw {
            RawStrategy::One(name) => StrategyRequest::parse(&name),
            RawStrategy::Many(names) => StrategyRequest::List(names),
        }
    }
}

impl From<StrategyRequest> for RawStrategy {
    fn from(request: StrategyRequest) -> Self {
        match request {
            StrategyRequest::Auto => RawStrategy::One("auto".to_string()),
            StrategyRequest::All => RawStrategy::One("all".to_string()),
            StrategyRequest::Named(name) => RawStrategy::One(name),
            StrategyRequest::List(names) => RawStrategy::Many(names),
        }
    }
}

impl StrategyRequest {
    /// Parses `auto`, `all`, a single name, or a comma separated list of names.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "auto" => StrategyRequest::Auto,
            "all" => StrategyRequest::All,
            _ if value.contains(',') => StrategyRequest::List(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => StrategyRequest::Named(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfOptions {
    pub perf_path: String,
    /// Comma separated event list; discovered from `perf list` when unset
    pub events: Option<String>,
    pub use_sudo: bool,
}

impl Default for PerfOptions {
    fn default() -> Self {
        Self {
            perf_path: "perf".to_string(),
            events: None,
            use_sudo: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpmiOptions {
    pub ipmitool_path: String,
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub interface: String,
    pub use_sudo: bool,
    pub sampling_interval_secs: f64,
    /// Poll the sensor banks on every n-th power sample
    pub sensor_every: u32,
}

impl Default for IpmiOptions {
    fn default() -> Self {
        Self {
            ipmitool_path: "ipmitool".to_string(),
            host: "localhost".to_string(),
            username: None,
            password: None,
            interface: "lanplus".to_string(),
            use_sudo: true,
            sampling_interval_secs: 1.0,
            sensor_every: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeOptions {
    pub bpftrace_path: String,
    pub poll_interval_ms: u64,
    pub rapl_path: PathBuf,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            bpftrace_path: "bpftrace".to_string(),
            poll_interval_ms: 100,
            rapl_path: PathBuf::from("/sys/class/powercap/intel-rapl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub energy: bool,
    pub energy_strategy: StrategyRequest,
    pub output_dir: Option<PathBuf>,
    pub fallback_dir: Option<PathBuf>,
    pub stop_timeout_secs: f64,
    pub perf: PerfOptions,
    pub ipmi: IpmiOptions,
    pub ebpf: ProbeOptions,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            energy: true,
            energy_strategy: StrategyRequest::Auto,
            output_dir: None,
            fallback_dir: None,
            stop_timeout_secs: 5.0,
            perf: PerfOptions::default(),
            ipmi: IpmiOptions::default(),
            ebpf: ProbeOptions::default(),
        }
    }
}

impl EnergyConfig {
    /// Configuration with monitoring switched off.
    pub fn disabled() -> Self {
        Self {
            energy: false,
            ..Self::default()
        }
    }

    pub fn from_json_str(contents: &str) -> Result<Self, MonitoringError> {
        serde_json::from_str(contents)
            .map_err(|e| MonitoringError::Config(format!("Invalid energy configuration: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self, MonitoringError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MonitoringError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    /// Applies `WORKER_ENERGY_ENABLED` and `WORKER_ENERGY_STRATEGY` from the environment.
    pub fn with_env_overrides(self) -> Result<Self, MonitoringError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, MonitoringError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ENABLED) {
            self.energy = parse_flag(&value).ok_or_else(|| {
                MonitoringError::Config(format!("{} must be a boolean, got '{}'", ENV_ENABLED, value))
            })?;
        }
        if let Some(value) = lookup(ENV_STRATEGY) {
            if value.trim().is_empty() {
                return Err(MonitoringError::Config(format!("{} is empty", ENV_STRATEGY)));
            }
            self.energy_strategy = StrategyRequest::parse(&value);
        }
        Ok(self)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_secs.max(0.0))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
