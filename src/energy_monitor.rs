use crate::config::EnergyConfig;
use crate::observer::EnergyObserver;
use crate::utils::psutils;
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Source tags carried by readings.
pub mod source {
    pub const PERF_COUNTER: &str = "perf-counter";
    pub const KERNEL_PROBE: &str = "kernel-probe";
    pub const OUT_OF_BAND: &str = "out-of-band";
    pub const COMPOSITE: &str = "composite";
    pub const DISABLED: &str = "disabled";
    /// The strategy ran but measured nothing
    pub const NONE: &str = "none";
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// A single energy metric: a scalar from one strategy, or statistics across several.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Stats(MetricStats),
}

impl MetricValue {
    /// The scalar value, or the average for statistics.
    pub fn value(&self) -> f64 {
        match self {
            MetricValue::Scalar(v) => *v,
            MetricValue::Stats(stats) => stats.avg,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Stats(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Scalar(value)
    }
}

/// The output of every monitor for one measurement window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyReading {
    #[serde(default)]
    pub energy: BTreeMap<String, MetricValue>,
    pub duration: f64,
    pub source: String,
    /// Set when the values were generated because the substrate was unavailable
    #[serde(default)]
    pub synthetic: bool,
    /// Strategy specific sub-maps, carried opaquely
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl EnergyReading {
    pub fn empty(source: &str) -> Self {
        Self {
            energy: BTreeMap::new(),
            duration: 0.0,
            source: source.to_string(),
            synthetic: false,
            extra: BTreeMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::empty(source::DISABLED)
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.energy.insert(name.to_string(), MetricValue::Scalar(value));
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.energy.get(name).map(MetricValue::value)
    }

    /// Package energy when present, otherwise whole-system energy.
    pub fn primary_energy(&self) -> Option<f64> {
        self.metric("pkg").or_else(|| self.metric("system"))
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Identifiers and paths of the task whose execution is being measured.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub job_key: String,
    pub call_id: String,
    /// Overrides the configured report directory
    pub output_dir: Option<PathBuf>,
    /// Worker stats file holding `function_name <value>` lines
    pub stats_file: Option<PathBuf>,
}

impl TaskContext {
    pub fn new(job_key: &str, call_id: &str) -> Self {
        Self {
            job_key: job_key.to_string(),
            call_id: call_id.to_string(),
            ..Self::default()
        }
    }

    pub fn execution_id(&self) -> String {
        format!("{}_{}", self.job_key, self.call_id)
    }
}

/// CPU utilisation gathered alongside the workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Per-CPU utilisation in percent
    pub usage: Vec<f64>,
    pub system: f64,
    pub user: f64,
    pub start_timestamp: Option<f64>,
    pub end_timestamps: Vec<f64>,
}

impl CpuInfo {
    /// Samples per-CPU utilisation and this process' CPU times now.
    pub async fn collect(start_timestamp: Option<f64>) -> Self {
        let usage = psutils::sample_cpu_usage().await;
        let (user, system) = psutils::process_times();
        let end = psutils::now_timestamp();
        Self {
            end_timestamps: vec![end; usage.len()],
            usage,
            system,
            user,
            start_timestamp,
        }
    }
}

/// Everything a strategy constructor needs.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    /// Process whose execution is being measured
    pub process_id: u32,
    pub config: Arc<EnergyConfig>,
}

impl MonitorContext {
    pub fn new(process_id: u32, config: EnergyConfig) -> Self {
        Self {
            process_id,
            config: Arc::new(config),
        }
    }
}

/// Tracks the single start/stop window of a monitor.
#[derive(Debug, Default)]
pub struct MeasurementWindow {
    state: MonitorState,
    started: Option<Instant>,
    start_timestamp: f64,
    end_timestamp: f64,
    duration: f64,
}

impl MeasurementWindow {
    /// Moves `Idle -> Running`. Returns false if the window was already used.
    pub fn open(&mut self) -> bool {
        if self.state != MonitorState::Idle {
            return false;
        }
        self.state = MonitorState::Running;
        self.started = Some(Instant::now());
        self.start_timestamp = psutils::now_timestamp();
        true
    }

    /// Moves `Running -> Stopped` and returns the elapsed seconds.
    /// Returns `None` if the window was not running.
    pub fn close(&mut self) -> Option<f64> {
        if self.state != MonitorState::Running {
            return None;
        }
        self.state = MonitorState::Stopped;
        self.duration = self
            .started
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.end_timestamp = psutils::now_timestamp();
        Some(self.duration)
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn start_timestamp(&self) -> f64 {
        self.start_timestamp
    }

    pub fn end_timestamp(&self) -> f64 {
        self.end_timestamp
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }
}

/// Returns the frozen reading, or an empty one tagged with `source` if the window has not closed.
pub fn frozen_or_empty(reading: &Option<EnergyReading>, name: &str, source: &str) -> EnergyReading {
    match reading {
        Some(reading) => reading.clone(),
        None => {
            warn!("{} monitor: energy data requested before stop()", name);
            EnergyReading::empty(source)
        }
    }
}

/// Capability contract shared by every measurement strategy.
#[async_trait]
pub trait EnergyMonitor: Send + Sync {
    /// Registry name, also used for artifact file names
    fn name(&self) -> &str;

    fn state(&self) -> MonitorState;

    /// Opens the measurement window. Returns false only when no reading can be offered at all.
    async fn start(&mut self) -> bool;

    /// Closes the window. Bounded by the configured stop timeout.
    async fn stop(&mut self);

    /// The reading of the closed window. Repeated calls return the same reading.
    fn get_energy_data(&self) -> EnergyReading;

    /// Persists `reading` and notifies listeners.
    fn log_energy_data(
        &self,
        reading: &EnergyReading,
        task: &TaskContext,
        cpu_info: &CpuInfo,
        function_name: Option<&str>,
    );

    fn attach(&mut self, observer: Arc<dyn EnergyObserver>);

    fn detach(&mut self, observer: &Arc<dyn EnergyObserver>);

    /// Strategy names under which this monitor writes artifacts.
    fn artifact_names(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }
}
