use crate::config::EnergyConfig;
use crate::energy_monitor::{CpuInfo, EnergyMonitor, EnergyReading, MetricValue, MonitorContext, TaskContext};
use crate::factory::{MonitorFactory, StrategyRegistry};
use crate::observer::EnergyObserver;
use crate::report::ReportWriter;
use crate::utils::errors::MonitoringError;
use crate::utils::psutils::now_timestamp;
use log::{info, warn};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Reads `function_name <value>` from a worker stats file.
pub fn read_function_name_from_stats(path: &Path) -> Option<String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("Stats file {} not readable: {}", path.display(), e);
            return None;
        }
    };
    contents.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(' ')?;
        (key == "function_name" && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}

/// Flattens a reading into the `worker_func_*` entries reported with the call status.
pub fn call_status_entries(reading: &EnergyReading) -> BTreeMap<String, Value> {
    let mut entries = BTreeMap::new();
    entries.insert("worker_func_energy_duration".to_string(), json!(reading.duration));
    entries.insert("worker_func_energy_source".to_string(), json!(reading.source));
    entries.insert("worker_func_energy_synthetic".to_string(), json!(reading.synthetic));

    for (metric, value) in &reading.energy {
        entries.insert(format!("worker_func_energy_{}", metric), json!(value.value()));
        if let MetricValue::Stats(stats) = value {
            entries.insert(format!("worker_func_energy_{}_min", metric), json!(stats.min));
            entries.insert(format!("worker_func_energy_{}_max", metric), json!(stats.max));
        }
    }
    if let Some(pkg) = reading.metric("pkg") {
        entries.insert("worker_func_perf_energy_pkg".to_string(), json!(pkg));
    }
    if let Some(cores) = reading.metric("cores") {
        entries.insert("worker_func_perf_energy_cores".to_string(), json!(cores));
    }
    if let Some(Value::Object(monitors)) = reading.extra.get("monitors") {
        for (name, data) in monitors {
            entries.insert(format!("worker_func_energy_monitor_{}", name), data.clone());
        }
    }
    entries
}

/// Entry point for the execution pipeline: one manager per task execution.
pub struct EnergyManager {
    process_id: u32,
    config: Arc<EnergyConfig>,
    monitor: Box<dyn EnergyMonitor>,
    function_name: Option<String>,
    start_timestamp: Option<f64>,
}

impl EnergyManager {
    /// Builds a monitor for `config.energy_strategy` from the built-in strategies.
    pub async fn new(process_id: u32, config: EnergyConfig) -> Self {
        Self::with_factory(process_id, config, MonitorFactory::new(StrategyRegistry::with_defaults())).await
    }

    pub async fn with_factory(process_id: u32, config: EnergyConfig, factory: MonitorFactory) -> Self {
        let context = MonitorContext::new(process_id, config);
        let monitor = factory
            .create_monitor(&context.config.energy_strategy, &context)
            .await;
        info!("Energy manager for process {} uses the '{}' monitor", process_id, monitor.name());
        Self {
            process_id,
            config: context.config,
            monitor,
            function_name: None,
            start_timestamp: None,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn monitor(&self) -> &dyn EnergyMonitor {
        self.monitor.as_ref()
    }

    /// Wall-clock time at which `start` was called.
    pub fn start_timestamp(&self) -> Option<f64> {
        self.start_timestamp
    }

    pub fn attach(&mut self, observer: Arc<dyn EnergyObserver>) {
        self.monitor.attach(observer);
    }

    pub async fn start(&mut self) -> bool {
        self.start_timestamp = Some(now_timestamp());
        self.monitor.start().await
    }

    pub async fn stop(&mut self) {
        self.monitor.stop().await;
    }

    pub fn get_energy_data(&self) -> EnergyReading {
        self.monitor.get_energy_data()
    }

    /// Persists the reading of the closed window and returns the call-status entries.
    pub fn process_energy_data(&mut self, task: &TaskContext, cpu_info: &CpuInfo) -> BTreeMap<String, Value> {
        if self.function_name.is_none() {
            self.function_name = task.stats_file.as_deref().and_then(read_function_name_from_stats);
        }
        let reading = self.get_energy_data();
        let entries = call_status_entries(&reading);
        self.monitor
            .log_energy_data(&reading, task, cpu_info, self.function_name.as_deref());
        entries
    }

    /// Re-reads the stats file and patches the persisted artifacts with the function name.
    /// Returns the number of files changed.
    pub fn update_function_name(&mut self, task: &TaskContext) -> Result<usize, MonitoringError> {
        let Some(function_name) = task.stats_file.as_deref().and_then(read_function_name_from_stats) else {
            warn!("No function name available for {}", task.execution_id());
            return Ok(0);
        };
        info!("Updating function name of {} to {}", task.execution_id(), function_name);

        let writer = ReportWriter::new(&self.config, task);
        let mut updated = 0;
        for strategy in self.monitor.artifact_names() {
            updated += writer.update_function_name(&strategy, task, &function_name)?;
        }
        self.function_name = Some(function_name);
        Ok(updated)
    }
}
