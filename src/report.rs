use crate::config::EnergyConfig;
use crate::energy_monitor::{CpuInfo, EnergyReading, MetricValue, TaskContext};
use crate::observer::{EnergySubject, EventKind};
use crate::utils::errors::MonitoringError;
use crate::utils::psutils::now_timestamp;
use log::{error, info, warn};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::{Path, PathBuf};

/// Percent utilisation above which a CPU counts as active.
const ACTIVE_CPU_THRESHOLD: f64 = 5.0;
const MIN_DURATION: f64 = 0.001;
const MIN_CPU_PERCENT: f64 = 0.01;

/// Writes per-execution JSON artifacts and rolling per-strategy summaries.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    primary: PathBuf,
    fallback: PathBuf,
}

impl ReportWriter {
    pub fn new(config: &EnergyConfig, task: &TaskContext) -> Self {
        let primary = task
            .output_dir
            .clone()
            .or_else(|| config.output_dir.clone())
            .unwrap_or_else(|| {
                std::env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join("energy_data")
            });
        let fallback = config
            .fallback_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("worker_energy_data"));
        Self::with_dirs(primary, fallback)
    }

    pub fn with_dirs(primary: PathBuf, fallback: PathBuf) -> Self {
        Self { primary, fallback }
    }

    fn dirs(&self) -> [&Path; 2] {
        [&self.primary, &self.fallback]
    }

    /// Writes `{execution_id}_{strategy}.json` and appends to `{strategy}_summary.json`,
    /// falling back to the secondary directory. Returns the artifact path, or `None`
    /// when neither directory is writable.
    pub fn persist(
        &self,
        strategy: &str,
        reading: &EnergyReading,
        task: &TaskContext,
        cpu_info: &CpuInfo,
        function_name: Option<&str>,
    ) -> Option<PathBuf> {
        let document = build_execution_document(reading, task, cpu_info, function_name);
        let entry = summary_entry(&document);

        for dir in self.dirs() {
            match write_artifacts(dir, strategy, &task.execution_id(), &document, entry.clone()) {
                Ok(path) => {
                    info!("Energy data for {} written to {}", strategy, path.display());
                    return Some(path);
                }
                Err(e) => warn!("Could not write {} energy data to {}: {}", strategy, dir.display(), e),
            }
        }
        error!("Energy data for {} was not persisted", task.execution_id());
        None
    }

    /// Rewrites `function_name` in the artifacts of one execution. Returns the number of files changed.
    pub fn update_function_name(
        &self,
        strategy: &str,
        task: &TaskContext,
        function_name: &str,
    ) -> Result<usize, MonitoringError> {
        let execution_id = task.execution_id();
        let mut updated = 0;

        for dir in self.dirs() {
            let artifact = dir.join(format!("{}_{}.json", execution_id, strategy));
            if artifact.exists() {
                let mut document: Value = serde_json::from_str(&fs::read_to_string(&artifact)?)?;
                if let Some(object) = document.as_object_mut() {
                    object.insert("function_name".to_string(), json!(function_name));
                    fs::write(&artifact, serde_json::to_string_pretty(&document)?)?;
                    updated += 1;
                }
            }

            let summary_path = summary_path(dir, strategy);
            if summary_path.exists() {
                let mut entries = read_summary(&summary_path);
                let mut touched = false;
                for entry in entries.iter_mut().filter(|e| e["execution_id"] == execution_id.as_str()) {
                    if let Some(object) = entry.as_object_mut() {
                        object.insert("function_name".to_string(), json!(function_name));
                        touched = true;
                    }
                }
                if touched {
                    fs::write(&summary_path, serde_json::to_string_pretty(&entries)?)?;
                    updated += 1;
                }
            }
        }

        Ok(updated)
    }
}

pub fn summary_path(dir: &Path, strategy: &str) -> PathBuf {
    dir.join(format!("{}_summary.json", strategy))
}

fn write_artifacts(
    dir: &Path,
    strategy: &str,
    execution_id: &str,
    document: &Value,
    entry: Value,
) -> Result<PathBuf, MonitoringError> {
    fs::create_dir_all(dir).map_err(|e| {
        MonitoringError::Persistence(format!("cannot create {}: {}", dir.display(), e))
    })?;

    let artifact = dir.join(format!("{}_{}.json", execution_id, strategy));
    fs::write(&artifact, serde_json::to_string_pretty(document)?).map_err(|e| {
        MonitoringError::Persistence(format!("cannot write {}: {}", artifact.display(), e))
    })?;

    let summary = summary_path(dir, strategy);
    let mut entries = read_summary(&summary);
    entries.push(entry);
    fs::write(&summary, serde_json::to_string_pretty(&entries)?).map_err(|e| {
        MonitoringError::Persistence(format!("cannot write {}: {}", summary.display(), e))
    })?;

    Ok(artifact)
}

/// Reads a summary array. Missing or corrupt files yield an empty array.
fn read_summary(path: &Path) -> Vec<Value> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<Value>>(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Discarding corrupt summary {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// The per-execution artifact: identifiers, the reading, derived efficiency
/// figures, per-CPU usage and every strategy specific sub-map.
pub fn build_execution_document(
    reading: &EnergyReading,
    task: &TaskContext,
    cpu_info: &CpuInfo,
    function_name: Option<&str>,
) -> Value {
    let mut document = Map::new();
    document.insert("execution_id".into(), json!(task.execution_id()));
    document.insert("job_key".into(), json!(task.job_key));
    document.insert("call_id".into(), json!(task.call_id));
    document.insert("timestamp".into(), json!(now_timestamp()));
    document.insert("recorded_at".into(), json!(chrono::Utc::now().to_rfc3339()));
    document.insert("function_name".into(), json!(function_name.unwrap_or("unknown")));
    document.insert("duration".into(), json!(reading.duration));
    document.insert("source".into(), json!(reading.source));
    document.insert("synthetic".into(), json!(reading.synthetic));
    document.insert(
        "energy".into(),
        serde_json::to_value(&reading.energy).unwrap_or_else(|_| json!({})),
    );
    document.insert("efficiency".into(), efficiency_metrics(reading, cpu_info));
    document.insert("cpu_usage".into(), Value::Array(cpu_usage_entries(cpu_info)));
    for (key, value) in &reading.extra {
        document.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(document)
}

/// Energy-per-unit figures derived from a reading and the CPU utilisation of the window.
pub fn efficiency_metrics(reading: &EnergyReading, cpu_info: &CpuInfo) -> Value {
    let energy = reading.primary_energy().unwrap_or(0.0);
    let cpu_count = cpu_info.usage.len();
    let avg_cpu = if cpu_count > 0 {
        cpu_info.usage.iter().sum::<f64>() / cpu_count as f64
    } else {
        0.0
    };
    let max_cpu = cpu_info.usage.iter().copied().fold(0.0_f64, f64::max);
    let active = cpu_info
        .usage
        .iter()
        .filter(|&&usage| usage > ACTIVE_CPU_THRESHOLD)
        .count();

    let mut metrics = Map::new();
    metrics.insert("energy_efficiency".into(), json!(energy / reading.duration.max(MIN_DURATION)));
    metrics.insert("avg_cpu_usage".into(), json!(avg_cpu));
    metrics.insert("energy_per_cpu".into(), json!(energy / avg_cpu.max(MIN_CPU_PERCENT)));
    metrics.insert("cpu_count".into(), json!(cpu_count));
    metrics.insert("active_cpus".into(), json!(active));
    metrics.insert("max_cpu_usage".into(), json!(max_cpu));
    metrics.insert("system_time".into(), json!(cpu_info.system));
    metrics.insert("user_time".into(), json!(cpu_info.user));

    let instructions = reading
        .extra
        .get("cpu_perf_metrics")
        .and_then(|m| m.get("instructions"))
        .and_then(Value::as_f64)
        .filter(|&n| n > 0.0);
    if let Some(instructions) = instructions {
        metrics.insert("energy_per_instruction".into(), json!(energy / instructions));
    }
    Value::Object(metrics)
}

pub fn cpu_usage_entries(cpu_info: &CpuInfo) -> Vec<Value> {
    cpu_info
        .usage
        .iter()
        .enumerate()
        .map(|(cpu_id, percent)| {
            json!({
                "cpu_id": cpu_id,
                "cpu_percent": percent,
                "start_timestamp": cpu_info.start_timestamp,
                "end_timestamp": cpu_info.end_timestamps.get(cpu_id),
            })
        })
        .collect()
}

/// Compact summary row derived from a per-execution document.
pub fn summary_entry(document: &Value) -> Value {
    let mut entry = Map::new();
    for key in ["execution_id", "function_name", "timestamp", "source", "synthetic", "duration"] {
        entry.insert(key.into(), document.get(key).cloned().unwrap_or(Value::Null));
    }

    let energy: std::collections::BTreeMap<String, MetricValue> = document
        .get("energy")
        .cloned()
        .and_then(|e| serde_json::from_value(e).ok())
        .unwrap_or_default();
    for (metric, value) in energy {
        match value {
            MetricValue::Scalar(v) => {
                entry.insert(format!("energy_{}", metric), json!(v));
            }
            MetricValue::Stats(stats) => {
                entry.insert(format!("energy_{}_avg", metric), json!(stats.avg));
                entry.insert(format!("energy_{}_min", metric), json!(stats.min));
                entry.insert(format!("energy_{}_max", metric), json!(stats.max));
            }
        }
    }

    if let Some(efficiency) = document.get("efficiency") {
        for key in ["energy_efficiency", "avg_cpu_usage", "energy_per_cpu"] {
            if let Some(value) = efficiency.get(key) {
                entry.insert(key.into(), value.clone());
            }
        }
    }
    Value::Object(entry)
}

/// Persists a reading for `strategy` and publishes a `log` event.
#[allow(clippy::too_many_arguments)]
pub fn log_reading(
    subject: &EnergySubject,
    strategy: &str,
    process_id: u32,
    config: &EnergyConfig,
    reading: &EnergyReading,
    task: &TaskContext,
    cpu_info: &CpuInfo,
    function_name: Option<&str>,
) -> Option<PathBuf> {
    let path = ReportWriter::new(config, task).persist(strategy, reading, task, cpu_info, function_name);
    subject.notify(
        EventKind::Log,
        &json!({
            "monitor": strategy,
            "process_id": process_id,
            "execution_id": task.execution_id(),
            "function_name": function_name,
            "path": path.as_ref().map(|p| p.display().to_string()),
        }),
    );
    path
}
