use crate::config::PerfOptions;
use crate::energy_monitor::{
    CpuInfo, EnergyMonitor, EnergyReading, MeasurementWindow, MonitorContext, MonitorState,
    TaskContext, frozen_or_empty, source,
};
use crate::observer::{EnergyObserver, EnergySubject, EventKind};
use crate::report;
use crate::utils::psutils::{command_exists, interrupt_and_wait, process_cpu_fraction};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};

pub const DEFAULT_EVENTS: &str = "power/energy-pkg/,power/energy-cores/";

/// Short CPU-bound loop measured when the window itself produced no counter values.
const BURST_SCRIPT: &str = r#"i=0; while [ "$i" -lt 200000 ]; do i=$((i+1)); done"#;

/// Parses a counter value, tolerating `,` decimal separators and thousands
/// separators: with more than one separator only the last one is the decimal point.
pub fn normalize_decimal(raw: &str) -> Option<f64> {
    let replaced = raw.trim().replace(',', ".");
    let parts: Vec<&str> = replaced.split('.').collect();
    let normalized = if parts.len() > 2 {
        let (last, head) = parts.split_last()?;
        format!("{}.{}", head.concat(), last)
    } else {
        replaced
    };
    normalized.parse().ok()
}

/// Extracts `event -> joules` from a `perf stat` report.
pub fn parse_perf_output(text: &str) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    for line in text.lines().filter(|l| l.contains("Joules")) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(idx) = tokens.iter().position(|t| *t == "Joules") else {
            continue;
        };
        let (Some(raw), Some(event)) = (idx.checked_sub(1).map(|i| tokens[i]), tokens.get(idx + 1))
        else {
            continue;
        };
        match normalize_decimal(raw) {
            Some(value) => {
                values.insert(event.to_string(), value);
            }
            None => debug!("Unparseable perf value '{}' for {}", raw, event),
        }
    }
    values
}

/// Picks the package and core energy events from `perf list` output.
pub fn select_energy_events(list_output: &str) -> String {
    let candidates: Vec<&str> = list_output
        .lines()
        .filter(|line| line.contains("energy"))
        .flat_map(str::split_whitespace)
        .filter(|token| token.ends_with('/') && token.matches('/').count() == 2)
        .collect();

    let selected: Vec<&str> = ["energy-pkg", "energy-cores"]
        .iter()
        .filter_map(|kind| candidates.iter().find(|c| c.contains(kind)).copied())
        .collect();

    if selected.is_empty() {
        DEFAULT_EVENTS.to_string()
    } else {
        selected.join(",")
    }
}

/// Maps `power/energy-pkg/` to `pkg`, `power/energy-cores/` to `cores` and so on.
fn metric_key(event: &str) -> String {
    let inner = event.trim_matches('/').rsplit('/').next().unwrap_or(event);
    inner.trim_start_matches("energy-").to_string()
}

/// Builds the reading from parsed counter values.
pub fn reading_from_counters(values: &BTreeMap<String, f64>, duration: f64) -> EnergyReading {
    let by_key: BTreeMap<String, f64> = values.iter().map(|(e, v)| (metric_key(e), *v)).collect();
    let pkg = by_key.get("pkg").copied().unwrap_or(0.0);
    let cores = by_key.get("cores").copied().unwrap_or(0.0);
    let core_percentage = if pkg > 0.0 { cores / pkg } else { 0.0 };
    let tag = if pkg == 0.0 && cores == 0.0 { source::NONE } else { source::PERF_COUNTER };

    let mut reading = EnergyReading::empty(tag)
        .with_metric("pkg", pkg)
        .with_metric("cores", cores)
        .with_metric("core_percentage", core_percentage);
    for (key, value) in by_key.iter().filter(|(k, _)| !matches!(k.as_str(), "pkg" | "cores")) {
        reading = reading.with_metric(key, *value);
    }
    reading.duration = duration;
    reading.extra.insert("perf_events".to_string(), json!(values));
    reading
}

/// System-wide energy counters sampled through `perf stat`.
pub struct PerfMonitor {
    process_id: u32,
    context: MonitorContext,
    options: PerfOptions,
    window: MeasurementWindow,
    subject: EnergySubject,
    events: String,
    output_file: Option<PathBuf>,
    child: Option<Child>,
    reading: Option<EnergyReading>,
}

impl PerfMonitor {
    pub fn new(context: &MonitorContext) -> Self {
        Self {
            process_id: context.process_id,
            options: context.config.perf.clone(),
            context: context.clone(),
            window: MeasurementWindow::default(),
            subject: EnergySubject::new(),
            events: String::new(),
            output_file: None,
            child: None,
            reading: None,
        }
    }

    fn command(&self) -> Command {
        let mut command = if self.options.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(&self.options.perf_path);
            c
        } else {
            Command::new(&self.options.perf_path)
        };
        command.kill_on_drop(true);
        command
    }

    async fn discover_events(&self) -> String {
        if let Some(events) = &self.options.events {
            return events.clone();
        }
        match Command::new(&self.options.perf_path).arg("list").output().await {
            Ok(output) => select_energy_events(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                warn!("perf list failed, using default events: {}", e);
                DEFAULT_EVENTS.to_string()
            }
        }
    }

    /// Measures a short CPU burst directly; `perf stat` reports on stderr.
    async fn fallback_probe(&self) -> BTreeMap<String, f64> {
        let mut command = self.command();
        command
            .args(["stat", "-e", self.events.as_str(), "-a", "--", "sh", "-c", BURST_SCRIPT])
            .stdin(Stdio::null());
        match tokio::time::timeout(self.context.config.stop_timeout(), command.output()).await {
            Ok(Ok(output)) => parse_perf_output(&String::from_utf8_lossy(&output.stderr)),
            Ok(Err(e)) => {
                warn!("perf fallback probe failed to run: {}", e);
                BTreeMap::new()
            }
            Err(_) => {
                warn!("perf fallback probe timed out");
                BTreeMap::new()
            }
        }
    }

    async fn collect_counters(&mut self) -> (BTreeMap<String, f64>, bool) {
        let mut values = BTreeMap::new();
        if let Some(path) = self.output_file.take() {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    debug!("perf output:\n{}", text);
                    values = parse_perf_output(&text);
                }
                Err(e) => warn!("Could not read perf output {}: {}", path.display(), e),
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!("Could not remove {}: {}", path.display(), e);
            }
        }
        if values.is_empty() && !self.events.is_empty() {
            warn!("No energy counters in perf output, running fallback probe");
            return (self.fallback_probe().await, true);
        }
        (values, false)
    }
}

#[async_trait]
impl EnergyMonitor for PerfMonitor {
    fn name(&self) -> &str {
        "perf"
    }

    fn state(&self) -> MonitorState {
        self.window.state()
    }

    async fn start(&mut self) -> bool {
        if self.window.state() != MonitorState::Idle {
            warn!("perf monitor already used");
            return false;
        }
        if !command_exists(&self.options.perf_path) {
            warn!("perf is not installed, performance counter monitoring unavailable");
            return false;
        }

        self.events = self.discover_events().await;
        let output_file = std::env::temp_dir().join(format!(
            "perf_energy_{}_{}.txt",
            self.process_id,
            chrono::Utc::now().timestamp_millis()
        ));

        let mut command = self.command();
        command
            .args(["stat", "-e", self.events.as_str(), "-a", "-o"])
            .arg(&output_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match command.spawn() {
            Ok(child) => self.child = Some(child),
            Err(e) => {
                warn!("Failed to start perf: {}", e);
                return false;
            }
        }

        self.output_file = Some(output_file);
        self.window.open();
        info!("perf monitoring started for process {} with events {}", self.process_id, self.events);
        self.subject.notify(
            EventKind::Start,
            &json!({
                "monitor": "perf",
                "process_id": self.process_id,
                "start_time": self.window.start_timestamp(),
                "events": self.events,
            }),
        );
        true
    }

    async fn stop(&mut self) {
        let Some(duration) = self.window.close() else {
            return;
        };

        // Counting must end with the window; CPU sampling takes a while.
        if let Some(mut child) = self.child.take() {
            interrupt_and_wait(&mut child, self.context.config.stop_timeout(), "perf").await;
        }
        let cpu_percent = process_cpu_fraction(self.process_id).await;

        let (values, fallback) = self.collect_counters().await;
        let mut reading = reading_from_counters(&values, duration);
        reading.extra.insert("cpu_percent".to_string(), json!(cpu_percent.unwrap_or(0.0)));
        reading.extra.insert("fallback_probe".to_string(), json!(fallback));
        reading.extra.insert(
            "events".to_string(),
            json!(self.events.split(',').collect::<Vec<_>>()),
        );
        info!("perf monitoring stopped after {:.3}s, source {}", duration, reading.source);

        self.subject.notify(
            EventKind::Stop,
            &json!({
                "monitor": "perf",
                "process_id": self.process_id,
                "end_time": self.window.end_timestamp(),
                "duration": duration,
            }),
        );
        self.subject.notify(
            EventKind::Data,
            &json!({"monitor": "perf", "process_id": self.process_id, "energy_data": reading.to_json()}),
        );
        self.reading = Some(reading);
    }

    fn get_energy_data(&self) -> EnergyReading {
        frozen_or_empty(&self.reading, "perf", source::PERF_COUNTER)
    }

    fn log_energy_data(
        &self,
        reading: &EnergyReading,
        task: &TaskContext,
        cpu_info: &CpuInfo,
        function_name: Option<&str>,
    ) {
        report::log_reading(
            &self.subject,
            "perf",
            self.process_id,
            &self.context.config,
            reading,
            task,
            cpu_info,
            function_name,
        );
    }

    fn attach(&mut self, observer: Arc<dyn EnergyObserver>) {
        self.subject.attach(observer);
    }

    fn detach(&mut self, observer: &Arc<dyn EnergyObserver>) {
        self.subject.detach(observer);
    }
}
