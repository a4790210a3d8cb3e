use crate::energy_monitor::{
    CpuInfo, EnergyMonitor, EnergyReading, MeasurementWindow, MonitorState, TaskContext,
    frozen_or_empty,
};
use crate::observer::{EnergyObserver, EnergySubject, EventKind};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Writes an executable `sh` script standing in for an external tool.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Remembers every event with the reporting monitor's name.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<(EventKind, String)>>,
}

impl RecordingObserver {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|(kind, _)| *kind).collect()
    }

    pub fn from_monitor(&self, monitor: &str) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, name)| name == monitor)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

impl EnergyObserver for RecordingObserver {
    fn update(&self, event: EventKind, payload: &Value) -> Result<(), String> {
        let monitor = payload["monitor"].as_str().unwrap_or_default().to_string();
        self.events.lock().unwrap().push((event, monitor));
        Ok(())
    }
}

/// Scripted monitor for exercising the factory, composite and manager without hardware.
pub struct DummyMonitor {
    name: String,
    start_ok: bool,
    metrics: Vec<(String, f64)>,
    duration: Option<f64>,
    window: MeasurementWindow,
    subject: EnergySubject,
    reading: Option<EnergyReading>,
    /// Shared across instances so tests can count trial starts
    pub starts: Arc<AtomicUsize>,
    /// Names of the executions logged through this monitor
    pub logged: Arc<Mutex<Vec<String>>>,
}

impl DummyMonitor {
    pub fn new(name: &str, start_ok: bool) -> Self {
        Self {
            name: name.to_string(),
            start_ok,
            metrics: Vec::new(),
            duration: None,
            window: MeasurementWindow::default(),
            subject: EnergySubject::new(),
            reading: None,
            starts: Arc::new(AtomicUsize::new(0)),
            logged: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.push((name.to_string(), value));
        self
    }

    /// Reports this duration instead of the measured one.
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_counters(mut self, starts: Arc<AtomicUsize>, logged: Arc<Mutex<Vec<String>>>) -> Self {
        self.starts = starts;
        self.logged = logged;
        self
    }
}

#[async_trait]
impl EnergyMonitor for DummyMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MonitorState {
        self.window.state()
    }

    async fn start(&mut self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.start_ok || !self.window.open() {
            return false;
        }
        self.subject.notify(EventKind::Start, &json!({"monitor": self.name}));
        true
    }

    async fn stop(&mut self) {
        let Some(elapsed) = self.window.close() else {
            return;
        };
        let mut reading = EnergyReading::empty(&format!("dummy-{}", self.name));
        for (metric, value) in &self.metrics {
            reading = reading.with_metric(metric, *value);
        }
        reading.duration = self.duration.unwrap_or(elapsed);
        self.subject.notify(EventKind::Stop, &json!({"monitor": self.name}));
        self.subject.notify(EventKind::Data, &json!({"monitor": self.name, "energy_data": reading.to_json()}));
        self.reading = Some(reading);
    }

    fn get_energy_data(&self) -> EnergyReading {
        frozen_or_empty(&self.reading, &self.name, "dummy")
    }

    fn log_energy_data(
        &self,
        _reading: &EnergyReading,
        task: &TaskContext,
        _cpu_info: &CpuInfo,
        _function_name: Option<&str>,
    ) {
        if let Ok(mut logged) = self.logged.lock() {
            logged.push(task.execution_id());
        }
        self.subject.notify(EventKind::Log, &json!({"monitor": self.name}));
    }

    fn attach(&mut self, observer: Arc<dyn EnergyObserver>) {
        self.subject.attach(observer);
    }

    fn detach(&mut self, observer: &Arc<dyn EnergyObserver>) {
        self.subject.detach(observer);
    }
}
