use crate::config::EnergyConfig;
use crate::energy_monitor::{
    CpuInfo, EnergyMonitor, EnergyReading, MeasurementWindow, MetricStats, MetricValue,
    MonitorState, TaskContext, frozen_or_empty, source,
};
use crate::observer::{EnergyObserver, EnergySubject, EventKind};
use crate::report;
use async_trait::async_trait;
use itertools::Itertools;
use log::{info, warn};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cross-strategy statistics for every metric any strategy reported.
/// Duration is the longest contributing window.
pub fn aggregate_readings(readings: &[(String, EnergyReading)]) -> EnergyReading {
    let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (_, reading) in readings {
        for (metric, value) in &reading.energy {
            let entry = samples.entry(metric.clone()).or_default();
            let value = value.value();
            if value.is_finite() {
                entry.push(value);
            }
        }
    }

    let mut combined = EnergyReading::empty(source::COMPOSITE);
    for (metric, values) in samples {
        let stats = match values.iter().copied().minmax().into_option() {
            Some((min, max)) => MetricStats {
                avg: values.iter().sum::<f64>() / values.len() as f64,
                min,
                max,
            },
            None => MetricStats { avg: 0.0, min: 0.0, max: 0.0 },
        };
        combined.energy.insert(metric, MetricValue::Stats(stats));
    }

    combined.duration = readings
        .iter()
        .map(|(_, r)| r.duration)
        .fold(0.0_f64, f64::max);

    let synthetic: Vec<&str> = readings
        .iter()
        .filter(|(_, r)| r.synthetic)
        .map(|(name, _)| name.as_str())
        .collect();
    combined.synthetic = !synthetic.is_empty();
    combined.extra.insert("synthetic_monitors".to_string(), json!(synthetic));

    let monitors: Map<String, Value> = readings
        .iter()
        .map(|(name, reading)| (name.clone(), reading.to_json()))
        .collect();
    combined.extra.insert("monitors".to_string(), Value::Object(monitors));
    combined
}

/// Runs several strategies over the same window and merges their readings.
pub struct CompositeMonitor {
    process_id: u32,
    config: Arc<EnergyConfig>,
    monitors: Vec<Box<dyn EnergyMonitor>>,
    active: Vec<usize>,
    window: MeasurementWindow,
    subject: EnergySubject,
    reading: Option<EnergyReading>,
}

impl CompositeMonitor {
    pub fn new(process_id: u32, config: Arc<EnergyConfig>, monitors: Vec<Box<dyn EnergyMonitor>>) -> Self {
        Self {
            process_id,
            config,
            monitors,
            active: Vec::new(),
            window: MeasurementWindow::default(),
            subject: EnergySubject::new(),
            reading: None,
        }
    }

    pub fn active_names(&self) -> Vec<String> {
        self.active.iter().map(|&i| self.monitors[i].name().to_string()).collect()
    }

    fn active_monitors(&self) -> impl Iterator<Item = &Box<dyn EnergyMonitor>> {
        self.active.iter().map(|&i| &self.monitors[i])
    }
}

#[async_trait]
impl EnergyMonitor for CompositeMonitor {
    fn name(&self) -> &str {
        "composite"
    }

    fn state(&self) -> MonitorState {
        self.window.state()
    }

    async fn start(&mut self) -> bool {
        if self.window.state() != MonitorState::Idle {
            warn!("composite monitor already used");
            return false;
        }
        for (index, monitor) in self.monitors.iter_mut().enumerate() {
            if monitor.start().await {
                self.active.push(index);
            } else {
                warn!("{} monitor failed to start, leaving it out of the composite", monitor.name());
            }
        }
        if self.active.is_empty() {
            return false;
        }

        self.window.open();
        info!("Composite monitoring started with {:?}", self.active_names());
        self.subject.notify(
            EventKind::Start,
            &json!({
                "monitor": "composite",
                "process_id": self.process_id,
                "start_time": self.window.start_timestamp(),
                "monitors": self.active_names(),
            }),
        );
        true
    }

    async fn stop(&mut self) {
        let Some(duration) = self.window.close() else {
            return;
        };

        // Sequential: every stop is individually bounded by the stop timeout.
        for &index in &self.active {
            self.monitors[index].stop().await;
        }

        let readings: Vec<(String, EnergyReading)> = self
            .active_monitors()
            .map(|m| (m.name().to_string(), m.get_energy_data()))
            .collect();
        let reading = aggregate_readings(&readings);

        self.subject.notify(
            EventKind::Stop,
            &json!({
                "monitor": "composite",
                "process_id": self.process_id,
                "end_time": self.window.end_timestamp(),
                "duration": duration,
            }),
        );
        self.subject.notify(
            EventKind::Data,
            &json!({"monitor": "composite", "process_id": self.process_id, "energy_data": reading.to_json()}),
        );
        self.reading = Some(reading);
    }

    fn get_energy_data(&self) -> EnergyReading {
        frozen_or_empty(&self.reading, "composite", source::COMPOSITE)
    }

    fn log_energy_data(
        &self,
        reading: &EnergyReading,
        task: &TaskContext,
        cpu_info: &CpuInfo,
        function_name: Option<&str>,
    ) {
        for monitor in self.active_monitors() {
            monitor.log_energy_data(&monitor.get_energy_data(), task, cpu_info, function_name);
        }
        report::log_reading(
            &self.subject,
            "composite",
            self.process_id,
            &self.config,
            reading,
            task,
            cpu_info,
            function_name,
        );
    }

    fn attach(&mut self, observer: Arc<dyn EnergyObserver>) {
        for monitor in self.monitors.iter_mut() {
            monitor.attach(Arc::clone(&observer));
        }
        self.subject.attach(observer);
    }

    fn detach(&mut self, observer: &Arc<dyn EnergyObserver>) {
        for monitor in self.monitors.iter_mut() {
            monitor.detach(observer);
        }
        self.subject.detach(observer);
    }

    fn artifact_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .active_monitors()
            .flat_map(|m| m.artifact_names())
            .collect();
        names.push("composite".to_string());
        names
    }
}
