use crate::energy_monitor::{CpuInfo, EnergyMonitor, EnergyReading, MeasurementWindow, MonitorState, TaskContext};
use crate::observer::{EnergyObserver, EnergySubject, EventKind};
use async_trait::async_trait;
use log::debug;
use serde_json::json;
use std::sync::Arc;

/// Inert monitor used when monitoring is disabled or nothing else is available.
#[derive(Default)]
pub struct NullMonitor {
    window: MeasurementWindow,
    subject: EnergySubject,
}

impl NullMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnergyMonitor for NullMonitor {
    fn name(&self) -> &str {
        "noop"
    }

    fn state(&self) -> MonitorState {
        self.window.state()
    }

    async fn start(&mut self) -> bool {
        if self.window.open() {
            self.subject.notify(EventKind::Start, &json!({"monitor": "noop"}));
        }
        true
    }

    async fn stop(&mut self) {
        if self.window.close().is_some() {
            self.subject.notify(EventKind::Stop, &json!({"monitor": "noop"}));
        }
    }

    fn get_energy_data(&self) -> EnergyReading {
        EnergyReading::disabled()
    }

    fn log_energy_data(
        &self,
        _reading: &EnergyReading,
        task: &TaskContext,
        _cpu_info: &CpuInfo,
        _function_name: Option<&str>,
    ) {
        debug!("Energy monitoring disabled, nothing logged for {}", task.execution_id());
    }

    fn attach(&mut self, observer: Arc<dyn EnergyObserver>) {
        self.subject.attach(observer);
    }

    fn detach(&mut self, observer: &Arc<dyn EnergyObserver>) {
        self.subject.detach(observer);
    }

    fn artifact_names(&self) -> Vec<String> {
        Vec::new()
    }
}
