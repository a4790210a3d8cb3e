use crate::config::IpmiOptions;
use crate::energy_monitor::{
    CpuInfo, EnergyMonitor, EnergyReading, MeasurementWindow, MonitorContext, MonitorState,
    TaskContext, frozen_or_empty, source,
};
use crate::observer::{EnergyObserver, EnergySubject, EventKind};
use crate::report;
use crate::utils::psutils::{command_exists, now_timestamp};
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Pending sample batches between the polling task and `stop()`.
const SAMPLE_CHANNEL_CAPACITY: usize = 10;

/// Sensor banks polled alongside power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Voltage,
    Current,
    Temperature,
    Fan,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Voltage,
        SensorKind::Current,
        SensorKind::Temperature,
        SensorKind::Fan,
    ];

    pub fn sdr_type(&self) -> &'static str {
        match self {
            SensorKind::Voltage => "Voltage",
            SensorKind::Current => "Current",
            SensorKind::Temperature => "Temperature",
            SensorKind::Fan => "Fan",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Voltage => "Volts",
            SensorKind::Current => "Amps",
            SensorKind::Temperature => "degrees C",
            SensorKind::Fan => "RPM",
        }
    }

    pub fn report_key(&self) -> &'static str {
        match self {
            SensorKind::Voltage => "voltage_readings",
            SensorKind::Current => "current_readings",
            SensorKind::Temperature => "temperature_readings",
            SensorKind::Fan => "fan_readings",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub timestamp: f64,
    pub values: BTreeMap<String, f64>,
}

/// Everything sampled during one window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpmiSeries {
    /// (timestamp, watts)
    pub power: Vec<(f64, f64)>,
    pub voltage: Vec<SensorSnapshot>,
    pub current: Vec<SensorSnapshot>,
    pub temperature: Vec<SensorSnapshot>,
    pub fan: Vec<SensorSnapshot>,
}

impl IpmiSeries {
    pub fn bank(&self, kind: SensorKind) -> &Vec<SensorSnapshot> {
        match kind {
            SensorKind::Voltage => &self.voltage,
            SensorKind::Current => &self.current,
            SensorKind::Temperature => &self.temperature,
            SensorKind::Fan => &self.fan,
        }
    }

    fn bank_mut(&mut self, kind: SensorKind) -> &mut Vec<SensorSnapshot> {
        match kind {
            SensorKind::Voltage => &mut self.voltage,
            SensorKind::Current => &mut self.current,
            SensorKind::Temperature => &mut self.temperature,
            SensorKind::Fan => &mut self.fan,
        }
    }

    pub fn push_sensors(&mut self, kind: SensorKind, timestamp: f64, values: BTreeMap<String, f64>) {
        self.bank_mut(kind).push(SensorSnapshot { timestamp, values });
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_empty() && SensorKind::ALL.iter().all(|&kind| self.bank(kind).is_empty())
    }

    /// Appends a later batch.
    pub fn merge(&mut self, batch: IpmiSeries) {
        self.power.extend(batch.power);
        self.voltage.extend(batch.voltage);
        self.current.extend(batch.current);
        self.temperature.extend(batch.temperature);
        self.fan.extend(batch.fan);
    }
}

/// `Instantaneous power reading:   215 Watts` -> 215.0
pub fn parse_dcmi_power(output: &str) -> Option<f64> {
    output
        .lines()
        .filter(|line| line.contains("Instantaneous power"))
        .find_map(|line| {
            let (_, rest) = line.split_once(':')?;
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
}

/// Sums every `N Watts` value of a power-supply sensor table.
pub fn parse_sdr_power_sum(output: &str) -> Option<f64> {
    let total: f64 = parse_sdr_sensors(output, "Watts")
        .values()
        .filter(|&&watts| watts > 0.0)
        .sum();
    (total > 0.0).then_some(total)
}

/// Interprets the last two bytes of a raw response as a big-endian watt value.
pub fn parse_raw_power(output: &str) -> Option<f64> {
    let bytes: Vec<u8> = output
        .split_whitespace()
        .map(|token| u8::from_str_radix(token.trim_start_matches("0x"), 16))
        .collect::<Result<_, _>>()
        .ok()?;
    let [.., msb, lsb] = bytes.as_slice() else {
        return None;
    };
    let watts = ((*msb as u16) << 8 | *lsb as u16) as f64;
    (watts > 0.0).then_some(watts)
}

/// Parses `name | id | status | entity | value unit` rows whose value carries `unit`.
pub fn parse_sdr_sensors(output: &str, unit: &str) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        let (Some(name), Some(last)) = (fields.first(), fields.last()) else {
            continue;
        };
        if fields.len() < 2 || name.is_empty() {
            continue;
        }
        if let Some(number) = last.strip_suffix(unit) {
            match number.trim().parse::<f64>() {
                Ok(value) => {
                    values.insert(name.to_string(), value);
                }
                Err(_) => debug!("Skipping sensor '{}' with value '{}'", name, last),
            }
        }
    }
    values
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "" | "localhost" | "127.0.0.1" | "::1")
}

/// Full argv for one ipmitool invocation.
pub fn build_command(options: &IpmiOptions, args: &[&str]) -> Vec<String> {
    let mut argv = Vec::new();
    if options.use_sudo {
        argv.extend(["sudo".to_string(), "-n".to_string()]);
    }
    argv.push(options.ipmitool_path.clone());
    if !is_local_host(&options.host) {
        argv.extend(["-I".to_string(), options.interface.clone()]);
        argv.extend(["-H".to_string(), options.host.clone()]);
        if let Some(user) = &options.username {
            argv.extend(["-U".to_string(), user.clone()]);
        }
        if let Some(password) = &options.password {
            argv.extend(["-P".to_string(), password.clone()]);
        }
    }
    argv.extend(args.iter().map(|a| a.to_string()));
    argv
}

/// Runs ipmitool commands with a per-command timeout.
#[derive(Debug, Clone)]
pub struct IpmiClient {
    options: IpmiOptions,
    timeout: Duration,
}

impl IpmiClient {
    pub fn new(options: IpmiOptions, timeout: Duration) -> Self {
        Self { options, timeout }
    }

    pub async fn is_available(&self) -> bool {
        if !command_exists(&self.options.ipmitool_path) {
            return false;
        }
        let probe = Command::new(&self.options.ipmitool_path).arg("-V").output();
        matches!(
            tokio::time::timeout(self.timeout, probe).await,
            Ok(Ok(output)) if output.status.success()
        )
    }

    async fn run(&self, args: &[&str]) -> Option<String> {
        let argv = build_command(&self.options, args);
        let (program, rest) = argv.split_first()?;
        let mut command = Command::new(program);
        command.args(rest).kill_on_drop(true);
        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                debug!(
                    "ipmitool {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Ok(Err(e)) => {
                debug!("ipmitool {} could not run: {}", args.join(" "), e);
                None
            }
            Err(_) => {
                warn!("ipmitool {} timed out", args.join(" "));
                None
            }
        }
    }

    /// DCMI reading, then the power-supply sensor sum, then the raw OEM command.
    pub async fn read_power(&self) -> Option<f64> {
        if let Some(watts) = self.run(&["dcmi", "power", "reading"]).await.as_deref().and_then(parse_dcmi_power) {
            return Some(watts);
        }
        if let Some(watts) = self
            .run(&["sdr", "type", "Power_Supply"])
            .await
            .as_deref()
            .and_then(parse_sdr_power_sum)
        {
            return Some(watts);
        }
        self.run(&["raw", "0x2E", "0xC8", "0x57", "0x01", "0x00"])
            .await
            .as_deref()
            .and_then(parse_raw_power)
    }

    pub async fn read_sensors(&self, kind: SensorKind) -> Option<BTreeMap<String, f64>> {
        let output = self.run(&["sdr", "type", kind.sdr_type()]).await?;
        let values = parse_sdr_sensors(&output, kind.unit());
        (!values.is_empty()).then_some(values)
    }
}

/// Deterministic stand-in series, seeded from the window length.
pub fn synthesize_series(duration: f64, interval: f64, start: f64) -> IpmiSeries {
    let mut rng = StdRng::seed_from_u64(duration.to_bits());
    let mut series = IpmiSeries::default();

    let samples = ((duration / interval.max(f64::EPSILON)).floor() as usize).max(1);
    for i in 0..samples {
        let trend = (i as f64 / samples as f64) * 50.0;
        let noise = rng.gen_range(-10.0..10.0);
        series.power.push((start + i as f64 * interval, 200.0 + trend + noise));
    }

    let voltage = sensor_bank(
        &[("CPU1 Voltage", 1.2), ("CPU2 Voltage", 1.2), ("System 12V", 12.0), ("System 5V", 5.0), ("System 3.3V", 3.3)],
        0.1,
        &mut rng,
    );
    let current = sensor_bank(&[("CPU1 Current", 10.0), ("CPU2 Current", 10.0), ("System Current", 20.0)], 1.0, &mut rng);
    let temperature = sensor_bank(
        &[("CPU1 Temp", 65.0), ("CPU2 Temp", 63.0), ("System Temp", 40.0), ("Inlet Temp", 25.0)],
        5.0,
        &mut rng,
    );
    let fan = sensor_bank(&[("Fan1", 5000.0), ("Fan2", 5000.0), ("Fan3", 5000.0), ("Fan4", 5000.0)], 1000.0, &mut rng);

    series.push_sensors(SensorKind::Voltage, start + duration / 3.0, voltage);
    series.push_sensors(SensorKind::Current, start + 2.0 * duration / 3.0, current);
    series.push_sensors(SensorKind::Temperature, start + duration / 2.0, temperature);
    series.push_sensors(SensorKind::Fan, start + 2.0 * duration / 3.0, fan);
    series
}

fn sensor_bank(base: &[(&str, f64)], spread: f64, rng: &mut StdRng) -> BTreeMap<String, f64> {
    base.iter()
        .map(|(name, value)| (name.to_string(), value + rng.gen_range(0.0..spread)))
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Energy is average power times the window length; statistics cover the power series.
pub fn reading_from_series(series: &IpmiSeries, duration: f64, synthetic: bool) -> EnergyReading {
    let power: Vec<f64> = series.power.iter().map(|(_, watts)| *watts).collect();
    let avg_power = mean(&power).unwrap_or(0.0);

    let mut reading = EnergyReading::empty(source::OUT_OF_BAND)
        .with_metric("system", avg_power * duration)
        .with_metric("avg_power", avg_power);
    reading.duration = duration;
    reading.synthetic = synthetic;

    if !power.is_empty() {
        let min = power.iter().copied().fold(f64::INFINITY, f64::min);
        let max = power.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let variance = power.iter().map(|p| (p - avg_power).powi(2)).sum::<f64>() / power.len() as f64;
        reading = reading
            .with_metric("min_power", min)
            .with_metric("max_power", max)
            .with_metric("power_std_dev", variance.sqrt());
    }

    let latest = series
        .temperature
        .iter()
        .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    if let Some(snapshot) = latest {
        let matching = |needle: &str| -> Vec<f64> {
            snapshot
                .values
                .iter()
                .filter(|(name, _)| name.to_lowercase().contains(needle))
                .map(|(_, value)| *value)
                .collect()
        };
        if let Some(cpu) = mean(&matching("cpu")) {
            reading = reading.with_metric("avg_cpu_temp", cpu);
        }
        if let Some(system) = mean(&matching("system")) {
            reading = reading.with_metric("avg_system_temp", system);
        }
    }

    reading.extra.insert(
        "power_readings".to_string(),
        Value::Array(
            series
                .power
                .iter()
                .map(|(timestamp, power)| json!({"timestamp": timestamp, "power": power}))
                .collect(),
        ),
    );
    for kind in SensorKind::ALL {
        let rows: Vec<Value> = series
            .bank(kind)
            .iter()
            .flat_map(|snapshot| {
                snapshot.values.iter().map(move |(sensor, value)| {
                    json!({"timestamp": snapshot.timestamp, "sensor": sensor, "value": value})
                })
            })
            .collect();
        reading.extra.insert(kind.report_key().to_string(), Value::Array(rows));
    }
    reading
}

/// Polls until `is_running` clears. Each iteration's samples go out as one batch;
/// a full channel keeps them pending for the next attempt, so polling never stalls.
async fn run_sampling_loop(
    client: IpmiClient,
    tx: mpsc::Sender<IpmiSeries>,
    is_running: Arc<AtomicBool>,
    interval: Duration,
    sensor_every: u32,
) {
    let mut iteration: u64 = 0;
    let mut pending = IpmiSeries::default();
    while is_running.load(Ordering::Relaxed) {
        iteration += 1;
        let timestamp = now_timestamp();
        if let Some(watts) = client.read_power().await {
            pending.power.push((timestamp, watts));
        }

        if sensor_every > 0 && iteration % sensor_every as u64 == 0 {
            for kind in SensorKind::ALL {
                if let Some(values) = client.read_sensors(kind).await {
                    pending.push_sensors(kind, timestamp, values);
                }
            }
        }

        if !pending.is_empty() {
            match tx.try_send(std::mem::take(&mut pending)) {
                Ok(()) => {}
                Err(TrySendError::Full(batch)) => pending = batch,
                Err(TrySendError::Closed(_)) => {
                    debug!("IPMI sample receiver dropped");
                    return;
                }
            }
        }
        tokio::time::sleep(interval).await;
    }

    if !pending.is_empty() && tx.send(pending).await.is_err() {
        debug!("IPMI sample receiver dropped before the final batch");
    }
    debug!("IPMI sampling stopped after {} iterations", iteration);
}

/// Collects batches until the sampling task drops its sender. On timeout the
/// task is aborted and whatever is already queued is kept.
async fn drain_samples(
    mut rx: mpsc::Receiver<IpmiSeries>,
    handle: Option<JoinHandle<()>>,
    timeout: Duration,
) -> IpmiSeries {
    let mut series = IpmiSeries::default();
    let drain = async {
        while let Some(batch) = rx.recv().await {
            series.merge(batch);
        }
    };
    if tokio::time::timeout(timeout, drain).await.is_err() {
        warn!("IPMI sampling task did not finish within {:?}, aborting", timeout);
        if let Some(handle) = handle {
            handle.abort();
        }
        while let Ok(batch) = rx.try_recv() {
            series.merge(batch);
        }
    }
    series
}

/// Whole-node power from the baseboard management controller.
pub struct IpmiMonitor {
    process_id: u32,
    context: MonitorContext,
    client: IpmiClient,
    window: MeasurementWindow,
    subject: EnergySubject,
    placeholder: bool,
    is_running: Arc<AtomicBool>,
    data_receiver: Option<mpsc::Receiver<IpmiSeries>>,
    task_handle: Option<JoinHandle<()>>,
    reading: Option<EnergyReading>,
}

impl IpmiMonitor {
    pub fn new(context: &MonitorContext) -> Self {
        let client = IpmiClient::new(context.config.ipmi.clone(), context.config.stop_timeout());
        Self {
            process_id: context.process_id,
            context: context.clone(),
            client,
            window: MeasurementWindow::default(),
            subject: EnergySubject::new(),
            placeholder: false,
            is_running: Arc::new(AtomicBool::new(false)),
            data_receiver: None,
            task_handle: None,
            reading: None,
        }
    }

    fn interval(&self) -> f64 {
        self.context.config.ipmi.sampling_interval_secs.max(0.01)
    }
}

#[async_trait]
impl EnergyMonitor for IpmiMonitor {
    fn name(&self) -> &str {
        "ipmi"
    }

    fn state(&self) -> MonitorState {
        self.window.state()
    }

    async fn start(&mut self) -> bool {
        if self.window.state() != MonitorState::Idle {
            warn!("ipmi monitor already used");
            return false;
        }

        if !self.client.is_available().await {
            warn!("ipmitool not available, IPMI readings will be placeholders");
            self.placeholder = true;
        } else if self.client.read_power().await.is_none() {
            warn!("No IPMI power source responded, IPMI readings will be placeholders");
            self.placeholder = true;
        }

        self.window.open();
        if !self.placeholder {
            let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
            self.data_receiver = Some(rx);
            self.is_running.store(true, Ordering::Relaxed);
            self.task_handle = Some(tokio::spawn(run_sampling_loop(
                self.client.clone(),
                tx,
                Arc::clone(&self.is_running),
                Duration::from_secs_f64(self.interval()),
                self.context.config.ipmi.sensor_every,
            )));
            info!("IPMI monitoring started every {:.2}s", self.interval());
        }

        self.subject.notify(
            EventKind::Start,
            &json!({
                "monitor": "ipmi",
                "process_id": self.process_id,
                "start_time": self.window.start_timestamp(),
                "placeholder": self.placeholder,
            }),
        );
        true
    }

    async fn stop(&mut self) {
        let Some(duration) = self.window.close() else {
            return;
        };

        self.is_running.store(false, Ordering::Relaxed);
        let drained = match self.data_receiver.take() {
            Some(rx) => {
                drain_samples(rx, self.task_handle.take(), self.context.config.stop_timeout()).await
            }
            None => IpmiSeries::default(),
        };

        let series = if self.placeholder {
            info!("Generating placeholder IPMI data");
            synthesize_series(duration, self.interval(), self.window.start_timestamp())
        } else {
            drained
        };
        let reading = reading_from_series(&series, duration, self.placeholder);
        info!(
            "IPMI energy {:.2} J, average power {:.2} W over {} samples",
            reading.metric("system").unwrap_or(0.0),
            reading.metric("avg_power").unwrap_or(0.0),
            series.power.len()
        );

        self.subject.notify(
            EventKind::Stop,
            &json!({
                "monitor": "ipmi",
                "process_id": self.process_id,
                "end_time": self.window.end_timestamp(),
                "duration": duration,
            }),
        );
        self.subject.notify(
            EventKind::Data,
            &json!({"monitor": "ipmi", "process_id": self.process_id, "energy_data": reading.to_json()}),
        );
        self.reading = Some(reading);
    }

    fn get_energy_data(&self) -> EnergyReading {
        frozen_or_empty(&self.reading, "ipmi", source::OUT_OF_BAND)
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
            "ipmi",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnergyConfig;

    #[test]
    fn test_parse_dcmi_power() {
        let output = "\
    Instantaneous power reading:                   215 Watts
    Minimum during sampling period:                 90 Watts
    Maximum during sampling period:                320 Watts
";
        assert_eq!(parse_dcmi_power(output), Some(215.0));
        assert_eq!(parse_dcmi_power("Instantaneous power reading: 215 Watts"), Some(215.0));
        assert_eq!(parse_dcmi_power("no reading here"), None);
    }

    #[test]
    fn test_parse_sdr_power_sum() {
        let output = "\
PS1 Input Power  | 72h | ok  | 10.1 | 110 Watts
PS2 Input Power  | 73h | ok  | 10.2 | 95 Watts
PS3 Input Power  | 74h | ns  | 10.3 | 0 Watts
PS Redundancy    | 75h | ok  | 10.4 | Fully Redundant
";
        assert_eq!(parse_sdr_power_sum(output), Some(205.0));
        assert_eq!(parse_sdr_power_sum("PS1 | 72h | ns | 10.1 | 0 Watts"), None);
    }

    #[test]
    fn test_parse_raw_power() {
        assert_eq!(parse_raw_power(" 57 01 00 01 2c"), Some(300.0));
        assert_eq!(parse_raw_power("00 00"), None);
        assert_eq!(parse_raw_power("zz"), None);
        assert_eq!(parse_raw_power("2c"), None);
    }

    #[test]
    fn test_parse_sdr_sensors() {
        let output = "\
CPU1 Temp        | 30h | ok  |  3.1 | 54 degrees C
System Temp      | 31h | ok  |  7.1 | 31 degrees C
Fan1             | 41h | ok  | 29.1 | 5400 RPM
CPU2 Temp        | 32h | ns  |  3.2 | No Reading
";
        let temps = parse_sdr_sensors(output, "degrees C");
        assert_eq!(temps.len(), 2);
        assert_eq!(temps["CPU1 Temp"], 54.0);
        assert_eq!(temps["System Temp"], 31.0);

        let fans = parse_sdr_sensors(output, "RPM");
        assert_eq!(fans["Fan1"], 5400.0);
    }

    #[test]
    fn test_build_command() {
        let mut options = IpmiOptions::default();
        assert_eq!(
            build_command(&options, &["dcmi", "power", "reading"]),
            vec!["sudo", "-n", "ipmitool", "dcmi", "power", "reading"]
        );

        options.use_sudo = false;
        options.host = "10.1.2.3".to_string();
        options.username = Some("admin".to_string());
        options.password = Some("secret".to_string());
        assert_eq!(
            build_command(&options, &["sdr", "type", "Fan"]),
            vec!["ipmitool", "-I", "lanplus", "-H", "10.1.2.3", "-U", "admin", "-P", "secret", "sdr", "type", "Fan"]
        );
    }

    #[test]
    fn test_reading_from_series() {
        let mut series = IpmiSeries::default();
        series.power = vec![(0.0, 100.0), (1.0, 200.0), (2.0, 300.0)];
        let mut temps = BTreeMap::new();
        temps.insert("CPU1 Temp".to_string(), 60.0);
        temps.insert("CPU2 Temp".to_string(), 70.0);
        temps.insert("System Temp".to_string(), 30.0);
        series.push_sensors(SensorKind::Temperature, 0.5, BTreeMap::new());
        series.push_sensors(SensorKind::Temperature, 1.5, temps);

        let reading = reading_from_series(&series, 3.0, false);
        assert_eq!(reading.source, "out-of-band");
        assert_eq!(reading.metric("avg_power"), Some(200.0));
        assert_eq!(reading.metric("system"), Some(600.0));
        assert_eq!(reading.metric("min_power"), Some(100.0));
        assert_eq!(reading.metric("max_power"), Some(300.0));
        let std_dev = reading.metric("power_std_dev").unwrap();
        assert!((std_dev - (20000.0_f64 / 3.0).sqrt()).abs() < 1e-9);
        assert_eq!(reading.metric("avg_cpu_temp"), Some(65.0));
        assert_eq!(reading.metric("avg_system_temp"), Some(30.0));
        assert_eq!(reading.extra["power_readings"].as_array().unwrap().len(), 3);
        assert_eq!(reading.extra["temperature_readings"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_synthesize_series_is_deterministic() {
        let first = synthesize_series(4.0, 1.0, 1000.0);
        let second = synthesize_series(4.0, 1.0, 1000.0);
        assert_eq!(first, second);
        assert_eq!(first.power.len(), 4);
        assert!(first.power.iter().all(|(_, w)| (190.0..260.0).contains(w)));
        assert_eq!(first.voltage[0].values.len(), 5);
        assert_eq!(first.temperature[0].timestamp, 1002.0);
        assert_eq!(first.fan[0].values.len(), 4);

        // shorter than one interval still yields a sample
        assert_eq!(synthesize_series(0.0, 1.0, 0.0).power.len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_window() {
        let mut config = EnergyConfig::default();
        config.ipmi.ipmitool_path = "ipmitool-that-does-not-exist".to_string();
        let mut monitor = IpmiMonitor::new(&MonitorContext::new(std::process::id(), config));

        assert!(monitor.start().await);
        monitor.stop().await;
        let reading = monitor.get_energy_data();
        assert_eq!(reading.source, "out-of-band");
        assert!(reading.synthetic);
        assert!(reading.duration >= 0.0);
        assert!(reading.extra.contains_key("fan_readings"));
        assert_eq!(reading, monitor.get_energy_data());
    }

    const FAKE_IPMITOOL: &str = r#"case "$1" in
  dcmi) echo "    Instantaneous power reading:                   150 Watts" ;;
  sdr) echo "CPU1 Temp        | 30h | ok  |  3.1 | 54 degrees C" ;;
esac
exit 0
"#;

    fn fake_tool_options(dir: &std::path::Path) -> IpmiOptions {
        let script = crate::collectors::dummy::write_script(dir, "ipmitool", FAKE_IPMITOOL);
        IpmiOptions {
            ipmitool_path: script.display().to_string(),
            use_sudo: false,
            sampling_interval_secs: 0.05,
            sensor_every: 1,
            ..IpmiOptions::default()
        }
    }

    #[tokio::test]
    async fn test_sampling_outpaces_channel_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpmiClient::new(fake_tool_options(dir.path()), Duration::from_secs(5));
        let (tx, rx) = mpsc::channel(1);
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_sampling_loop(
            client,
            tx,
            Arc::clone(&running),
            Duration::from_millis(10),
            0,
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        running.store(false, Ordering::Relaxed);
        let series = drain_samples(rx, Some(task), Duration::from_secs(5)).await;
        assert!(series.power.len() > 2, "only {} samples", series.power.len());
        assert!(series.power.iter().all(|(_, watts)| *watts == 150.0));
        assert!(series.power.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(series.temperature.is_empty());
    }

    #[tokio::test]
    async fn test_window_with_responding_bmc() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EnergyConfig::default();
        config.ipmi = fake_tool_options(dir.path());
        let mut monitor = IpmiMonitor::new(&MonitorContext::new(std::process::id(), config));

        assert!(monitor.start().await);
        tokio::time::sleep(Duration::from_millis(400)).await;
        monitor.stop().await;

        let reading = monitor.get_energy_data();
        assert!(!reading.synthetic);
        assert_eq!(reading.metric("avg_power"), Some(150.0));
        assert_eq!(reading.metric("power_std_dev"), Some(0.0));
        assert_eq!(reading.metric("avg_cpu_temp"), Some(54.0));
        let system = reading.metric("system").unwrap();
        assert!((system - 150.0 * reading.duration).abs() < 1e-6);
        assert!(reading.extra["power_readings"].as_array().unwrap().len() >= 2);
        assert!(reading.extra["voltage_readings"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_listener_events() {
        use crate::collectors::dummy::RecordingObserver;
        use EventKind::{Data, Start, Stop};

        let mut config = EnergyConfig::default();
        config.ipmi.ipmitool_path = "ipmitool-that-does-not-exist".to_string();
        let mut monitor = IpmiMonitor::new(&MonitorContext::new(std::process::id(), config));
        let recorder = Arc::new(RecordingObserver::default());
        monitor.attach(recorder.clone());

        assert!(monitor.start().await);
        monitor.stop().await;
        monitor.stop().await;
        monitor.get_energy_data();
        monitor.get_energy_data();
        assert_eq!(recorder.from_monitor("ipmi"), vec![Start, Stop, Data]);

        let listener: Arc<dyn EnergyObserver> = recorder.clone();
        monitor.detach(&listener);
        assert!(monitor.subject.is_empty());
    }
}
