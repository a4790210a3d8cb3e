use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use worker_energy::observer::LoggingObserver;
use worker_energy::utils::logger::setup_logger;
use worker_energy::{CpuInfo, EnergyConfig, EnergyManager, MonitoringError, TaskContext};

/// Busy loop standing in for a user function.
fn cpu_burst(seconds: f64) -> u64 {
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    let mut acc: u64 = 0;
    while Instant::now() < deadline {
        for i in 0..10_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
    }
    acc
}

#[tokio::main]
async fn main() -> Result<(), MonitoringError> {
    setup_logger();
    info!("Application started");

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => EnergyConfig::from_file(&PathBuf::from(path))?,
        None => EnergyConfig::default(),
    }
    .with_env_overrides()?;
    let seconds: f64 = match args.next() {
        Some(value) => value
            .parse()
            .map_err(|e| MonitoringError::Config(format!("invalid workload seconds '{}': {}", value, e)))?,
        None => 2.0,
    };

    let mut manager = EnergyManager::new(std::process::id(), config).await;
    manager.attach(Arc::new(LoggingObserver));

    manager.start().await;
    info!("Running a {:.1}s CPU burst...", seconds);
    let checksum = tokio::task::spawn_blocking(move || cpu_burst(seconds))
        .await
        .map_err(|e| MonitoringError::Other(format!("workload failed: {}", e)))?;
    manager.stop().await;

    let cpu_info = CpuInfo::collect(manager.start_timestamp()).await;
    let task = TaskContext::new("demo", &format!("{:05}", checksum % 100_000));
    let entries = manager.process_energy_data(&task, &cpu_info);
    for (key, value) in &entries {
        info!("{} = {}", key, value);
    }

    info!("Program ended successfully.");
    Ok(())
}
