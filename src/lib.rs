pub mod utils;

// Strategy implementations
pub mod collectors;

pub mod composite;
pub mod config;
pub mod energy_manager;
pub mod energy_monitor;
pub mod factory;
pub mod observer;
pub mod report;
pub mod summary;

pub use config::{EnergyConfig, StrategyRequest};
pub use energy_manager::EnergyManager;
pub use energy_monitor::{CpuInfo, EnergyMonitor, EnergyReading, MetricValue, MonitorState, TaskContext};
pub use factory::{MonitorFactory, StrategyRegistry};
pub use observer::{EnergyObserver, EventKind};
pub use utils::errors::MonitoringError;
