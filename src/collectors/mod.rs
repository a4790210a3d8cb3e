pub mod bpf;
#[cfg(test)]
pub mod dummy;
pub mod ipmi;
pub mod null;
pub mod perf;
pub mod rapl;

pub use bpf::BpfMonitor;
pub use ipmi::IpmiMonitor;
pub use null::NullMonitor;
pub use perf::PerfMonitor;
pub use rapl::Rapl;
