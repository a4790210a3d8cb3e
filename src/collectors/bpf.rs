use crate::collectors::rapl::{Rapl, RaplSample};
use crate::config::ProbeOptions;
use crate::energy_monitor::{
    CpuInfo, EnergyMonitor, EnergyReading, MeasurementWindow, MonitorContext, MonitorState,
    TaskContext, frozen_or_empty, source,
};
use crate::observer::{EnergyObserver, EnergySubject, EventKind};
use crate::report;
use crate::utils::psutils::{
    command_exists, effective_username, interrupt_and_wait, is_root, kernel_supports_bpf,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Rough joules per CPU cycle used for the cycle based estimate.
pub const JOULES_PER_CYCLE: f64 = 2e-11;

const CYCLES_PERIOD: u64 = 1_000_000;
const INSTRUCTIONS_PERIOD: u64 = 1_000_000;
const CACHE_REFS_PERIOD: u64 = 100_000;
const CACHE_MISSES_PERIOD: u64 = 10_000;

/// bpftrace program printing per-pid maps every `poll_ms` milliseconds.
pub fn probe_script(poll_ms: u64) -> String {
    const MAPS: [&str; 18] = [
        "cycles", "instructions", "cache_refs", "cache_misses", "syscalls", "ctx_switches",
        "migrations", "page_faults", "major_faults", "bio_issue", "bio_complete", "bio_latency_ns", "kmalloc",
        "kfree", "kmalloc_bytes", "net_tx", "net_rx", "skb_drops",
    ];
    let flush: String = MAPS
        .iter()
        .map(|m| format!("  print(@{m});\n  clear(@{m});\n"))
        .collect();
    format!(
        r#"hardware:cycles:{CYCLES_PERIOD} {{ @cycles[pid] = sum({CYCLES_PERIOD}); }}
hardware:instructions:{INSTRUCTIONS_PERIOD} {{ @instructions[pid] = sum({INSTRUCTIONS_PERIOD}); }}
hardware:cache-references:{CACHE_REFS_PERIOD} {{ @cache_refs[pid] = sum({CACHE_REFS_PERIOD}); }}
hardware:cache-misses:{CACHE_MISSES_PERIOD} {{ @cache_misses[pid] = sum({CACHE_MISSES_PERIOD}); }}
tracepoint:raw_syscalls:sys_enter {{ @syscalls[pid] = count(); }}
tracepoint:sched:sched_switch {{ @ctx_switches[args->prev_pid] = count(); }}
tracepoint:sched:sched_migrate_task {{ @migrations[args->pid] = count(); }}
tracepoint:exceptions:page_fault_user {{ @page_faults[pid] = count(); }}
software:major-faults:1 {{ @major_faults[pid] = count(); }}
tracepoint:block:block_rq_issue {{ @bio_issue[pid] = count(); @bio_start[args->dev, args->sector] = nsecs; }}
tracepoint:block:block_rq_complete /@bio_start[args->dev, args->sector]/ {{
  @bio_complete[pid] = count();
  @bio_latency_ns[pid] = sum(nsecs - @bio_start[args->dev, args->sector]);
  delete(@bio_start[args->dev, args->sector]);
}}
tracepoint:kmem:kmalloc {{ @kmalloc[pid] = count(); @kmalloc_bytes[pid] = sum(args->bytes_alloc); }}
tracepoint:kmem:kfree {{ @kfree[pid] = count(); }}
tracepoint:net:net_dev_queue {{ @net_tx[pid] = count(); }}
tracepoint:net:netif_receive_skb {{ @net_rx[pid] = count(); }}
tracepoint:skb:kfree_skb {{ @skb_drops[pid] = count(); }}
interval:ms:{poll_ms} {{
{flush}}}
END {{ clear(@bio_start); }}
"#
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeRecord {
    Counter { map: String, pid: u32, value: u64 },
    Lost(u64),
}

impl ProbeRecord {
    /// Scheduler records trigger an energy register read.
    pub fn is_scheduling(&self) -> bool {
        matches!(self, ProbeRecord::Counter { map, .. } if map == "ctx_switches")
    }
}

/// Parses `@map[pid]: value` and `Lost N events` lines; anything else is ignored.
pub fn parse_probe_line(line: &str) -> Option<ProbeRecord> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("Lost ") {
        let count = rest.split_whitespace().next()?.parse().ok()?;
        return Some(ProbeRecord::Lost(count));
    }
    let body = line.strip_prefix('@')?;
    let (map, rest) = body.split_once('[')?;
    let (key, value) = rest.split_once("]:")?;
    Some(ProbeRecord::Counter {
        map: map.to_string(),
        pid: key.trim().parse().ok()?,
        value: value.trim().parse().ok()?,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessCounters {
    pub cpu_cycles: u64,
    pub instructions: u64,
    pub cache_references: u64,
    pub cache_misses: u64,
    pub syscall_count: u64,
    pub context_switches: u64,
    pub cpu_migrations: u64,
    pub page_faults: u64,
    pub major_page_faults: u64,
    pub block_io_issue: u64,
    pub block_io_complete: u64,
    pub block_io_latency_ns: u64,
    pub slab_allocations: u64,
    pub slab_frees: u64,
    pub kmalloc_size: u64,
    pub net_tx_packets: u64,
    pub socket_recv_packets: u64,
    pub socket_drop_count: u64,
}

impl ProcessCounters {
    fn field_mut(&mut self, map: &str) -> Option<&mut u64> {
        Some(match map {
            "cycles" => &mut self.cpu_cycles,
            "instructions" => &mut self.instructions,
            "cache_refs" => &mut self.cache_references,
            "cache_misses" => &mut self.cache_misses,
            "syscalls" => &mut self.syscall_count,
            "ctx_switches" => &mut self.context_switches,
            "migrations" => &mut self.cpu_migrations,
            "page_faults" => &mut self.page_faults,
            "major_faults" => &mut self.major_page_faults,
            "bio_issue" => &mut self.block_io_issue,
            "bio_complete" => &mut self.block_io_complete,
            "bio_latency_ns" => &mut self.block_io_latency_ns,
            "kmalloc" => &mut self.slab_allocations,
            "kfree" => &mut self.slab_frees,
            "kmalloc_bytes" => &mut self.kmalloc_size,
            "net_tx" => &mut self.net_tx_packets,
            "net_rx" => &mut self.socket_recv_packets,
            "skb_drops" => &mut self.socket_drop_count,
            _ => return None,
        })
    }

    fn merge(&mut self, other: &ProcessCounters) {
        self.cpu_cycles += other.cpu_cycles;
        self.instructions += other.instructions;
        self.cache_references += other.cache_references;
        self.cache_misses += other.cache_misses;
        self.syscall_count += other.syscall_count;
        self.context_switches += other.context_switches;
        self.cpu_migrations += other.cpu_migrations;
        self.page_faults += other.page_faults;
        self.major_page_faults += other.major_page_faults;
        self.block_io_issue += other.block_io_issue;
        self.block_io_complete += other.block_io_complete;
        self.block_io_latency_ns += other.block_io_latency_ns;
        self.slab_allocations += other.slab_allocations;
        self.slab_frees += other.slab_frees;
        self.kmalloc_size += other.kmalloc_size;
        self.net_tx_packets += other.net_tx_packets;
        self.socket_recv_packets += other.socket_recv_packets;
        self.socket_drop_count += other.socket_drop_count;
    }
}

/// Counters accumulated from the probe stream, keyed by pid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeTable {
    pub processes: BTreeMap<u32, ProcessCounters>,
    pub records: u64,
    pub lost_events: u64,
    pub register_reads: u64,
    first_sample: Option<RaplSample>,
    /// Joules as (package, cores) since the first register read
    pub energy: Option<(f64, Option<f64>)>,
}

impl ProbeTable {
    pub fn apply(&mut self, record: ProbeRecord) {
        self.records += 1;
        match record {
            ProbeRecord::Lost(count) => self.lost_events += count,
            ProbeRecord::Counter { map, pid, value } => {
                match self.processes.entry(pid).or_default().field_mut(&map) {
                    Some(field) => *field += value,
                    None => debug!("Ignoring unknown probe map @{}", map),
                }
            }
        }
    }

    pub fn record_registers(&mut self, rapl: &Rapl, sample: RaplSample) {
        self.register_reads += 1;
        match self.first_sample {
            None => {
                self.first_sample = Some(sample);
                self.energy = Some((0.0, sample.core_uj.map(|_| 0.0)));
            }
            Some(first) => self.energy = Some(rapl.energy_between(&first, &sample)),
        }
    }

    /// Counters of `pid` when it was observed, otherwise the sum over every pid.
    pub fn scoped_counters(&self, pid: u32) -> (ProcessCounters, &'static str) {
        match self.processes.get(&pid) {
            Some(counters) => (counters.clone(), "process"),
            None => {
                let mut total = ProcessCounters::default();
                self.processes.values().for_each(|c| total.merge(c));
                (total, "system")
            }
        }
    }
}

/// Stand-in counters drawn from plausible ranges, for hosts where probes cannot attach.
pub fn synthesize_table(pid: u32, duration: f64) -> ProbeTable {
    let mut rng = rand::thread_rng();
    let frequency = rng.gen_range(2.0e9..3.0e9);
    let tdp = rng.gen_range(65.0..125.0);
    let usage = rng.gen_range(0.1..0.9);
    let core_share = rng.gen_range(0.7..0.85);
    let ipc = rng.gen_range(0.8..1.5);

    let cycles = (frequency * duration * usage) as u64;
    let instructions = (cycles as f64 * ipc) as u64;
    let cache_references = (instructions as f64 * rng.gen_range(0.01..0.05)) as u64;
    let cache_misses = (cache_references as f64 * rng.gen_range(0.05..0.20)) as u64;
    let block_io_issue = rng.gen_range(100..1000);
    let slab_allocations = rng.gen_range(5_000..50_000);

    let counters = ProcessCounters {
        cpu_cycles: cycles,
        instructions,
        cache_references,
        cache_misses,
        syscall_count: rng.gen_range(5_000..20_000),
        context_switches: rng.gen_range(1_000..10_000),
        cpu_migrations: rng.gen_range(50..200),
        page_faults: rng.gen_range(100..1_000),
        major_page_faults: rng.gen_range(5..50),
        block_io_issue,
        block_io_complete: block_io_issue,
        block_io_latency_ns: block_io_issue * rng.gen_range(1_000_000..10_000_000),
        slab_allocations,
        slab_frees: slab_allocations * 9 / 10,
        kmalloc_size: rng.gen_range(500_000..5_000_000),
        net_tx_packets: rng.gen_range(1_000..10_000),
        socket_recv_packets: rng.gen_range(1_000..10_000),
        socket_drop_count: rng.gen_range(10..100),
    };

    let package = tdp * usage * duration;
    let mut table = ProbeTable::default();
    table.processes.insert(pid, counters);
    table.energy = Some((package, Some(package * core_share)));
    table
}

/// Builds the reading, including derived rates with floored divisors.
pub fn reading_from_table(table: &ProbeTable, pid: u32, duration: f64, synthetic: bool) -> EnergyReading {
    let (counters, scope) = table.scoped_counters(pid);
    let (pkg, cores) = table.energy.unwrap_or((0.0, None));
    let cores = cores.unwrap_or(0.0);
    let cycles = counters.cpu_cycles as f64;

    let mut reading = EnergyReading::empty(source::KERNEL_PROBE)
        .with_metric("pkg", pkg)
        .with_metric("cores", cores)
        .with_metric("core_percentage", if pkg > 0.0 { cores / pkg } else { 0.0 })
        .with_metric("cpu_cycles", cycles)
        .with_metric("energy_from_cycles", cycles * JOULES_PER_CYCLE);
    reading.duration = duration;
    reading.synthetic = synthetic;

    let extra = &mut reading.extra;
    extra.insert(
        "cpu_perf_metrics".to_string(),
        json!({
            "instructions": counters.instructions,
            "cycles": counters.cpu_cycles,
            "cache_references": counters.cache_references,
            "cache_misses": counters.cache_misses,
            "instructions_per_cycle": counters.instructions as f64 / cycles.max(1.0),
            "cache_miss_rate": counters.cache_misses as f64 / (counters.cache_references as f64).max(1.0),
            "cpu_cycles_per_second": cycles / duration.max(0.001),
            "CPU_INSTRUCTIONS:PACKAGE0": counters.instructions,
            "CPU_CYCLES:PACKAGE0": counters.cpu_cycles,
            "LLC_MISSES:PACKAGE0": counters.cache_misses,
        }),
    );
    extra.insert(
        "syscall_metrics".to_string(),
        json!({
            "syscall_count": counters.syscall_count,
            "context_switches": counters.context_switches,
            "cpu_migrations": counters.cpu_migrations,
            "page_faults": counters.page_faults,
            "major_page_faults": counters.major_page_faults,
            "block_rq_issue": counters.block_io_issue,
            "block_rq_complete": counters.block_io_complete,
            "block_rq_latency_ns": counters.block_io_latency_ns,
            "block_rq_latency_us": counters.block_io_latency_ns as f64 / 1000.0,
        }),
    );
    extra.insert(
        "memory_metrics".to_string(),
        json!({
            "slab_allocations": counters.slab_allocations,
            "slab_frees": counters.slab_frees,
            "kmalloc_size": counters.kmalloc_size,
        }),
    );
    extra.insert(
        "network_metrics".to_string(),
        json!({
            "net_tx_packets": counters.net_tx_packets,
            "socket_recv_packets": counters.socket_recv_packets,
            "socket_drop_count": counters.socket_drop_count,
        }),
    );
    extra.insert(
        "perf_buffer_metrics".to_string(),
        json!({
            "records": table.records,
            "lost_events": table.lost_events,
            "register_reads": table.register_reads,
        }),
    );
    extra.insert("probe_scope".to_string(), Value::from(scope));
    extra.insert("observed_processes".to_string(), Value::from(table.processes.len()));
    reading
}

/// Reasons the probe substrate cannot be used on this host.
pub fn substrate_status(options: &ProbeOptions) -> Result<(), String> {
    if !is_root() {
        return Err(format!("kernel probes require root, running as {}", effective_username()));
    }
    if !command_exists(&options.bpftrace_path) {
        return Err(format!("{} is not installed", options.bpftrace_path));
    }
    if kernel_supports_bpf() == Some(false) {
        return Err("kernel built without CONFIG_BPF/CONFIG_BPF_SYSCALL".to_string());
    }
    Ok(())
}

async fn run_drain_loop(
    stdout: ChildStdout,
    table: Arc<Mutex<ProbeTable>>,
    rapl: Rapl,
    is_running: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match tokio::time::timeout(poll, lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                let Some(record) = parse_probe_line(&line) else {
                    continue;
                };
                let registers = if record.is_scheduling() { rapl.read() } else { None };
                let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
                table.apply(record);
                if let Some(sample) = registers {
                    table.record_registers(&rapl, sample);
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!("Probe stream read failed: {}", e);
                break;
            }
            Err(_) => {
                if !is_running.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }
    debug!("Probe drain loop finished");
}

/// Per-process kernel counters gathered with bpftrace, plus RAPL register reads.
pub struct BpfMonitor {
    process_id: u32,
    context: MonitorContext,
    options: ProbeOptions,
    window: MeasurementWindow,
    subject: EnergySubject,
    placeholder: bool,
    is_running: Arc<AtomicBool>,
    table: Arc<Mutex<ProbeTable>>,
    child: Option<Child>,
    task_handle: Option<JoinHandle<()>>,
    reading: Option<EnergyReading>,
}

impl BpfMonitor {
    pub fn new(context: &MonitorContext) -> Self {
        Self {
            process_id: context.process_id,
            options: context.config.ebpf.clone(),
            context: context.clone(),
            window: MeasurementWindow::default(),
            subject: EnergySubject::new(),
            placeholder: false,
            is_running: Arc::new(AtomicBool::new(false)),
            table: Arc::new(Mutex::new(ProbeTable::default())),
            child: None,
            task_handle: None,
            reading: None,
        }
    }

    fn attach_probes(&mut self) -> Result<(), String> {
        substrate_status(&self.options)?;
        let mut child = Command::new(&self.options.bpftrace_path)
            .arg("-e")
            .arg(probe_script(self.options.poll_interval_ms))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start bpftrace: {}", e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "bpftrace stdout unavailable".to_string())?;

        let rapl = Rapl::new(Some(self.options.rapl_path.clone()));
        if !rapl.is_available() {
            warn!(
                "No readable RAPL registers under {}, probe energy will be zero",
                self.options.rapl_path.display()
            );
        }

        self.is_running.store(true, Ordering::Relaxed);
        self.task_handle = Some(tokio::spawn(run_drain_loop(
            stdout,
            Arc::clone(&self.table),
            rapl,
            Arc::clone(&self.is_running),
            Duration::from_millis(self.options.poll_interval_ms.max(1)),
        )));
        self.child = Some(child);
        Ok(())
    }
}

#[async_trait]
impl EnergyMonitor for BpfMonitor {
    fn name(&self) -> &str {
        "ebpf"
    }

    fn state(&self) -> MonitorState {
        self.window.state()
    }

    async fn start(&mut self) -> bool {
        if self.window.state() != MonitorState::Idle {
            warn!("ebpf monitor already used");
            return false;
        }

        if let Err(reason) = self.attach_probes() {
            warn!("Kernel probes unavailable ({}), readings will be synthetic", reason);
            self.placeholder = true;
        } else {
            info!("Kernel probes attached for process {}", self.process_id);
        }

        self.window.open();
        self.subject.notify(
            EventKind::Start,
            &json!({
                "monitor": "ebpf",
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

        let timeout = self.context.config.stop_timeout();
        if let Some(mut child) = self.child.take() {
            interrupt_and_wait(&mut child, timeout, "bpftrace").await;
        }
        self.is_running.store(false, Ordering::Relaxed);
        if let Some(mut handle) = self.task_handle.take() {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!("Probe drain task did not finish within {:?}, aborting", timeout);
                handle.abort();
            }
        }

        let table = std::mem::take(&mut *self.table.lock().unwrap_or_else(PoisonError::into_inner));
        let synthetic = self.placeholder || table.records == 0;
        let reading = if synthetic {
            if !self.placeholder {
                warn!("Kernel probes delivered no records, readings will be synthetic");
            }
            reading_from_table(&synthesize_table(self.process_id, duration), self.process_id, duration, true)
        } else {
            reading_from_table(&table, self.process_id, duration, false)
        };
        info!(
            "ebpf monitoring stopped after {:.3}s ({} records, synthetic: {})",
            duration, table.records, synthetic
        );

        self.subject.notify(
            EventKind::Stop,
            &json!({
                "monitor": "ebpf",
                "process_id": self.process_id,
                "end_time": self.window.end_timestamp(),
                "duration": duration,
            }),
        );
        self.subject.notify(
            EventKind::Data,
            &json!({"monitor": "ebpf", "process_id": self.process_id, "energy_data": reading.to_json()}),
        );
        self.reading = Some(reading);
    }

    fn get_energy_data(&self) -> EnergyReading {
        frozen_or_empty(&self.reading, "ebpf", source::KERNEL_PROBE)
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
            "ebpf",
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
    fn test_parse_probe_line() {
        assert_eq!(
            parse_probe_line("@syscalls[4242]: 17"),
            Some(ProbeRecord::Counter { map: "syscalls".into(), pid: 4242, value: 17 })
        );
        assert_eq!(parse_probe_line("Lost 12 events"), Some(ProbeRecord::Lost(12)));
        assert_eq!(parse_probe_line("Attaching 18 probes..."), None);
        assert_eq!(parse_probe_line("@bio_start[8, 1234]: 99"), None);
        assert_eq!(parse_probe_line(""), None);
    }

    #[test]
    fn test_table_scoping() {
        let mut table = ProbeTable::default();
        for line in ["@cycles[10]: 2000000", "@cycles[10]: 1000000", "@syscalls[11]: 5", "Lost 3 events"] {
            table.apply(parse_probe_line(line).unwrap());
        }
        assert_eq!(table.records, 4);
        assert_eq!(table.lost_events, 3);

        let (own, scope) = table.scoped_counters(10);
        assert_eq!(scope, "process");
        assert_eq!(own.cpu_cycles, 3_000_000);
        assert_eq!(own.syscall_count, 0);

        let (all, scope) = table.scoped_counters(99);
        assert_eq!(scope, "system");
        assert_eq!(all.cpu_cycles, 3_000_000);
        assert_eq!(all.syscall_count, 5);
    }

    #[test]
    fn test_reading_derived_metrics() {
        let mut table = ProbeTable::default();
        table.processes.insert(
            7,
            ProcessCounters {
                cpu_cycles: 1_000,
                instructions: 2_000,
                cache_references: 100,
                cache_misses: 25,
                ..ProcessCounters::default()
            },
        );
        table.energy = Some((4.0, Some(3.0)));
        let reading = reading_from_table(&table, 7, 0.5, false);

        assert_eq!(reading.source, "kernel-probe");
        assert_eq!(reading.metric("pkg"), Some(4.0));
        assert_eq!(reading.metric("core_percentage"), Some(0.75));
        assert_eq!(reading.metric("energy_from_cycles"), Some(1_000.0 * JOULES_PER_CYCLE));
        let perf = &reading.extra["cpu_perf_metrics"];
        assert_eq!(perf["instructions_per_cycle"], 2.0);
        assert_eq!(perf["cache_miss_rate"], 0.25);
        assert_eq!(perf["cpu_cycles_per_second"], 2000.0);
        assert_eq!(perf["CPU_CYCLES:PACKAGE0"], 1000);

        let empty = reading_from_table(&ProbeTable::default(), 7, 0.0, false);
        assert_eq!(empty.extra["cpu_perf_metrics"]["instructions_per_cycle"], 0.0);
        assert_eq!(empty.metric("core_percentage"), Some(0.0));
    }

    #[test]
    fn test_synthesize_table() {
        let table = synthesize_table(5, 2.0);
        let reading = reading_from_table(&table, 5, 2.0, true);
        assert!(reading.synthetic);
        assert_eq!(reading.extra["probe_scope"], "process");
        for key in ["cpu_perf_metrics", "syscall_metrics", "memory_metrics", "network_metrics"] {
            assert!(reading.extra.contains_key(key), "missing {}", key);
        }
        let syscalls = reading.extra["syscall_metrics"]["syscall_count"].as_u64().unwrap();
        assert!((5_000..20_000).contains(&syscalls));
        let pkg = reading.metric("pkg").unwrap();
        assert!(pkg > 0.0 && pkg < 125.0 * 2.0);
    }

    #[test]
    fn test_probe_script() {
        let script = probe_script(250);
        assert!(script.contains("interval:ms:250"));
        assert!(script.contains("print(@ctx_switches);"));
        assert!(script.contains("hardware:cycles:1000000"));
    }

    #[tokio::test]
    async fn test_unavailable_substrate_is_synthetic() {
        let mut config = EnergyConfig::default();
        config.ebpf.bpftrace_path = "bpftrace-that-does-not-exist".to_string();
        let mut monitor = BpfMonitor::new(&MonitorContext::new(std::process::id(), config));

        assert!(monitor.start().await);
        monitor.stop().await;
        let first = monitor.get_energy_data();
        assert_eq!(first.source, "kernel-probe");
        assert!(first.synthetic);
        assert!(first.duration >= 0.0);
        assert_eq!(first, monitor.get_energy_data());
    }

    #[test]
    fn test_every_printed_map_has_a_counter() {
        let script = probe_script(100);
        let printed: Vec<&str> = script
            .match_indices("print(@")
            .filter_map(|(at, _)| script[at + 7..].split(')').next())
            .collect();
        assert_eq!(printed.len(), 18);
        assert!(printed.contains(&"major_faults"));
        let mut counters = ProcessCounters::default();
        for map in printed {
            assert!(counters.field_mut(map).is_some(), "no counter for @{}", map);
        }

        let mut table = ProbeTable::default();
        table.apply(parse_probe_line("@major_faults[42]: 3").unwrap());
        assert_eq!(table.processes[&42].major_page_faults, 3);
    }

    #[test]
    fn test_substrate_status_names_user() {
        if is_root() {
            return;
        }
        let reason = substrate_status(&ProbeOptions::default()).unwrap_err();
        assert!(reason.contains(&effective_username()));
    }

    #[tokio::test]
    async fn test_listener_sees_lifecycle() {
        use crate::collectors::dummy::RecordingObserver;
        use EventKind::{Data, Log, Start, Stop};

        let dir = tempfile::tempdir().unwrap();
        let mut config = EnergyConfig::default();
        config.ebpf.bpftrace_path = "bpftrace-that-does-not-exist".to_string();
        config.output_dir = Some(dir.path().to_path_buf());
        config.fallback_dir = Some(dir.path().join("fallback"));
        let mut monitor = BpfMonitor::new(&MonitorContext::new(std::process::id(), config));
        let recorder = Arc::new(RecordingObserver::default());
        monitor.attach(recorder.clone());

        assert!(monitor.start().await);
        monitor.stop().await;
        assert_eq!(recorder.from_monitor("ebpf"), vec![Start, Stop, Data]);

        let reading = monitor.get_energy_data();
        monitor.get_energy_data();
        assert_eq!(recorder.kinds(), vec![Start, Stop, Data]);

        monitor.log_energy_data(&reading, &TaskContext::new("job", "9"), &CpuInfo::default(), Some("f"));
        assert_eq!(recorder.kinds(), vec![Start, Stop, Data, Log]);
        assert!(dir.path().join("job_9_ebpf.json").exists());
    }
}
