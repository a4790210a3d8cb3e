use log::warn;
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MINIMUM_CPU_UPDATE_INTERVAL, Pid, ProcessesToUpdate, RefreshKind, System};
use users::{Users, UsersCache};

/// Login name of the effective user, or the numeric uid when it has no passwd entry.
pub fn effective_username() -> String {
    let uid = users::get_effective_uid();
    UsersCache::new()
        .get_user_by_uid(uid)
        .map(|user| user.name().to_string_lossy().into_owned())
        .unwrap_or_else(|| uid.to_string())
}

pub fn is_root() -> bool {
    users::get_effective_uid() == 0
}

/// Whether `name` resolves to an executable on `PATH`.
pub fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Kernel release string, e.g. `6.5.0-14-generic`.
pub fn kernel_release() -> Option<String> {
    System::kernel_version()
}

/// Checks `/boot/config-<release>` for BPF support.
/// Returns `None` when the config file cannot be read, which is common in containers.
pub fn kernel_supports_bpf() -> Option<bool> {
    let release = kernel_release()?;
    let path = Path::new("/boot").join(format!("config-{}", release));
    let contents = std::fs::read_to_string(path).ok()?;
    Some(kernel_config_enables_bpf(&contents))
}

pub fn kernel_config_enables_bpf(contents: &str) -> bool {
    let enabled = |key: &str| {
        contents
            .lines()
            .map(str::trim)
            .any(|line| line.strip_prefix(key).is_some_and(|rest| rest == "=y"))
    };
    enabled("CONFIG_BPF") && enabled("CONFIG_BPF_SYSCALL")
}

/// Wall-clock seconds since the epoch with microsecond resolution.
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Fraction of one CPU consumed by `pid` over a short sampling window.
pub async fn process_cpu_fraction(pid: u32) -> Option<f64> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.cpu_usage() as f64 / 100.0)
}

/// Per-CPU utilisation in percent.
pub async fn sample_cpu_usage() -> Vec<f64> {
    let mut system =
        System::new_with_specifics(RefreshKind::nothing().with_cpu(CpuRefreshKind::everything()));
    tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
    system.refresh_cpu_usage();
    system.cpus().iter().map(|cpu| cpu.cpu_usage() as f64).collect()
}

/// User and system CPU seconds consumed by this process so far.
pub fn process_times() -> (f64, f64) {
    // SAFETY: getrusage only writes into the zeroed struct we pass it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return (0.0, 0.0);
    }
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    (seconds(usage.ru_utime), seconds(usage.ru_stime))
}

/// Sends SIGINT so the child can flush its output, then waits up to `timeout`
/// before killing it. Returns the exit status when the child exited on its own.
pub async fn interrupt_and_wait(
    child: &mut tokio::process::Child,
    timeout: Duration,
    label: &str,
) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we spawned and still own.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if rc != 0 {
            warn!("Failed to interrupt {} (pid {}): {}", label, pid, std::io::Error::last_os_error());
        }
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("Failed to wait for {}: {}", label, e);
            None
        }
        Err(_) => {
            warn!("{} did not exit within {:?}, killing it", label, timeout);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", label, e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_config_enables_bpf() {
        let config = "# comment\nCONFIG_BPF=y\nCONFIG_BPF_SYSCALL=y\nCONFIG_BPF_JIT=y\n";
        assert!(kernel_config_enables_bpf(config));

        let partial = "CONFIG_BPF=y\n# CONFIG_BPF_SYSCALL is not set\n";
        assert!(!kernel_config_enables_bpf(partial));

        let module = "CONFIG_BPF=m\nCONFIG_BPF_SYSCALL=y\n";
        assert!(!kernel_config_enables_bpf(module));
    }

    #[test]
    fn test_effective_username() {
        let name = effective_username();
        assert!(!name.is_empty());
        if is_root() {
            assert!(name == "root" || name == "0");
        }
    }

    #[test]
    fn test_now_timestamp() {
        let first = now_timestamp();
        let second = now_timestamp();
        assert!(first > 0.0);
        assert!(second >= first);
    }

    #[test]
    fn test_command_exists_missing() {
        assert!(!command_exists("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn test_interrupt_and_wait() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let started = std::time::Instant::now();
        interrupt_and_wait(&mut child, Duration::from_secs(5), "sleep").await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_process_times() {
        let (user, system) = process_times();
        assert!(user >= 0.0);
        assert!(system >= 0.0);
    }
}
