use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_RAPL_PATH: &str = "/sys/class/powercap/intel-rapl";
/// powercap counters are in microjoules
pub const MICROJOULES_TO_JOULES: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct RaplZone {
    pub name: String,
    pub energy_path: PathBuf,
    pub max_range_uj: u64,
}

impl RaplZone {
    fn load(dir: &Path) -> Option<Self> {
        let energy_path = dir.join("energy_uj");
        if !energy_path.exists() {
            return None;
        }
        let name = read_trimmed(&dir.join("name")).unwrap_or_else(|| "unknown".to_string());
        let max_range_uj = read_trimmed(&dir.join("max_energy_range_uj"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(u64::MAX);
        Some(Self { name, energy_path, max_range_uj })
    }

    pub fn read_uj(&self) -> Option<u64> {
        read_trimmed(&self.energy_path).and_then(|v| v.parse().ok())
    }
}

/// Raw counter values from one read of the package and core zones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaplSample {
    pub package_uj: u64,
    pub core_uj: Option<u64>,
}

/// Reader for the powercap RAPL energy registers of the first CPU package.
#[derive(Debug, Clone)]
pub struct Rapl {
    pub rapl_path: PathBuf,
    package: Option<RaplZone>,
    core: Option<RaplZone>,
}

impl Rapl {
    pub fn new(rapl_path: Option<PathBuf>) -> Self {
        let rapl_path = rapl_path.unwrap_or_else(|| PathBuf::from(DEFAULT_RAPL_PATH));
        let package = RaplZone::load(&rapl_path).or_else(|| find_zone(&rapl_path, "package"));
        let core = package
            .as_ref()
            .and_then(|zone| zone.energy_path.parent().map(Path::to_path_buf))
            .and_then(|dir| find_zone(&dir, "core"));
        match &package {
            Some(zone) => info!("RAPL package zone '{}' found under {}", zone.name, rapl_path.display()),
            None => debug!("No RAPL package zone under {}", rapl_path.display()),
        }
        Self { rapl_path, package, core }
    }

    pub fn is_available(&self) -> bool {
        self.package.as_ref().is_some_and(|zone| zone.read_uj().is_some())
    }

    pub fn read(&self) -> Option<RaplSample> {
        let package_uj = self.package.as_ref()?.read_uj()?;
        let core_uj = self.core.as_ref().and_then(RaplZone::read_uj);
        Some(RaplSample { package_uj, core_uj })
    }

    /// Joules consumed between two samples as `(package, cores)`.
    pub fn energy_between(&self, first: &RaplSample, last: &RaplSample) -> (f64, Option<f64>) {
        let package_max = self.package.as_ref().map_or(u64::MAX, |z| z.max_range_uj);
        let package = rapl_delta_uj(first.package_uj, last.package_uj, package_max) as f64
            * MICROJOULES_TO_JOULES;
        let cores = match (first.core_uj, last.core_uj, &self.core) {
            (Some(a), Some(b), Some(zone)) => {
                Some(rapl_delta_uj(a, b, zone.max_range_uj) as f64 * MICROJOULES_TO_JOULES)
            }
            _ => None,
        };
        (package, cores)
    }
}

impl Default for Rapl {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Counter delta accounting for a single wraparound at `max_range`.
pub fn rapl_delta_uj(start: u64, end: u64, max_range: u64) -> u64 {
    if end >= start {
        end - start
    } else {
        max_range.saturating_sub(start).saturating_add(end)
    }
}

fn find_zone(dir: &Path, prefix: &str) -> Option<RaplZone> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("intel-rapl:"))
        })
        .collect();
    entries.sort();
    entries
        .iter()
        .filter_map(|path| RaplZone::load(path))
        .find(|zone| zone.name.starts_with(prefix))
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
