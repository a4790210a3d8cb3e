use crate::collectors::bpf::BpfMonitor;
use crate::collectors::ipmi::IpmiMonitor;
use crate::collectors::null::NullMonitor;
use crate::collectors::perf::PerfMonitor;
use crate::composite::CompositeMonitor;
use crate::config::StrategyRequest;
use crate::energy_monitor::{EnergyMonitor, MonitorContext};
use crate::utils::errors::MonitoringError;
use crate::utils::psutils::is_root;
use log::{info, warn};
use std::sync::Arc;

pub const NULL_STRATEGY: &str = "noop";
pub const PROBE_STRATEGY: &str = "ebpf";
/// Preference order used for `auto`.
pub const AUTO_ORDER: [&str; 3] = ["ebpf", "ipmi", "perf"];

pub type MonitorConstructor =
    Arc<dyn Fn(&MonitorContext) -> Result<Box<dyn EnergyMonitor>, MonitoringError> + Send + Sync>;

/// Strategy name to constructor table. Built once while wiring the worker,
/// then shared read-only.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    entries: Vec<(String, MonitorConstructor)>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("perf", |ctx| Ok(Box::new(PerfMonitor::new(ctx)) as Box<dyn EnergyMonitor>));
        registry.register("ebpf", |ctx| Ok(Box::new(BpfMonitor::new(ctx)) as Box<dyn EnergyMonitor>));
        registry.register("ipmi", |ctx| Ok(Box::new(IpmiMonitor::new(ctx)) as Box<dyn EnergyMonitor>));
        registry.register(NULL_STRATEGY, |_| Ok(Box::new(NullMonitor::new()) as Box<dyn EnergyMonitor>));
        registry
    }

    /// Adds a strategy, replacing any earlier registration of the same name.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&MonitorContext) -> Result<Box<dyn EnergyMonitor>, MonitoringError> + Send + Sync + 'static,
    {
        let constructor: MonitorConstructor = Arc::new(constructor);
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = constructor,
            None => self.entries.push((name.to_string(), constructor)),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn create(&self, name: &str, context: &MonitorContext) -> Result<Box<dyn EnergyMonitor>, MonitoringError> {
        let (_, constructor) = self
            .entries
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| MonitoringError::UnknownStrategy(name.to_string()))?;
        constructor(context)
    }
}

/// Turns a strategy request into a ready-to-use monitor.
#[derive(Clone)]
pub struct MonitorFactory {
    registry: Arc<StrategyRegistry>,
    privileged: fn() -> bool,
}

impl MonitorFactory {
    pub fn new(registry: StrategyRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            privileged: is_root,
        }
    }

    /// Overrides the root check deciding whether the probe strategy gets a trial run.
    pub fn with_privilege_check(mut self, privileged: fn() -> bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Ordered candidate names for `request`.
    pub fn resolve_candidates(&self, request: &StrategyRequest) -> Vec<String> {
        match request {
            StrategyRequest::Auto => AUTO_ORDER.iter().map(|s| s.to_string()).collect(),
            StrategyRequest::All => self
                .registry
                .names()
                .into_iter()
                .filter(|n| *n != NULL_STRATEGY)
                .map(str::to_string)
                .collect(),
            StrategyRequest::Named(name) => vec![name.clone()],
            StrategyRequest::List(names) => names.clone(),
        }
    }

    /// Instantiates and trial-starts each candidate, keeping fresh instances of the
    /// ones that worked. Falls back to the null monitor when none did.
    pub async fn create_monitor(
        &self,
        request: &StrategyRequest,
        context: &MonitorContext,
    ) -> Box<dyn EnergyMonitor> {
        if !context.config.energy {
            info!("Energy monitoring disabled by configuration");
            return Box::new(NullMonitor::new());
        }

        let mut monitors: Vec<Box<dyn EnergyMonitor>> = Vec::new();
        for name in self.resolve_candidates(request) {
            match self.validate(&name, context).await {
                Ok(monitor) => monitors.push(monitor),
                Err(e) => warn!("Dropping energy strategy '{}': {}", name, e),
            }
        }

        match monitors.len() {
            0 => {
                warn!("No energy strategy available, monitoring disabled");
                Box::new(NullMonitor::new())
            }
            1 => {
                let monitor = monitors.remove(0);
                info!("Using energy strategy '{}'", monitor.name());
                monitor
            }
            _ => {
                let names: Vec<&str> = monitors.iter().map(|m| m.name()).collect();
                info!("Using composite of energy strategies {:?}", names);
                Box::new(CompositeMonitor::new(
                    context.process_id,
                    Arc::clone(&context.config),
                    monitors,
                ))
            }
        }
    }

    async fn validate(&self, name: &str, context: &MonitorContext) -> Result<Box<dyn EnergyMonitor>, MonitoringError> {
        let mut trial = self.registry.create(name, context)?;

        // Without root the probe strategy can only produce synthetic data; keep it untested.
        if name == PROBE_STRATEGY && !(self.privileged)() {
            return Ok(trial);
        }

        if !trial.start().await {
            return Err(MonitoringError::SubstrateUnavailable(format!("{} failed its trial start", name)));
        }
        trial.stop().await;
        self.registry.create(name, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::dummy::DummyMonitor;
    use crate::config::EnergyConfig;
    use crate::energy_monitor::MonitorState;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_of(spec: &[(&'static str, bool)], starts: Arc<AtomicUsize>) -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        for &(name, ok) in spec {
            let starts = starts.clone();
            registry.register(name, move |_| {
                Ok(Box::new(
                    DummyMonitor::new(name, ok)
                        .with_metric("pkg", 1.0)
                        .with_counters(starts.clone(), Arc::new(Mutex::new(Vec::new()))),
                ) as Box<dyn EnergyMonitor>)
            });
        }
        registry.register(NULL_STRATEGY, |_| Ok(Box::new(NullMonitor::new()) as Box<dyn EnergyMonitor>));
        registry
    }

    fn context() -> MonitorContext {
        MonitorContext::new(1, EnergyConfig::default())
    }

    #[test]
    fn test_resolve_candidates() {
        let factory = MonitorFactory::new(StrategyRegistry::with_defaults());
        assert_eq!(factory.resolve_candidates(&StrategyRequest::Auto), vec!["ebpf", "ipmi", "perf"]);
        assert_eq!(factory.resolve_candidates(&StrategyRequest::All), vec!["perf", "ebpf", "ipmi"]);
        assert_eq!(factory.resolve_candidates(&StrategyRequest::Named("ipmi".into())), vec!["ipmi"]);
        assert_eq!(
            factory.resolve_candidates(&StrategyRequest::List(vec!["perf".into(), "perf".into()])),
            vec!["perf", "perf"]
        );
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = StrategyRegistry::new();
        registry.register("x", |_| Ok(Box::new(DummyMonitor::new("first", true)) as Box<dyn EnergyMonitor>));
        registry.register("x", |_| Ok(Box::new(DummyMonitor::new("second", true)) as Box<dyn EnergyMonitor>));
        assert_eq!(registry.names(), vec!["x"]);
        let monitor = registry.create("x", &context()).unwrap();
        assert_eq!(monitor.name(), "second");
        assert!(matches!(registry.create("y", &context()), Err(MonitoringError::UnknownStrategy(_))));
    }

    #[tokio::test]
    async fn test_disabled_returns_null() {
        let starts = Arc::new(AtomicUsize::new(0));
        let factory = MonitorFactory::new(registry_of(&[("perf", true)], starts.clone()));
        let context = MonitorContext::new(1, EnergyConfig::disabled());
        let monitor = factory.create_monitor(&StrategyRequest::All, &context).await;
        assert_eq!(monitor.name(), "noop");
        assert_eq!(starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auto_with_nothing_available() {
        let starts = Arc::new(AtomicUsize::new(0));
        let registry = registry_of(&[("ebpf", false), ("ipmi", false), ("perf", false)], starts.clone());
        let factory = MonitorFactory::new(registry).with_privilege_check(|| true);

        let mut monitor = factory.create_monitor(&StrategyRequest::Auto, &context()).await;
        assert_eq!(starts.load(Ordering::SeqCst), 3);
        assert!(monitor.start().await);
        monitor.stop().await;
        assert_eq!(monitor.get_energy_data().source, "disabled");
    }

    #[tokio::test]
    async fn test_single_survivor_is_not_wrapped() {
        let starts = Arc::new(AtomicUsize::new(0));
        let registry = registry_of(&[("x", false), ("y", true)], starts.clone());
        let factory = MonitorFactory::new(registry);

        let request = StrategyRequest::List(vec!["x".into(), "y".into()]);
        let monitor = factory.create_monitor(&request, &context()).await;
        assert_eq!(monitor.name(), "y");
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_multiple_survivors_make_composite() {
        let starts = Arc::new(AtomicUsize::new(0));
        let registry = registry_of(&[("a", true), ("b", true), ("c", false)], starts.clone());
        let factory = MonitorFactory::new(registry);

        let mut monitor = factory.create_monitor(&StrategyRequest::All, &context()).await;
        assert_eq!(monitor.name(), "composite");
        assert!(monitor.start().await);
        monitor.stop().await;
        assert_eq!(monitor.artifact_names(), vec!["a", "b", "composite"]);
    }

    #[tokio::test]
    async fn test_unknown_strategy_dropped() {
        let starts = Arc::new(AtomicUsize::new(0));
        let factory = MonitorFactory::new(registry_of(&[("perf", true)], starts));
        let request = StrategyRequest::List(vec!["gpu".into(), "perf".into()]);
        let monitor = factory.create_monitor(&request, &context()).await;
        assert_eq!(monitor.name(), "perf");
    }

    #[tokio::test]
    async fn test_probe_kept_without_root() {
        let starts = Arc::new(AtomicUsize::new(0));
        let registry = registry_of(&[("ebpf", false)], starts.clone());
        let factory = MonitorFactory::new(registry).with_privilege_check(|| false);

        let monitor = factory
            .create_monitor(&StrategyRequest::Named("ebpf".into()), &context())
            .await;
        assert_eq!(monitor.name(), "ebpf");
        assert_eq!(starts.load(Ordering::SeqCst), 0);
    }
}
