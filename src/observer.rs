use log::{debug, error};
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Lifecycle events published by every monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Stop,
    Data,
    Log,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Data => "data",
            EventKind::Log => "log",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A listener supplied by the caller. Listeners outlive the monitors they observe.
pub trait EnergyObserver: Send + Sync {
    fn update(&self, event: EventKind, payload: &Value) -> Result<(), String>;
}

/// Ordered, duplicate-free list of listeners owned by a single monitor.
#[derive(Default, Clone)]
pub struct EnergySubject {
    observers: Vec<Arc<dyn EnergyObserver>>,
}

fn same_observer(a: &Arc<dyn EnergyObserver>, b: &Arc<dyn EnergyObserver>) -> bool {
    // Compare data pointers only; vtable pointers are not unique across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl EnergySubject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, observer: Arc<dyn EnergyObserver>) {
        if !self.observers.iter().any(|o| same_observer(o, &observer)) {
            self.observers.push(observer);
        }
    }

    pub fn detach(&mut self, observer: &Arc<dyn EnergyObserver>) {
        self.observers.retain(|o| !same_observer(o, observer));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Delivers `event` to every listener in subscription order.
    /// A listener that errors or panics is logged and skipped; the return value
    /// is the number of listeners that failed.
    pub fn notify(&self, event: EventKind, payload: &Value) -> usize {
        let mut failures = 0;
        for (index, observer) in self.observers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| observer.update(event, payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("Observer #{} failed on '{}' event: {}", index, event, e);
                }
                Err(_) => {
                    failures += 1;
                    error!("Observer #{} panicked on '{}' event", index, event);
                }
            }
        }
        failures
    }
}

/// Forwards every event to the `log` facade.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl EnergyObserver for LoggingObserver {
    fn update(&self, event: EventKind, payload: &Value) -> Result<(), String> {
        debug!("energy event '{}': {}", event, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(EventKind, Value)>>,
    }

    impl EnergyObserver for Recorder {
        fn update(&self, event: EventKind, payload: &Value) -> Result<(), String> {
            self.seen.lock().unwrap().push((event, payload.clone()));
            Ok(())
        }
    }

    struct Failing;

    impl EnergyObserver for Failing {
        fn update(&self, _event: EventKind, _payload: &Value) -> Result<(), String> {
            Err("listener refused".to_string())
        }
    }

    struct Panicking;

    impl EnergyObserver for Panicking {
        fn update(&self, _event: EventKind, _payload: &Value) -> Result<(), String> {
            panic!("listener exploded");
        }
    }

    #[test]
    fn test_attach_is_idempotent() {
        let mut subject = EnergySubject::new();
        let recorder: Arc<dyn EnergyObserver> = Arc::new(Recorder::default());
        subject.attach(recorder.clone());
        subject.attach(recorder.clone());
        assert_eq!(subject.len(), 1);
    }

    #[test]
    fn test_detach_missing_listener() {
        let mut subject = EnergySubject::new();
        let attached: Arc<dyn EnergyObserver> = Arc::new(Recorder::default());
        let stranger: Arc<dyn EnergyObserver> = Arc::new(Recorder::default());
        subject.attach(attached.clone());
        subject.detach(&stranger);
        assert_eq!(subject.len(), 1);
        subject.detach(&attached);
        assert!(subject.is_empty());
    }

    #[test]
    fn test_notify_isolates_failures() {
        let mut subject = EnergySubject::new();
        let recorder = Arc::new(Recorder::default());
        subject.attach(Arc::new(Failing));
        subject.attach(Arc::new(Panicking));
        subject.attach(recorder.clone());

        let failures = subject.notify(EventKind::Start, &json!({"monitor": "perf"}));
        assert_eq!(failures, 2);

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, EventKind::Start);
        assert_eq!(seen[0].1["monitor"], "perf");
    }

    #[test]
    fn test_notify_order() {
        struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl EnergyObserver for Tagged {
            fn update(&self, _event: EventKind, _payload: &Value) -> Result<(), String> {
                self.1.lock().unwrap().push(self.0);
                Ok(())
            }
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut subject = EnergySubject::new();
        subject.attach(Arc::new(Tagged("first", order.clone())));
        subject.attach(Arc::new(Tagged("second", order.clone())));
        subject.notify(EventKind::Log, &Value::Null);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
