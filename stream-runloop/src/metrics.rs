use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Container-wide counters, recorded both locally (for tests to assert
/// against) and through the `metrics` facade crate, the same pattern
/// `common-metrics`'s `inc`/`gauge`/`histogram` helpers use.
#[derive(Default)]
pub struct ContainerMetrics {
    envelopes: AtomicU64,
    processes: AtomicU64,
}

impl ContainerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> u64 {
        self.envelopes.load(Ordering::Relaxed)
    }

    pub fn processes(&self) -> u64 {
        self.processes.load(Ordering::Relaxed)
    }

    pub(crate) fn record_envelope(&self) {
        self.envelopes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("runloop_envelopes_total").increment(1);
    }

    pub(crate) fn record_process(&self) {
        self.processes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("runloop_processes_total").increment(1);
    }

    pub(crate) fn record_idle(&self, duration: Duration) {
        metrics::histogram!("runloop_idle_ms").record(duration.as_millis() as f64);
    }

    pub(crate) fn record_dropped_envelope(&self) {
        metrics::counter!("runloop_envelopes_dropped_total").increment(1);
    }
}
