use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the current monotonic-enough millisecond timestamp used for
/// window/commit scheduling math. Injected so tests can drive the run
/// loop without sleeping real wall-clock time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
