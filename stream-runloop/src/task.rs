use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::callback::CallbackFactory;
use crate::coordinator::Coordinator;
use crate::envelope::Envelope;
use crate::error::TaskError;
use crate::offset_manager::OffsetManager;
use crate::partition::PartitionId;

/// Per-task gauges and counters, mirroring the container metrics surface
/// a task advertises through `metrics()`.
#[derive(Default)]
pub struct TaskMetrics {
    messages_in_flight: AtomicI64,
    async_callback_completed: AtomicU64,
}

impl TaskMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages_in_flight(&self) -> i64 {
        self.messages_in_flight.load(Ordering::Relaxed)
    }

    pub fn async_callback_completed(&self) -> u64 {
        self.async_callback_completed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_flight(&self, task_name: &str, value: i64) {
        self.messages_in_flight.store(value, Ordering::Relaxed);
        metrics::gauge!("runloop_task_messages_in_flight", "task" => task_name.to_string())
            .set(value as f64);
    }

    pub(crate) fn record_callback_completed(&self, task_name: &str) {
        self.async_callback_completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("runloop_task_async_callback_completed_total", "task" => task_name.to_string())
            .increment(1);
    }
}

/// The capability set the run loop drives for a single task. Implemented
/// by the task's own business logic; test doubles implement it directly
/// to script scenarios without a real consumer mux.
#[async_trait]
pub trait TaskHandle: Send + Sync {
    fn task_name(&self) -> &str;

    /// The partitions (including key buckets, when elasticity is on)
    /// this task owns.
    fn system_stream_partitions(&self) -> &HashSet<PartitionId>;

    fn is_windowable_task(&self) -> bool {
        false
    }

    fn offset_manager(&self) -> Arc<dyn OffsetManager>;

    fn metrics(&self) -> Arc<TaskMetrics>;

    /// Dispatched synchronously by the run loop; the task must eventually
    /// call exactly one of `callback_factory.create().complete()` or
    /// `.failure(err)`, from this call or from another thread, to signal
    /// completion. Returning from `process` does not itself signal
    /// anything — only the callback does.
    async fn process(&self, envelope: Envelope, coordinator: Coordinator, callback_factory: CallbackFactory);

    /// Fired roughly every `windowMs` for windowable tasks, only while
    /// the task has no in-flight messages.
    async fn window(&self, _coordinator: Coordinator) -> Result<(), TaskError> {
        Ok(())
    }

    /// Snapshots and durably records offsets. Invoked only while the task
    /// has zero in-flight messages, unless async-commit mode is enabled.
    async fn commit(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Invoked at most once, after every prior callback for this task has
    /// completed and every owned partition has seen end-of-stream.
    async fn end_of_stream(&self, _coordinator: Coordinator) -> Result<(), TaskError> {
        Ok(())
    }
}
