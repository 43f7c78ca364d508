use std::collections::HashSet;
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::error::RunLoopError;
use crate::partition::PartitionId;
use crate::pending_queue::PendingEnvelopeQueue;
use crate::task::TaskHandle;

/// A task's position in its lifecycle. `Failed` is reachable from any of
/// the other three and is terminal, just like `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Draining,
    Finished,
    Failed,
}

/// Per-task state the run loop drives: the pending queue and in-flight
/// count, end-of-stream bookkeeping, and the flags a coordinator sets.
pub struct TaskWorker {
    pub name: String,
    pub task: Arc<dyn TaskHandle>,
    partitions: HashSet<PartitionId>,
    queue: PendingEnvelopeQueue,
    eos_seen: HashSet<PartitionId>,
    pub(crate) eos_delivered: bool,
    pub(crate) end_of_stream_in_flight: bool,
    pub(crate) window_in_flight: bool,
    pub(crate) commit_in_flight: bool,
    pub(crate) shutdown_requested: bool,
    pub(crate) commit_requested: bool,
    state: WorkerState,
    last_window_at: i64,
    last_commit_at: i64,
    next_dispatch_id: u64,
    pub(crate) failure: Option<RunLoopError>,
}

impl TaskWorker {
    pub fn new(task: Arc<dyn TaskHandle>, max_messages_in_flight: usize, now_ms: i64) -> Self {
        let partitions = task.system_stream_partitions().clone();
        Self {
            name: task.task_name().to_string(),
            task,
            partitions,
            queue: PendingEnvelopeQueue::new(max_messages_in_flight),
            eos_seen: HashSet::new(),
            eos_delivered: false,
            end_of_stream_in_flight: false,
            window_in_flight: false,
            commit_in_flight: false,
            shutdown_requested: false,
            commit_requested: false,
            state: WorkerState::Running,
            last_window_at: now_ms,
            last_commit_at: now_ms,
            next_dispatch_id: 0,
            failure: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    /// True if `effective` is one of the specific (possibly bucketed)
    /// partitions this task owns.
    pub fn owns(&self, effective: &PartitionId) -> bool {
        self.partitions.contains(effective)
    }

    /// True if this task owns any key bucket of the given raw partition.
    pub fn owns_raw_partition(&self, raw: &PartitionId) -> bool {
        self.partitions.iter().any(|p| p.same_raw_partition(raw))
    }

    /// Every owned partition matching `raw`'s (system, stream, partition)
    /// triple, ignoring bucket.
    pub fn owned_buckets_of(&self, raw: &PartitionId) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|p| p.same_raw_partition(raw))
            .cloned()
            .collect()
    }

    pub fn enqueue(&mut self, envelope: Envelope) {
        self.queue.push(envelope);
    }

    pub fn mark_end_of_stream_seen(&mut self, partition: PartitionId) {
        self.eos_seen.insert(partition);
    }

    fn all_owned_partitions_seen_eos(&self) -> bool {
        !self.partitions.is_empty() && self.partitions.iter().all(|p| self.eos_seen.contains(p))
    }

    /// Pops every envelope capacity currently allows, each tagged with a
    /// fresh dispatch id. Dispatches nothing once the worker has left
    /// `Running` (draining tasks do not accept new `process` dispatches;
    /// any envelope fanned to them before they started draining was
    /// already enqueued).
    pub fn drain_ready(&mut self) -> Vec<(u64, Envelope)> {
        if self.state != WorkerState::Running {
            return Vec::new();
        }
        let mut dispatched = Vec::new();
        while let Some(envelope) = self.queue.try_pop() {
            let dispatch_id = self.next_dispatch_id;
            self.next_dispatch_id += 1;
            dispatched.push((dispatch_id, envelope));
        }
        dispatched
    }

    pub fn record_process_complete(&mut self) {
        self.queue.complete_one();
    }

    pub fn fail(&mut self, error: RunLoopError) {
        if self.state != WorkerState::Failed {
            self.state = WorkerState::Failed;
            self.failure = Some(error);
        }
    }

    /// Re-evaluates Running -> Draining -> Finished transitions that do
    /// not require an async call (those are driven by the run loop
    /// directly: dispatching `endOfStream`, then transitioning once it
    /// and any requested commit complete).
    ///
    /// A shutdown request only finishes the worker once any commit it
    /// also requested has been dispatched and has completed, mirroring
    /// the end-of-stream rule that a requested commit runs before the
    /// transition to `Finished`.
    pub fn advance(&mut self) {
        if self.state == WorkerState::Failed {
            return;
        }

        if self.shutdown_requested
            && self.queue.is_empty()
            && self.queue.in_flight() == 0
            && !self.commit_requested
            && !self.commit_in_flight
        {
            self.state = WorkerState::Finished;
            return;
        }

        if self.state == WorkerState::Running && self.queue.is_empty() && self.all_owned_partitions_seen_eos() {
            self.state = WorkerState::Draining;
        }
    }

    pub fn ready_for_end_of_stream(&self) -> bool {
        self.state == WorkerState::Draining
            && self.queue.in_flight() == 0
            && !self.eos_delivered
            && !self.end_of_stream_in_flight
    }

    pub fn finish_after_end_of_stream(&mut self) {
        self.eos_delivered = true;
        self.end_of_stream_in_flight = false;
        self.state = WorkerState::Finished;
    }

    pub fn is_windowable(&self) -> bool {
        self.task.is_windowable_task()
    }

    pub fn ready_for_window(&self, now_ms: i64, window_ms: i64) -> bool {
        window_ms > 0
            && self.is_windowable()
            && self.state == WorkerState::Running
            && self.queue.in_flight() == 0
            && !self.window_in_flight
            && now_ms - self.last_window_at >= window_ms
    }

    pub fn mark_window_dispatched(&mut self, now_ms: i64) {
        self.last_window_at = now_ms;
        self.window_in_flight = true;
    }

    pub fn ready_for_periodic_commit(&self, now_ms: i64, commit_ms: i64, async_commit_enabled: bool) -> bool {
        commit_ms > 0
            && matches!(self.state, WorkerState::Running | WorkerState::Draining)
            && !self.commit_in_flight
            && (async_commit_enabled || self.queue.in_flight() == 0)
            && now_ms - self.last_commit_at >= commit_ms
    }

    pub fn ready_for_requested_commit(&self, async_commit_enabled: bool) -> bool {
        self.commit_requested
            && matches!(self.state, WorkerState::Running | WorkerState::Draining)
            && !self.commit_in_flight
            && (async_commit_enabled || self.queue.in_flight() == 0)
    }

    pub fn mark_commit_dispatched(&mut self, now_ms: i64) {
        self.last_commit_at = now_ms;
        self.commit_in_flight = true;
        self.commit_requested = false;
    }

    pub fn next_timer_deadline(&self, window_ms: i64, commit_ms: i64) -> Option<i64> {
        let mut deadline = None;
        if window_ms > 0 && self.is_windowable() && self.state == WorkerState::Running {
            deadline = Some(self.last_window_at + window_ms);
        }
        if commit_ms > 0 {
            let candidate = self.last_commit_at + commit_ms;
            deadline = Some(deadline.map_or(candidate, |d: i64| d.min(candidate)));
        }
        deadline
    }
}
