use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::{debug, error, info};

use crate::callback::{CallbackFactory, CallbackOutcome};
use crate::clock::Clock;
use crate::config::RunLoopConfig;
use crate::consumer_mux::ConsumerMux;
use crate::coordinator::{Coordinator, CoordinatorRequests};
use crate::elasticity;
use crate::envelope::Envelope;
use crate::error::{RunLoopError, TaskError};
use crate::metrics::ContainerMetrics;
use crate::partition::PartitionId;
use crate::task::TaskHandle;
use crate::task_worker::{TaskWorker, WorkerState};

type Events = FuturesUnordered<BoxFuture<'static, WorkerEvent>>;

/// Outcome of a single `process` dispatch's callback, distinguishing the
/// ways it can resolve so the run loop can pick the right fatal error
/// variant.
enum ProcessOutcome {
    Complete,
    Failure(TaskError),
    Timeout,
    Dropped,
}

enum WorkerEvent {
    Process {
        task: String,
        partition: PartitionId,
        offset: Option<String>,
        outcome: ProcessOutcome,
        requests: CoordinatorRequests,
    },
    Window {
        task: String,
        result: Result<(), TaskError>,
        requests: CoordinatorRequests,
    },
    Commit {
        task: String,
        result: Result<(), TaskError>,
    },
    EndOfStream {
        task: String,
        result: Result<(), TaskError>,
        commit_result: Result<(), TaskError>,
        requests: CoordinatorRequests,
    },
}

/// The central per-container scheduler: pulls from the consumer mux,
/// routes through elasticity, dispatches to the owning [`TaskWorker`],
/// and fires window/commit timers, until every worker reaches `Finished`
/// or any worker reaches `Failed`.
pub struct RunLoop {
    workers: HashMap<String, TaskWorker>,
    consumer_mux: Arc<dyn ConsumerMux>,
    config: RunLoopConfig,
    metrics: Arc<ContainerMetrics>,
    clock: Arc<dyn Clock>,
}

impl RunLoop {
    pub fn new(
        tasks: Vec<Arc<dyn TaskHandle>>,
        consumer_mux: Arc<dyn ConsumerMux>,
        config: RunLoopConfig,
        metrics: Arc<ContainerMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        let workers = tasks
            .into_iter()
            .map(|task| {
                let name = task.task_name().to_string();
                info!(
                    task = %name,
                    partitions = task.system_stream_partitions().len(),
                    "registering task worker"
                );
                (name, TaskWorker::new(task, config.max_messages_in_flight, now))
            })
            .collect();

        Self {
            workers,
            consumer_mux,
            config,
            metrics,
            clock,
        }
    }

    /// Runs until shutdown consensus is reached or a task fails.
    pub async fn run(mut self) -> Result<(), RunLoopError> {
        info!(tasks = self.workers.len(), "run loop starting");
        let mut events: Events = FuturesUnordered::new();

        loop {
            self.dispatch_ready_processes(&mut events);
            self.evaluate_transitions(&mut events);

            if let Some(err) = self.take_first_failure() {
                error!(error = %err, "run loop aborting on task failure");
                return Err(err);
            }

            if self.all_finished() {
                info!("all tasks finished, run loop exiting");
                return Ok(());
            }

            self.dispatch_due_timers(&mut events);

            let idle_budget = self.idle_budget();
            let idle_start = Instant::now();
            let mux = self.consumer_mux.clone();

            tokio::select! {
                result = tokio::time::timeout(idle_budget, mux.choose(true)) => {
                    self.metrics.record_idle(idle_start.elapsed());
                    match result {
                        Ok(Ok(Some(envelope))) => {
                            self.metrics.record_envelope();
                            self.route(envelope);
                        }
                        Ok(Ok(None)) => {}
                        Ok(Err(message)) => return Err(RunLoopError::Mux(message)),
                        Err(_elapsed) => {}
                    }
                }
                Some(event) = events.next(), if !events.is_empty() => {
                    self.handle_event(event).await?;
                }
            }
        }
    }

    fn idle_budget(&self) -> Duration {
        let mut ms = self.config.max_idle_ms.max(1) as u64;
        if self.config.max_throttling_delay_ms > 0 {
            ms = ms.min(self.config.max_throttling_delay_ms as u64);
        }
        Duration::from_millis(ms)
    }

    fn take_first_failure(&mut self) -> Option<RunLoopError> {
        self.workers
            .values_mut()
            .find(|w| w.state() == WorkerState::Failed)
            .and_then(|w| w.failure.take())
    }

    fn all_finished(&self) -> bool {
        self.workers.values().all(|w| w.state() == WorkerState::Finished)
    }

    /// Routes a freshly-fetched envelope to the worker(s) it belongs to.
    /// End-of-stream fans out to every worker owning any key bucket of
    /// the raw partition. Watermarks do the same when elasticity is
    /// enabled (broadening the open question in the design notes to
    /// cover watermarks the same way end-of-stream is covered). Ordinary
    /// messages route to the single worker owning the effective,
    /// elasticity-resolved partition.
    fn route(&mut self, envelope: Envelope) {
        if envelope.is_end_of_stream() {
            let raw = envelope.partition.clone();
            for worker in self.workers.values_mut() {
                for bucket in worker.owned_buckets_of(&raw) {
                    worker.mark_end_of_stream_seen(bucket);
                }
            }
            return;
        }

        if envelope.is_watermark() && self.config.elasticity_factor > 1 {
            let raw = envelope.partition.clone();
            let mut delivered = false;
            for worker in self.workers.values_mut() {
                for bucket in worker.owned_buckets_of(&raw) {
                    worker.enqueue(envelope.clone().with_partition(bucket));
                    delivered = true;
                }
            }
            if !delivered {
                debug!(partition = %raw, "dropping watermark for unassigned partition");
                self.metrics.record_dropped_envelope();
            }
            return;
        }

        let effective = elasticity::effective_partition(
            &envelope.partition,
            envelope.key.as_deref(),
            envelope.offset.as_deref(),
            self.config.elasticity_factor,
        );

        match self.workers.values_mut().find(|w| w.owns(&effective)) {
            Some(worker) => worker.enqueue(envelope.with_partition(effective)),
            None => {
                debug!(partition = %effective, "dropping envelope for unassigned partition");
                self.metrics.record_dropped_envelope();
            }
        }
    }

    fn dispatch_ready_processes(&mut self, events: &mut Events) {
        let names: Vec<String> = self.workers.keys().cloned().collect();
        for name in names {
            let dispatched = self.workers.get_mut(&name).unwrap().drain_ready();
            for (_, envelope) in dispatched {
                self.dispatch_process(&name, envelope, events);
            }
            if let Some(worker) = self.workers.get(&name) {
                worker.task.metrics().set_in_flight(&name, worker.in_flight() as i64);
            }
        }
    }

    fn dispatch_process(&mut self, name: &str, envelope: Envelope, events: &mut Events) {
        let worker = self.workers.get(name).expect("worker must exist to dispatch");
        let task = worker.task.clone();
        let coordinator = Coordinator::new(name.to_string());
        let (factory, rx) = CallbackFactory::new();
        let timeout_ms = self.config.callback_timeout_ms;

        let task_name = name.to_string();
        let partition = envelope.partition.clone();
        let offset = envelope.offset.clone();
        let coordinator_for_task = coordinator.clone();

        tokio::spawn(async move {
            task.process(envelope, coordinator_for_task, factory).await;
        });

        let fut = async move {
            let outcome = if timeout_ms > 0 {
                match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), rx).await {
                    Ok(Ok(CallbackOutcome::Complete)) => ProcessOutcome::Complete,
                    Ok(Ok(CallbackOutcome::Failure(err))) => ProcessOutcome::Failure(err),
                    Ok(Err(_recv_error)) => ProcessOutcome::Dropped,
                    Err(_elapsed) => ProcessOutcome::Timeout,
                }
            } else {
                match rx.await {
                    Ok(CallbackOutcome::Complete) => ProcessOutcome::Complete,
                    Ok(CallbackOutcome::Failure(err)) => ProcessOutcome::Failure(err),
                    Err(_recv_error) => ProcessOutcome::Dropped,
                }
            };

            WorkerEvent::Process {
                task: task_name,
                partition,
                offset,
                outcome,
                requests: coordinator.take_requests(),
            }
        };
        events.push(Box::pin(fut));
    }

    fn evaluate_transitions(&mut self, events: &mut Events) {
        let names: Vec<String> = self.workers.keys().cloned().collect();
        for name in &names {
            let worker = self.workers.get_mut(name).unwrap();
            let was_finished = worker.state() == WorkerState::Finished;
            worker.advance();
            if !was_finished && worker.state() == WorkerState::Finished {
                info!(task = %name, "task finished via explicit shutdown");
            }
        }
        for name in &names {
            if self.workers.get(name).unwrap().ready_for_end_of_stream() {
                self.dispatch_end_of_stream(name, events);
            }
        }
    }

    fn dispatch_end_of_stream(&mut self, name: &str, events: &mut Events) {
        let worker = self.workers.get_mut(name).expect("worker must exist");
        worker.end_of_stream_in_flight = true;
        let task = worker.task.clone();
        let task_name = name.to_string();
        let coordinator = Coordinator::new(task_name.clone());
        let coordinator_for_call = coordinator.clone();

        let fut = async move {
            let result = task.end_of_stream(coordinator_for_call).await;
            let requests = coordinator.take_requests();
            let commit_result = if result.is_ok() && requests.wants_commit() {
                task.commit().await
            } else {
                Ok(())
            };
            WorkerEvent::EndOfStream {
                task: task_name,
                result,
                commit_result,
                requests,
            }
        };
        events.push(Box::pin(fut));
    }

    fn dispatch_due_timers(&mut self, events: &mut Events) {
        let now = self.clock.now_ms();
        let names: Vec<String> = self.workers.keys().cloned().collect();

        for name in &names {
            if self.workers.get(name).unwrap().ready_for_window(now, self.config.window_ms) {
                self.dispatch_window(name, events);
            }
        }
        for name in &names {
            let worker = self.workers.get(name).unwrap();
            let due = worker.ready_for_requested_commit(self.config.async_commit_enabled)
                || worker.ready_for_periodic_commit(now, self.config.commit_ms, self.config.async_commit_enabled);
            if due {
                self.dispatch_commit(name, events);
            }
        }
    }

    fn dispatch_window(&mut self, name: &str, events: &mut Events) {
        let now = self.clock.now_ms();
        debug!(task = %name, "firing window");
        let worker = self.workers.get_mut(name).expect("worker must exist");
        worker.mark_window_dispatched(now);
        let task = worker.task.clone();
        let task_name = name.to_string();
        let coordinator = Coordinator::new(task_name.clone());
        let coordinator_for_call = coordinator.clone();

        let fut = async move {
            let result = task.window(coordinator_for_call).await;
            WorkerEvent::Window {
                task: task_name,
                result,
                requests: coordinator.take_requests(),
            }
        };
        events.push(Box::pin(fut));
    }

    fn dispatch_commit(&mut self, name: &str, events: &mut Events) {
        let now = self.clock.now_ms();
        debug!(task = %name, "firing commit");
        let worker = self.workers.get_mut(name).expect("worker must exist");
        worker.mark_commit_dispatched(now);
        let task = worker.task.clone();
        let task_name = name.to_string();

        let fut = async move {
            let result = task.commit().await;
            WorkerEvent::Commit { task: task_name, result }
        };
        events.push(Box::pin(fut));
    }

    fn apply_requests(&mut self, origin: &str, requests: CoordinatorRequests) {
        if requests.commit_current {
            if let Some(w) = self.workers.get_mut(origin) {
                w.commit_requested = true;
            }
        }
        if requests.commit_all {
            for w in self.workers.values_mut() {
                w.commit_requested = true;
            }
        }
        if requests.shutdown_current {
            if let Some(w) = self.workers.get_mut(origin) {
                w.shutdown_requested = true;
            }
        }
        if requests.shutdown_all {
            for w in self.workers.values_mut() {
                w.shutdown_requested = true;
            }
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<(), RunLoopError> {
        match event {
            WorkerEvent::Process {
                task,
                partition,
                offset,
                outcome,
                requests,
            } => {
                if let Some(w) = self.workers.get_mut(&task) {
                    w.record_process_complete();
                }
                self.apply_requests(&task, requests);

                match outcome {
                    ProcessOutcome::Complete => {
                        if let Some(offset) = offset {
                            let (offset_manager, task_name) = {
                                let w = self.workers.get(&task).expect("worker must exist");
                                (w.task.offset_manager(), w.task.task_name().to_string())
                            };
                            offset_manager
                                .update(&task_name, &partition, &offset)
                                .await
                                .map_err(|reason| RunLoopError::OffsetUpdate {
                                    task: task_name,
                                    partition: partition.clone(),
                                    reason,
                                })?;
                        }
                        self.metrics.record_process();
                        if let Some(w) = self.workers.get(&task) {
                            w.task.metrics().record_callback_completed(&task);
                            w.task.metrics().set_in_flight(&task, w.in_flight() as i64);
                        }
                    }
                    ProcessOutcome::Failure(source) => {
                        error!(task = %task, offset = ?offset, "dispatch callback failed");
                        if let Some(w) = self.workers.get_mut(&task) {
                            w.fail(RunLoopError::DispatchFailed { task: task.clone(), source });
                        }
                    }
                    ProcessOutcome::Timeout => {
                        let timeout_ms = self.config.callback_timeout_ms as u64;
                        error!(task = %task, offset = ?offset, timeout_ms, "dispatch callback timed out");
                        if let Some(w) = self.workers.get_mut(&task) {
                            w.fail(RunLoopError::CallbackTimeout { task: task.clone(), timeout_ms });
                        }
                    }
                    ProcessOutcome::Dropped => {
                        if let Some(w) = self.workers.get_mut(&task) {
                            w.fail(RunLoopError::CallbackDropped { task: task.clone() });
                        }
                    }
                }
            }
            WorkerEvent::Window { task, result, requests } => {
                self.apply_requests(&task, requests);
                if let Some(w) = self.workers.get_mut(&task) {
                    w.window_in_flight = false;
                    if let Err(source) = result {
                        w.fail(RunLoopError::WindowFailed { task: task.clone(), source });
                    }
                }
            }
            WorkerEvent::Commit { task, result } => {
                if let Some(w) = self.workers.get_mut(&task) {
                    w.commit_in_flight = false;
                    if let Err(source) = result {
                        w.fail(RunLoopError::CommitFailed { task: task.clone(), source });
                    }
                }
            }
            WorkerEvent::EndOfStream {
                task,
                result,
                commit_result,
                requests,
            } => {
                self.apply_requests(&task, requests);
                if let Some(w) = self.workers.get_mut(&task) {
                    match (result, commit_result) {
                        (Ok(()), Ok(())) => {
                            w.finish_after_end_of_stream();
                            info!(task = %task, "task finished");
                        }
                        (Err(source), _) => w.fail(RunLoopError::EndOfStreamFailed { task: task.clone(), source }),
                        (Ok(()), Err(source)) => w.fail(RunLoopError::CommitFailed { task: task.clone(), source }),
                    }
                }
            }
        }
        Ok(())
    }
}
