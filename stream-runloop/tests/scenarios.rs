//! End-to-end scenarios driving a full [`RunLoop`] against hand-rolled
//! task and mux doubles, in the style `ingestion-consumer`'s own
//! integration tests script a fake `IngestionTransport`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use stream_runloop::{
    effective_partition, system_clock, Callback, CallbackFactory, ConsumerMux, ContainerMetrics, Coordinator,
    Envelope, InMemoryOffsetManager, OffsetManager, Payload, PartitionId, RunLoop, RunLoopConfig, RunLoopError,
    Scope, TaskError, TaskHandle, TaskMetrics,
};
use tokio::sync::Mutex as AsyncMutex;

static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

type Log = Arc<Mutex<Vec<String>>>;

async fn wait_for(log: &Log, needle: &str) {
    for _ in 0..200 {
        if log.lock().unwrap().iter().any(|entry| entry == needle) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for log entry '{needle}', got {:?}", log.lock().unwrap());
}

/// Feeds a fixed list of envelopes, then reports empty forever.
struct VecMux {
    envelopes: AsyncMutex<VecDeque<Envelope>>,
}

impl VecMux {
    fn new(envelopes: Vec<Envelope>) -> Arc<dyn ConsumerMux> {
        Arc::new(Self {
            envelopes: AsyncMutex::new(envelopes.into()),
        })
    }
}

#[async_trait]
impl ConsumerMux for VecMux {
    async fn choose(&self, _block: bool) -> Result<Option<Envelope>, String> {
        Ok(self.envelopes.lock().await.pop_front())
    }
}

/// A task double that logs every call it receives, optionally holding a
/// `process` callback open (for out-of-order / in-flight scenarios),
/// failing on specific offsets, or issuing coordinator requests when a
/// specific offset completes.
struct RecordingTask {
    name: String,
    partitions: HashSet<PartitionId>,
    offset_manager: Arc<dyn OffsetManager>,
    metrics: Arc<TaskMetrics>,
    log: Log,
    windowable: bool,
    hold_offsets: Mutex<HashSet<String>>,
    fail_offsets: Mutex<HashSet<String>>,
    on_complete: Mutex<HashMap<String, (Option<Scope>, Option<Scope>)>>,
    held: AsyncMutex<HashMap<String, Callback>>,
}

impl RecordingTask {
    fn new(name: &str, partitions: HashSet<PartitionId>, log: Log) -> Arc<Self> {
        Self::with_windowable(name, partitions, log, false)
    }

    /// A task whose `window` fires are observable in the log. Each fire
    /// requests a current-task shutdown, since nothing else in these
    /// scenarios ever calls `endOfStream` for a task with no end-of-stream
    /// envelope on its partitions.
    fn new_windowable(name: &str, partitions: HashSet<PartitionId>, log: Log) -> Arc<Self> {
        Self::with_windowable(name, partitions, log, true)
    }

    fn with_windowable(name: &str, partitions: HashSet<PartitionId>, log: Log, windowable: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            partitions,
            offset_manager: Arc::new(InMemoryOffsetManager::new()),
            metrics: TaskMetrics::new(),
            log,
            windowable,
            hold_offsets: Mutex::new(HashSet::new()),
            fail_offsets: Mutex::new(HashSet::new()),
            on_complete: Mutex::new(HashMap::new()),
            held: AsyncMutex::new(HashMap::new()),
        })
    }

    fn hold(&self, offset: &str) {
        self.hold_offsets.lock().unwrap().insert(offset.to_string());
    }

    fn fail_on(&self, offset: &str) {
        self.fail_offsets.lock().unwrap().insert(offset.to_string());
    }

    fn on_complete_request(&self, offset: &str, commit: Option<Scope>, shutdown: Option<Scope>) {
        self.on_complete
            .lock()
            .unwrap()
            .insert(offset.to_string(), (commit, shutdown));
    }

    async fn release(&self, offset: &str) {
        if let Some(callback) = self.held.lock().await.remove(offset) {
            callback.complete();
        }
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

#[async_trait]
impl TaskHandle for RecordingTask {
    fn task_name(&self) -> &str {
        &self.name
    }

    fn system_stream_partitions(&self) -> &HashSet<PartitionId> {
        &self.partitions
    }

    fn offset_manager(&self) -> Arc<dyn OffsetManager> {
        self.offset_manager.clone()
    }

    fn metrics(&self) -> Arc<TaskMetrics> {
        self.metrics.clone()
    }

    fn is_windowable_task(&self) -> bool {
        self.windowable
    }

    async fn process(&self, envelope: Envelope, coordinator: Coordinator, callback_factory: CallbackFactory) {
        let offset = envelope.offset.clone().unwrap_or_default();
        if matches!(envelope.message, Payload::Watermark(_)) {
            self.record(format!("{}:process:watermark", self.name));
        } else {
            self.record(format!("{}:process:{offset}", self.name));
        }

        if let Some((commit, shutdown)) = self.on_complete.lock().unwrap().get(&offset).copied() {
            if let Some(scope) = commit {
                coordinator.commit(scope);
            }
            if let Some(scope) = shutdown {
                coordinator.shutdown(scope);
            }
        }

        if self.fail_offsets.lock().unwrap().contains(&offset) {
            callback_factory.create().failure(TaskError::Failed(format!("{offset} failed")));
        } else if self.hold_offsets.lock().unwrap().contains(&offset) {
            self.held.lock().await.insert(offset, callback_factory.create());
        } else {
            callback_factory.create().complete();
        }
    }

    async fn window(&self, coordinator: Coordinator) -> Result<(), TaskError> {
        self.record(format!("{}:window", self.name));
        coordinator.shutdown(Scope::CurrentTask);
        Ok(())
    }

    async fn end_of_stream(&self, _coordinator: Coordinator) -> Result<(), TaskError> {
        self.record(format!("{}:eos", self.name));
        Ok(())
    }

    async fn commit(&self) -> Result<(), TaskError> {
        self.record(format!("{}:commit", self.name));
        Ok(())
    }
}

fn data(partition: &PartitionId, offset: &str) -> Envelope {
    Envelope::new(
        partition.clone(),
        Some(offset.to_string()),
        None,
        Payload::Data(Bytes::from_static(b"x")),
        1,
        0,
        0,
    )
}

fn singleton(partition: PartitionId) -> HashSet<PartitionId> {
    let mut set = HashSet::new();
    set.insert(partition);
    set
}

#[tokio::test]
async fn multi_task_pass_through() {
    setup_tracing();
    let raw0 = PartitionId::new("db", "events", 0);
    let raw1 = PartitionId::new("db", "events", 1);
    let mux = VecMux::new(vec![
        data(&raw0, "0"),
        data(&raw1, "1"),
        Envelope::end_of_stream(raw0.clone(), 0),
        Envelope::end_of_stream(raw1.clone(), 0),
    ]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw0), log.clone());
    let t1 = RecordingTask::new("t1", singleton(raw1), log.clone());
    let metrics = Arc::new(ContainerMetrics::new());

    let run_loop = RunLoop::new(
        vec![t0.clone(), t1.clone()],
        mux,
        RunLoopConfig::minimal(),
        metrics.clone(),
        system_clock(),
    );
    run_loop.run().await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert!(entries.contains(&"t0:process:0".to_string()));
    assert!(entries.contains(&"t1:process:1".to_string()));
    assert!(entries.contains(&"t0:eos".to_string()));
    assert!(entries.contains(&"t1:eos".to_string()));
    assert_eq!(metrics.envelopes(), 4);
}

#[tokio::test]
async fn strict_ordering_with_single_in_flight_slot() {
    setup_tracing();
    let raw = PartitionId::new("db", "events", 0);
    let mux = VecMux::new(vec![data(&raw, "0"), data(&raw, "1"), Envelope::end_of_stream(raw.clone(), 0)]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw), log.clone());

    let run_loop = RunLoop::new(
        vec![t0.clone()],
        mux,
        RunLoopConfig::minimal(),
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );
    run_loop.run().await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert_eq!(entries, vec!["t0:process:0", "t0:process:1", "t0:eos"]);
}

#[tokio::test]
async fn out_of_order_completion_respects_in_flight_bound() {
    setup_tracing();
    let raw = PartitionId::new("db", "events", 0);
    let mux = VecMux::new(vec![data(&raw, "0"), data(&raw, "1"), Envelope::end_of_stream(raw.clone(), 0)]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw), log.clone());
    t0.hold("0");

    let config = RunLoopConfig {
        max_messages_in_flight: 2,
        ..RunLoopConfig::minimal()
    };
    let run_loop = RunLoop::new(
        vec![t0.clone()],
        mux,
        config,
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );

    let handle = tokio::spawn(run_loop.run());
    wait_for(&log, "t0:process:1").await;

    // env01 finished first even though env00 was dispatched first; the
    // task's async callback completion count tracks that directly.
    assert_eq!(t0.metrics.async_callback_completed(), 1);
    assert_eq!(t0.metrics.messages_in_flight(), 1);

    t0.release("0").await;
    handle.await.unwrap().unwrap();

    assert_eq!(t0.metrics.async_callback_completed(), 2);
    assert_eq!(t0.metrics.messages_in_flight(), 0);
}

#[tokio::test]
async fn end_of_stream_waits_for_in_flight_callback() {
    setup_tracing();
    let raw = PartitionId::new("db", "events", 0);
    let mux = VecMux::new(vec![data(&raw, "0"), data(&raw, "1"), Envelope::end_of_stream(raw.clone(), 0)]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw), log.clone());
    t0.hold("0");

    let config = RunLoopConfig {
        max_messages_in_flight: 2,
        ..RunLoopConfig::minimal()
    };
    let run_loop = RunLoop::new(
        vec![t0.clone()],
        mux,
        config,
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );

    let handle = tokio::spawn(run_loop.run());
    wait_for(&log, "t0:process:1").await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(
        !log.lock().unwrap().contains(&"t0:eos".to_string()),
        "endOfStream must not fire while env00's callback is still in flight"
    );

    t0.release("0").await;
    handle.await.unwrap().unwrap();

    assert!(log.lock().unwrap().contains(&"t0:eos".to_string()));
    assert_eq!(t0.metrics.async_callback_completed(), 2);
    assert_eq!(t0.metrics.messages_in_flight(), 0);
}

#[tokio::test]
async fn commit_scope_current_task_only_commits_the_requesting_task() {
    setup_tracing();
    let raw0 = PartitionId::new("db", "events", 0);
    let raw1 = PartitionId::new("db", "events", 1);
    let mux = VecMux::new(vec![data(&raw0, "0")]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw0), log.clone());
    let t1 = RecordingTask::new("t1", singleton(raw1), log.clone());
    t0.on_complete_request("0", Some(Scope::CurrentTask), Some(Scope::AllTasksInContainer));

    let run_loop = RunLoop::new(
        vec![t0.clone(), t1.clone()],
        mux,
        RunLoopConfig::minimal(),
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );
    run_loop.run().await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert!(entries.contains(&"t0:commit".to_string()));
    assert!(!entries.contains(&"t1:commit".to_string()));
}

#[tokio::test]
async fn commit_scope_all_tasks_commits_every_task() {
    setup_tracing();
    let raw0 = PartitionId::new("db", "events", 0);
    let raw1 = PartitionId::new("db", "events", 1);
    let mux = VecMux::new(vec![data(&raw0, "0")]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw0), log.clone());
    let t1 = RecordingTask::new("t1", singleton(raw1), log.clone());
    t0.on_complete_request("0", Some(Scope::AllTasksInContainer), Some(Scope::AllTasksInContainer));

    let run_loop = RunLoop::new(
        vec![t0.clone(), t1.clone()],
        mux,
        RunLoopConfig::minimal(),
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );
    run_loop.run().await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert!(entries.contains(&"t0:commit".to_string()));
    assert!(entries.contains(&"t1:commit".to_string()));
}

#[tokio::test]
async fn elasticity_routes_to_the_owning_bucket_and_drops_the_rest() {
    setup_tracing();
    let raw = PartitionId::new("db", "events", 4);
    let factor: u8 = 2;

    let owned_key = "user-owned";
    let owned_bucket = effective_partition(&raw, Some(owned_key.as_bytes()), None, factor)
        .key_bucket
        .unwrap();
    let other_key = (0..100)
        .map(|i| format!("candidate-{i}"))
        .find(|candidate| {
            effective_partition(&raw, Some(candidate.as_bytes()), None, factor).key_bucket.unwrap() != owned_bucket
        })
        .expect("factor=2 must produce both buckets within 100 tries");

    let mux = VecMux::new(vec![
        Envelope::new(
            raw.clone(),
            Some("0".to_string()),
            Some(Bytes::copy_from_slice(owned_key.as_bytes())),
            Payload::Data(Bytes::from_static(b"x")),
            1,
            0,
            0,
        ),
        Envelope::new(
            raw.clone(),
            Some("1".to_string()),
            Some(Bytes::copy_from_slice(other_key.as_bytes())),
            Payload::Data(Bytes::from_static(b"y")),
            1,
            0,
            0,
        ),
        Envelope::end_of_stream(raw.clone(), 0),
    ]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw.with_bucket(owned_bucket)), log.clone());
    let metrics = Arc::new(ContainerMetrics::new());

    let config = RunLoopConfig {
        elasticity_factor: factor,
        ..RunLoopConfig::minimal()
    };
    let run_loop = RunLoop::new(
        vec![t0.clone()],
        mux,
        config,
        metrics.clone(),
        system_clock(),
    );
    run_loop.run().await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert!(entries.contains(&"t0:process:0".to_string()));
    assert!(!entries.contains(&"t0:process:1".to_string()), "unowned bucket must not be delivered");
    assert!(entries.contains(&"t0:eos".to_string()));
}

#[tokio::test]
async fn callback_failure_aborts_the_run_loop() {
    setup_tracing();
    let raw = PartitionId::new("db", "events", 0);
    let mux = VecMux::new(vec![data(&raw, "0")]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw), log.clone());
    t0.fail_on("0");

    let run_loop = RunLoop::new(
        vec![t0.clone()],
        mux,
        RunLoopConfig::minimal(),
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );

    let err = run_loop.run().await.expect_err("a failed callback must surface as an error");
    assert!(matches!(err, RunLoopError::DispatchFailed { task, .. } if task == "t0"));
}

#[tokio::test]
async fn watermark_fans_out_to_every_owned_bucket() {
    setup_tracing();
    let raw = PartitionId::new("db", "events", 4);
    let factor: u8 = 2;

    let mux = VecMux::new(vec![Envelope::watermark(raw.clone(), 1_000, 0), Envelope::end_of_stream(raw.clone(), 0)]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw.with_bucket(0)), log.clone());
    let t1 = RecordingTask::new("t1", singleton(raw.with_bucket(1)), log.clone());

    let config = RunLoopConfig {
        elasticity_factor: factor,
        ..RunLoopConfig::minimal()
    };
    let run_loop = RunLoop::new(
        vec![t0.clone(), t1.clone()],
        mux,
        config,
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );
    run_loop.run().await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert!(
        entries.contains(&"t0:process:watermark".to_string()),
        "watermark must fan out to every owned bucket, not just bucket zero"
    );
    assert!(entries.contains(&"t1:process:watermark".to_string()));
}

#[tokio::test]
async fn window_fires_periodically_while_idle() {
    setup_tracing();
    let raw = PartitionId::new("db", "events", 0);
    let mux = VecMux::new(vec![]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new_windowable("t0", singleton(raw), log.clone());

    let config = RunLoopConfig {
        window_ms: 20,
        ..RunLoopConfig::minimal()
    };
    let run_loop = RunLoop::new(
        vec![t0.clone()],
        mux,
        config,
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );

    // window() requests a current-task shutdown on its first fire, so the
    // loop exits on its own once the window has fired.
    run_loop.run().await.unwrap();

    let entries = log.lock().unwrap().clone();
    assert!(entries.contains(&"t0:window".to_string()));
}

#[tokio::test]
async fn callback_timeout_surfaces_as_a_run_loop_error() {
    setup_tracing();
    let raw = PartitionId::new("db", "events", 0);
    let mux = VecMux::new(vec![data(&raw, "0")]);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let t0 = RecordingTask::new("t0", singleton(raw), log.clone());
    t0.hold("0");

    let config = RunLoopConfig {
        callback_timeout_ms: 20,
        ..RunLoopConfig::minimal()
    };
    let run_loop = RunLoop::new(
        vec![t0.clone()],
        mux,
        config,
        Arc::new(ContainerMetrics::new()),
        system_clock(),
    );

    let err = run_loop.run().await.expect_err("a callback that never completes must time out");
    assert!(matches!(err, RunLoopError::CallbackTimeout { task, timeout_ms } if task == "t0" && timeout_ms == 20));
}
