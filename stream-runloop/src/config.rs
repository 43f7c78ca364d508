use envconfig::Envconfig;

/// The run loop's own tunables. Collaborator handles (`tasks`,
/// `consumerMux`, `containerMetrics`, `clock`) are wired in code rather
/// than through the environment, the same split `ingestion-consumer`'s
/// `Config` makes between plain tunables and its `transport`/`router`
/// collaborators.
#[derive(Envconfig, Clone, Debug)]
pub struct RunLoopConfig {
    #[envconfig(from = "RUNLOOP_MAX_MESSAGES_IN_FLIGHT", default = "1")]
    pub max_messages_in_flight: usize,

    /// Window period in milliseconds; `<= 0` disables windowing.
    #[envconfig(from = "RUNLOOP_WINDOW_MS", default = "0")]
    pub window_ms: i64,

    /// Periodic commit period in milliseconds; `<= 0` disables periodic commits.
    #[envconfig(from = "RUNLOOP_COMMIT_MS", default = "0")]
    pub commit_ms: i64,

    /// Per-message callback deadline in milliseconds; `<= 0` disables the timeout.
    #[envconfig(from = "RUNLOOP_CALLBACK_TIMEOUT_MS", default = "0")]
    pub callback_timeout_ms: i64,

    /// Upper bound a throttler may apply when the loop sleeps; reserved, not enforced directly.
    #[envconfig(from = "RUNLOOP_MAX_THROTTLING_DELAY_MS", default = "0")]
    pub max_throttling_delay_ms: i64,

    /// Maximum time to block in `choose` when no task is ready.
    #[envconfig(from = "RUNLOOP_MAX_IDLE_MS", default = "1000")]
    pub max_idle_ms: i64,

    #[envconfig(from = "RUNLOOP_ASYNC_COMMIT_ENABLED", default = "false")]
    pub async_commit_enabled: bool,

    /// Number of key buckets each source partition splits into; `1` disables elasticity.
    #[envconfig(from = "RUNLOOP_ELASTICITY_FACTOR", default = "1")]
    pub elasticity_factor: u8,
}

impl RunLoopConfig {
    /// A single-task, single-in-flight, no-windowing, no-periodic-commit
    /// configuration useful as a test and documentation baseline.
    pub fn minimal() -> Self {
        Self {
            max_messages_in_flight: 1,
            window_ms: 0,
            commit_ms: 0,
            callback_timeout_ms: 0,
            max_throttling_delay_ms: 0,
            max_idle_ms: 1000,
            async_commit_enabled: false,
            elasticity_factor: 1,
        }
    }
}
