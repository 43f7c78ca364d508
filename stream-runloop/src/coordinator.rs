use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The scope a coordinator request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    CurrentTask,
    AllTasksInContainer,
}

/// Snapshot of what a dispatch's coordinator was asked to do. Read once
/// the dispatch's callback (or window/commit/end-of-stream call) has
/// completed; a fresh `Coordinator` is minted per dispatch so this never
/// needs resetting.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoordinatorRequests {
    pub commit_current: bool,
    pub commit_all: bool,
    pub shutdown_current: bool,
    pub shutdown_all: bool,
}

impl CoordinatorRequests {
    pub fn wants_commit(&self) -> bool {
        self.commit_current || self.commit_all
    }

    pub fn wants_shutdown(&self) -> bool {
        self.shutdown_current || self.shutdown_all
    }
}

#[derive(Default)]
struct Inner {
    commit_current: AtomicBool,
    commit_all: AtomicBool,
    shutdown_current: AtomicBool,
    shutdown_all: AtomicBool,
}

/// Task-facing control handle. One is minted per `process`/`window`/
/// `endOfStream` dispatch; it captures the owning task's name so the run
/// loop knows which worker a `CurrentTask`-scoped request applies to.
/// Calls are idempotent within a dispatch and merely set flags — the run
/// loop acts on them after the dispatch's callback completes, never
/// re-entrantly.
#[derive(Clone)]
pub struct Coordinator {
    task_name: Arc<str>,
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(task_name: impl Into<Arc<str>>) -> Self {
        Self {
            task_name: task_name.into(),
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn commit(&self, scope: Scope) {
        match scope {
            Scope::CurrentTask => self.inner.commit_current.store(true, Ordering::SeqCst),
            Scope::AllTasksInContainer => self.inner.commit_all.store(true, Ordering::SeqCst),
        }
    }

    pub fn shutdown(&self, scope: Scope) {
        match scope {
            Scope::CurrentTask => self.inner.shutdown_current.store(true, Ordering::SeqCst),
            Scope::AllTasksInContainer => self.inner.shutdown_all.store(true, Ordering::SeqCst),
        }
    }

    pub fn take_requests(&self) -> CoordinatorRequests {
        CoordinatorRequests {
            commit_current: self.inner.commit_current.load(Ordering::SeqCst),
            commit_all: self.inner.commit_all.load(Ordering::SeqCst),
            shutdown_current: self.inner.shutdown_current.load(Ordering::SeqCst),
            shutdown_all: self.inner.shutdown_all.load(Ordering::SeqCst),
        }
    }
}
