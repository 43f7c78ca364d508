use tokio::sync::oneshot;

use crate::error::TaskError;

/// The outcome a task reports through its callback.
#[derive(Debug)]
pub enum CallbackOutcome {
    Complete,
    Failure(TaskError),
}

/// A one-shot completion handle for a single `process` dispatch. The task
/// must call exactly one of `complete`/`failure` on it, from whichever
/// thread eventually finishes the work.
pub struct Callback {
    tx: oneshot::Sender<CallbackOutcome>,
}

impl Callback {
    pub fn complete(self) {
        drop(self.tx.send(CallbackOutcome::Complete));
    }

    pub fn failure(self, err: TaskError) {
        drop(self.tx.send(CallbackOutcome::Failure(err)));
    }
}

/// Hands out exactly one [`Callback`] per dispatch. `create` consumes the
/// factory, so the type system — not a runtime check — enforces the
/// one-callback-per-dispatch rule.
pub struct CallbackFactory {
    tx: oneshot::Sender<CallbackOutcome>,
}

impl CallbackFactory {
    pub(crate) fn new() -> (Self, oneshot::Receiver<CallbackOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn create(self) -> Callback {
        Callback { tx: self.tx }
    }
}
