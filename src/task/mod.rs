//! Task Scheduler
//!
//! A [`Task`] wraps one asynchronous operation in a control block the script
//! side can poll without blocking. The body runs on its own thread; its result
//! is stored once and read by every later poll.
//!
//! # Lifecycle
//!
//! ```text
//!              ┌──────────── body returns Ok ───────────► Completed(success)
//!   Pending ───┼──────────── body returns Err / panics ─► Completed(failure)
//!              └──────────── cancel / handle released ──► Cancelled
//! ```
//!
//! Exactly one transition out of `Pending` ever happens. A body that finishes
//! after its task was cancelled has its result discarded.

mod signal;

pub use signal::{CancelToken, Signal};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::{Handle, HandleRegistry};
use crate::value::{Marshal, Value};

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Kind name reported when a handle does not refer to a task
pub const TASK_KIND: &str = "task";

/// Stored terminal outcome of a task body
#[derive(Clone)]
enum Outcome {
    Success(Arc<dyn Marshal>),
    Failure(BridgeError),
}

enum TaskState {
    Pending,
    Completed(Outcome),
    Cancelled,
}

/// Result of a non-blocking poll
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPoll {
    /// The body has not finished yet
    Pending,
    /// The body finished with a result
    Ready(Value),
    /// The body finished with an error (including a caught panic)
    Failed(BridgeError),
    /// The task was cancelled before it finished
    Cancelled,
}

/// Control block of one asynchronous operation
pub struct Task {
    id: u64,
    token: CancelToken,
    completion: Signal,
    state: Mutex<TaskState>,
}

impl Task {
    fn new() -> Self {
        Self {
            id: TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            token: CancelToken::new(),
            completion: Signal::new(),
            state: Mutex::new(TaskState::Pending),
        }
    }

    /// Process-unique task id, used in thread names and logs
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check the task state without blocking
    ///
    /// A successful result is marshalled on every call, so a result that
    /// exposes host objects hands out a fresh handle each time.
    pub fn poll(&self, registry: &HandleRegistry) -> TaskPoll {
        let outcome = match &*self.state.lock() {
            TaskState::Pending => return TaskPoll::Pending,
            TaskState::Cancelled => return TaskPoll::Cancelled,
            TaskState::Completed(outcome) => outcome.clone(),
        };
        match outcome {
            Outcome::Success(result) => {
                match panic::catch_unwind(AssertUnwindSafe(|| result.marshal(registry))) {
                    Ok(value) => TaskPoll::Ready(value),
                    Err(payload) => TaskPoll::Failed(BridgeError::Panicked(panic_message(
                        payload.as_ref(),
                    ))),
                }
            }
            Outcome::Failure(err) => TaskPoll::Failed(err),
        }
    }

    /// Cancel the task
    ///
    /// Returns `true` if this call moved the task out of `Pending`. The
    /// cancellation token is raised either way so a running body stops.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            if matches!(*state, TaskState::Pending) {
                *state = TaskState::Cancelled;
                true
            } else {
                false
            }
        };
        self.token.cancel();
        if cancelled {
            tracing::debug!(task = self.id, "task cancelled");
        }
        cancelled
    }

    /// Whether the task ended up cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), TaskState::Cancelled)
    }

    /// Whether the body has returned (regardless of cancellation)
    pub fn is_finished(&self) -> bool {
        self.completion.is_raised()
    }

    /// Block until the body returns or `timeout` elapses
    ///
    /// For host code and tests only; script-facing calls never wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }

    fn finish(&self, outcome: Outcome) {
        let discarded = {
            let mut state = self.state.lock();
            if matches!(*state, TaskState::Pending) {
                *state = TaskState::Completed(outcome);
                None
            } else {
                Some(outcome)
            }
        };
        if discarded.is_some() {
            tracing::debug!(task = self.id, "discarding outcome of cancelled task");
        }
    }
}

/// Raises the completion signal when the body thread is done, on every path
struct CompletionGuard(Arc<Task>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.completion.raise();
    }
}

/// Start `body` as a pollable task registered in `registry`
///
/// The task's cancel function is the handle's release callback, so dropping
/// the last script reference cancels a pending task. Never blocks on the body.
pub fn spawn<F, R>(registry: &HandleRegistry, body: F) -> (Handle, Arc<Task>)
where
    F: FnOnce(&CancelToken) -> BridgeResult<R> + Send + 'static,
    R: Marshal,
{
    let task = Arc::new(Task::new());
    let releaser = Arc::clone(&task);
    let handle = registry.allocate(
        Arc::clone(&task) as Arc<dyn Any + Send + Sync>,
        Some(Box::new(move || {
            releaser.cancel();
        })),
    );

    let worker = Arc::clone(&task);
    let token = task.token.clone();
    let spawned = thread::Builder::new()
        .name(format!("scriptlink-task-{}", task.id))
        .spawn(move || {
            let guard = CompletionGuard(Arc::clone(&worker));
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(&token))) {
                Ok(Ok(result)) => Outcome::Success(Arc::new(result)),
                Ok(Err(err)) => Outcome::Failure(err),
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    tracing::warn!(task = worker.id, panic = %msg, "task body panicked");
                    Outcome::Failure(BridgeError::Panicked(msg))
                }
            };
            worker.finish(outcome);
            drop(guard);
        });

    match spawned {
        Ok(_) => tracing::debug!(task = task.id, %handle, "task spawned"),
        Err(err) => {
            tracing::warn!(task = task.id, error = %err, "failed to start task thread");
            task.finish(Outcome::Failure(BridgeError::Transport(format!(
                "failed to start task: {}",
                err
            ))));
            task.completion.raise();
        }
    }

    (handle, task)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "task body panicked"
    };
    format!("panic: {}", msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn test_pending_then_ready() {
        let registry = HandleRegistry::new();
        let (go_tx, go_rx) = bounded::<()>(0);
        let (_handle, task) = spawn(&registry, move |_| {
            go_rx.recv().ok();
            Ok(Value::Integer(7))
        });

        assert_eq!(task.poll(&registry), TaskPoll::Pending);
        go_tx.send(()).unwrap();
        assert!(task.wait_timeout(WAIT));
        assert_eq!(task.poll(&registry), TaskPoll::Ready(Value::Integer(7)));
        assert_eq!(task.poll(&registry), TaskPoll::Ready(Value::Integer(7)));
    }

    #[test]
    fn test_body_error_is_sticky() {
        let registry = HandleRegistry::new();
        let (_handle, task) = spawn(&registry, |_| -> BridgeResult<Value> {
            Err(BridgeError::transport("dial tcp: connection refused"))
        });
        assert!(task.wait_timeout(WAIT));
        for _ in 0..3 {
            assert_eq!(
                task.poll(&registry),
                TaskPoll::Failed(BridgeError::transport("dial tcp: connection refused"))
            );
        }
    }

    #[test]
    fn test_panic_becomes_error() {
        let registry = HandleRegistry::new();
        let (_handle, task) = spawn(&registry, |_| -> BridgeResult<Value> {
            panic!("exploded");
        });
        assert!(task.wait_timeout(WAIT));
        assert_eq!(
            task.poll(&registry),
            TaskPoll::Failed(BridgeError::Panicked("panic: exploded".to_string()))
        );
    }

    #[test]
    fn test_release_cancels_pending_task() {
        let registry = HandleRegistry::new();
        let (handle, task) = spawn(&registry, |cancel| {
            cancel.sleep(Duration::from_secs(30));
            Ok(Value::from("late"))
        });

        assert!(registry.release(handle));
        assert_eq!(task.poll(&registry), TaskPoll::Cancelled);
        assert!(task.wait_timeout(WAIT));
        assert_eq!(task.poll(&registry), TaskPoll::Cancelled);
    }

    #[test]
    fn test_cancel_after_completion_keeps_result() {
        let registry = HandleRegistry::new();
        let (_handle, task) = spawn(&registry, |_| Ok(Value::from("done")));
        assert!(task.wait_timeout(WAIT));
        assert!(!task.cancel());
        assert_eq!(task.poll(&registry), TaskPoll::Ready(Value::from("done")));
        assert!(!task.is_cancelled());
    }

    #[test]
    fn test_task_ids_are_unique() {
        let registry = HandleRegistry::new();
        let (h1, t1) = spawn(&registry, |_| Ok(Value::Nil));
        let (h2, t2) = spawn(&registry, |_| Ok(Value::Nil));
        assert_ne!(t1.id(), t2.id());
        assert_ne!(h1, h2);
    }
}
