//! Integration Tests for the Task Scheduler
//!
//! Tests the polling protocol a script host relies on:
//! - pending / settled / cancelled outcomes
//! - stability of a settled outcome
//! - cancellation through handle release and explicit cancel
//! - panics in task bodies

use crossbeam_channel::bounded;
use scriptlink::task::{self, TaskPoll};
use scriptlink::{BridgeError, BridgeResult, HandleRegistry, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Outcomes
// =============================================================================

#[test]
fn test_settled_outcome_is_stable() {
    let registry = HandleRegistry::new();
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (_handle, task) = task::spawn(&registry, move |_| {
        gate_rx.recv().ok();
        Ok(Value::map([("answer", Value::Integer(42))]))
    });

    for _ in 0..3 {
        assert_eq!(task.poll(&registry), TaskPoll::Pending);
    }
    gate_tx.send(()).unwrap();
    assert!(task.wait_timeout(WAIT));

    let first = task.poll(&registry);
    assert!(matches!(first, TaskPoll::Ready(_)));
    for _ in 0..5 {
        assert_eq!(task.poll(&registry), first);
    }
}

#[test]
fn test_failure_and_panic_are_errors() {
    let registry = HandleRegistry::new();
    let (_h1, failing) = task::spawn(&registry, |_| -> BridgeResult<Value> {
        Err(BridgeError::transport("connection reset by peer"))
    });
    let (_h2, panicking) = task::spawn(&registry, |_| -> BridgeResult<Value> {
        let items: Vec<u8> = Vec::new();
        let byte = items[3];
        Ok(Value::Integer(i64::from(byte)))
    });

    assert!(failing.wait_timeout(WAIT));
    assert!(panicking.wait_timeout(WAIT));
    assert_eq!(
        failing.poll(&registry),
        TaskPoll::Failed(BridgeError::transport("connection reset by peer"))
    );
    match panicking.poll(&registry) {
        TaskPoll::Failed(BridgeError::Panicked(msg)) => {
            assert!(msg.starts_with("panic: index out of bounds"), "{}", msg)
        }
        other => panic!("unexpected poll result: {:?}", other),
    }
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_release_before_completion_reports_cancelled() {
    let registry = HandleRegistry::new();
    let observed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&observed);
    let (handle, task) = task::spawn(&registry, move |cancel| {
        if cancel.sleep(Duration::from_secs(30)) {
            flag.store(true, Ordering::SeqCst);
            return Err(BridgeError::transport("aborted"));
        }
        Ok(Value::Nil)
    });

    assert!(registry.release(handle));
    assert!(task.wait_timeout(WAIT));
    assert!(observed.load(Ordering::SeqCst));
    // Not the body's transport error
    assert_eq!(task.poll(&registry), TaskPoll::Cancelled);
    assert!(registry.is_empty());
}

#[test]
fn test_late_result_after_cancel_is_discarded() {
    let registry = HandleRegistry::new();
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (_handle, task) = task::spawn(&registry, move |_| {
        // Ignores the token entirely
        gate_rx.recv().ok();
        Ok(Value::from("too late"))
    });

    assert!(task.cancel());
    gate_tx.send(()).unwrap();
    assert!(task.wait_timeout(WAIT));
    assert_eq!(task.poll(&registry), TaskPoll::Cancelled);
    assert!(task.is_cancelled());
}

#[test]
fn test_many_concurrent_tasks() {
    let registry = HandleRegistry::new();
    let tasks: Vec<_> = (0..32i64)
        .map(|i| task::spawn(&registry, move |_| Ok(Value::Integer(i * i))))
        .collect();
    assert_eq!(registry.len(), 32);

    for (i, (handle, task)) in tasks.iter().enumerate() {
        assert!(task.wait_timeout(WAIT));
        let i = i as i64;
        assert_eq!(task.poll(&registry), TaskPoll::Ready(Value::Integer(i * i)));
        assert!(registry.release(*handle));
    }
    assert!(registry.is_empty());
}
