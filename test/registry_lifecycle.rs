//! Integration Tests for the Handle Registry
//!
//! Tests handle lifetime as seen by a script host:
//! - release callbacks and finalizer ordering
//! - stale handle rejection after slot reuse
//! - the process-wide registry

use scriptlink::registry::{self, HandleRegistry};
use scriptlink::{BridgeError, Handle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// Release semantics
// =============================================================================

#[test]
fn test_release_runs_callback_and_drops_object() {
    let registry = HandleRegistry::new();
    let object = Arc::new(String::from("payload"));
    let released = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&released);

    let handle = registry.allocate(
        Arc::clone(&object) as Arc<dyn std::any::Any + Send + Sync>,
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    assert_eq!(Arc::strong_count(&object), 2);

    assert!(registry.release(handle));
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(Arc::strong_count(&object), 1);

    // A finalizer firing twice is harmless
    assert!(!registry.release(handle));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lookup_keeps_object_alive_past_release() {
    let registry = HandleRegistry::new();
    let handle = registry.allocate(Arc::new(vec![1u8, 2, 3]), None);

    let borrowed = registry.resolve::<Vec<u8>>(handle, "buffer").unwrap();
    registry.release(handle);
    assert_eq!(*borrowed, vec![1, 2, 3]);
    assert_eq!(
        registry.resolve::<Vec<u8>>(handle, "buffer").unwrap_err(),
        BridgeError::InvalidHandle
    );
}

// =============================================================================
// Handle identity
// =============================================================================

#[test]
fn test_stale_handles_never_alias() {
    let registry = HandleRegistry::new();
    let mut stale = Vec::new();
    for i in 0..100u32 {
        let h = registry.allocate(Arc::new(i), None);
        registry.release(h);
        stale.push(h);
    }
    let live = registry.allocate(Arc::new(999u32), None);

    for h in stale {
        assert_ne!(h, live);
        assert!(registry.lookup(h).is_none());
    }
    assert_eq!(*registry.resolve::<u32>(live, "number").unwrap(), 999);
}

#[test]
fn test_raw_roundtrip_and_foreign_values() {
    let registry = HandleRegistry::new();
    let h = registry.allocate(Arc::new(()), None);

    let raw = h.as_raw();
    assert_eq!(Handle::from_raw(raw), h);
    assert!(registry.lookup(Handle::from_raw(raw)).is_some());

    // Slot index far past the table, and a plausible generation
    assert!(registry.lookup(Handle::from_raw((1 << 32) | 0xFFFF)).is_none());
    assert!(registry.lookup(Handle::from_raw(0)).is_none());
    assert_eq!(Handle::from_raw(0).to_string(), "handle#invalid");
}

#[test]
fn test_global_registry_is_shared() {
    let a = registry::global();
    let b = registry::global();
    let h = a.allocate(Arc::new(5u8), None);
    assert_eq!(*b.resolve::<u8>(h, "byte").unwrap(), 5);
    assert!(b.release(h));
}
