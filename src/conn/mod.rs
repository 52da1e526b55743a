//! Connection Abstraction
//!
//! A connection is a duplex frame stream the script side drives with
//! non-blocking `read`/`write` calls while background loops do the blocking
//! I/O against a [`FrameTransport`].
//!
//! ```text
//!   script thread                     background threads
//!  ┌──────────────┐  send queue   ┌───────────────┐   send()    ┌───────────┐
//!  │ write(frames)├──────────────►│  writer loop  ├────────────►│           │
//!  │              │  (wake token) └───────────────┘             │ transport │
//!  │ read()       │◄──────────────┌───────────────┐  receive()  │           │
//!  └──────────────┘ receive queue │  reader loop  │◄────────────┤           │
//!                                 └───────────────┘             └───────────┘
//! ```

pub mod memory;
mod stream;

pub use stream::{StreamConfig, StreamConnection};

use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::HandleRegistry;
use crate::value::{Marshal, Value};

/// Kind name reported when a handle does not refer to a connection
pub const CONNECTION_KIND: &str = "connection";

/// Frames drained by one `read` plus the sticky receive error
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadBatch {
    pub frames: Vec<Vec<u8>>,
    pub error: Option<BridgeError>,
}

/// Capability shared by every connection variant
pub trait Connection: Send + Sync {
    /// Drain the receive queue without blocking
    fn read(&self) -> ReadBatch;

    /// Queue frames for the writer without blocking
    ///
    /// Returns the sticky send error, if any.
    fn write(&self, frames: Vec<Vec<u8>>) -> BridgeResult<()>;

    /// Raise the close signal; idempotent
    fn close(&self);
}

/// Blocking frame I/O used by the background loops
///
/// `send` and `receive` are called from different threads at the same time,
/// and `close` may be called from either while the other is blocked.
pub trait FrameTransport: Send + Sync {
    fn send(&self, frame: &[u8]) -> BridgeResult<()>;

    /// Wait up to `timeout` for the next frame
    ///
    /// `Ok(None)` means nothing arrived in time (or a temporary condition);
    /// the reader simply tries again.
    fn receive(&self, timeout: Duration) -> BridgeResult<Option<Vec<u8>>>;

    /// Shut the transport down; idempotent
    ///
    /// Must not wait for an in-flight `send` or `receive`. Those fail promptly
    /// once the transport is closed.
    fn close(&self);
}

/// Host-side owner of a connection
///
/// Every handle the script holds for a connection, and the stream-open task
/// result itself, keep an `Arc<ConnectionRef>`. When the last one goes the
/// connection is closed.
pub struct ConnectionRef {
    conn: Arc<dyn Connection>,
}

impl ConnectionRef {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }
}

impl Deref for ConnectionRef {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        self.conn.close();
    }
}

// Each poll of a completed stream-open task hands out its own handle; the
// slots hold no release callback because dropping the last Arc closes.
impl Marshal for Arc<ConnectionRef> {
    fn marshal(&self, registry: &HandleRegistry) -> Value {
        let handle = registry.allocate(Arc::clone(self) as Arc<dyn Any + Send + Sync>, None);
        Value::Handle(handle)
    }
}
