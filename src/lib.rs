//! scriptlink - Non-blocking network bridge for single-threaded script hosts
//!
//! A scripting runtime with no native concurrency hands network work to the
//! bridge and then only ever polls. Request/response calls and long-lived
//! duplex streams run on background threads; the script side holds opaque
//! handles and receives `(value, error)` pairs from strictly non-blocking calls.
//!
//! # Features
//!
//! - **Handle registry**: generation-checked handles tie script references to
//!   host objects; releasing a handle runs its cleanup exactly once
//! - **Pollable tasks**: every operation is a cancelable task with exactly one
//!   terminal outcome; panics in task bodies become errors
//! - **Stream connections**: a reader loop and a writer loop per connection,
//!   hand-off queues in both directions, sticky errors
//! - **Pluggable transports**: `ureq` for requests, `tungstenite` for
//!   WebSocket streams, or any implementation of the transport traits
//!
//! # Example
//!
//! ```no_run
//! use scriptlink::{Bridge, BridgeConfig, Value};
//!
//! let bridge = Bridge::new(&BridgeConfig::default());
//! let reply = bridge.http_request(&Value::map([("url", Value::from("http://example.com/"))]));
//! let task = reply.value;
//!
//! // Called once per host frame, never blocks.
//! loop {
//!     let polled = bridge.poll(&task);
//!     if !polled.is_pending() {
//!         println!("{:?}", polled);
//!         break;
//!     }
//! #   std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! bridge.release(&task);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Script host    │  poll / read / write / httpRequest / openStream
//! └────────┬────────┘
//!          │ handles
//!          ▼
//! ┌─────────────────┐
//! │ Handle registry │  handle -> Task | Connection
//! └────────┬────────┘
//!     ┌────┴─────┐
//!     ▼          ▼
//! ┌───────┐  ┌────────────┐
//! │ Task  │  │ Connection │  reader + writer loops
//! └───┬───┘  └─────┬──────┘
//!     │            │
//!     ▼            ▼
//! ┌─────────────────────┐
//! │     Transports      │  ureq / tungstenite / custom
//! └─────────────────────┘
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod conn;
pub mod error;
pub mod logging;
pub mod ops;
pub mod registry;
pub mod task;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use bridge::{Bridge, Reply};
pub use config::{
    BridgeConfig, ConfigError, ConfigResult, HttpConfig, LoggingConfig, StreamSettings,
};
pub use conn::{
    Connection, ConnectionRef, FrameTransport, ReadBatch, StreamConfig, StreamConnection,
};
pub use error::{BridgeError, BridgeResult};
pub use registry::{Handle, HandleRegistry};
pub use task::{CancelToken, Task, TaskPoll};
pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, StreamConnector, StreamTarget, UreqTransport,
    WebSocketConnector,
};
pub use value::{Marshal, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
