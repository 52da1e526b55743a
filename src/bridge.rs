//! Script-facing primitives
//!
//! Every call returns immediately. Results come back as a [`Reply`], the
//! `(value, error)` pair the host pushes onto the script stack; at most one
//! half is populated.

use std::sync::Arc;

use serde::Serialize;

use crate::config::BridgeConfig;
use crate::conn::{ConnectionRef, StreamConfig, CONNECTION_KIND};
use crate::error::{BridgeError, BridgeResult};
use crate::ops;
use crate::registry::{self, Handle, HandleRegistry};
use crate::task::{Task, TaskPoll, TASK_KIND};
use crate::transport::{HttpTransport, StreamConnector, UreqTransport, WebSocketConnector};
use crate::value::Value;

/// Two-value reply of a script-facing call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub value: Value,
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(value: Value) -> Self {
        Self { value, error: None }
    }

    pub fn err(err: &BridgeError) -> Self {
        Self {
            value: Value::Nil,
            error: Some(err.to_string()),
        }
    }

    /// `(nil, nil)`: nothing to report yet
    pub fn pending() -> Self {
        Self::ok(Value::Nil)
    }

    pub fn is_pending(&self) -> bool {
        self.value.is_nil() && self.error.is_none()
    }

    fn from_result(result: BridgeResult<Value>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(err) => Self::err(&err),
        }
    }
}

fn handle_arg(value: &Value) -> BridgeResult<Handle> {
    value.as_handle().ok_or(BridgeError::InvalidHandle)
}

/// Entry point the script host binds its functions to
pub struct Bridge {
    registry: Arc<HandleRegistry>,
    http: Arc<dyn HttpTransport>,
    connector: Arc<dyn StreamConnector>,
    stream: StreamConfig,
}

impl Bridge {
    /// Bridge over the process-wide registry and the default transports
    pub fn new(config: &BridgeConfig) -> Self {
        Self::with_parts(
            registry::global(),
            Arc::new(UreqTransport::new(&config.http)),
            Arc::new(WebSocketConnector::new(config.http.connect_timeout())),
            config.stream.to_stream_config(),
        )
    }

    /// Bridge with explicit registry and transport strategies
    pub fn with_parts(
        registry: Arc<HandleRegistry>,
        http: Arc<dyn HttpTransport>,
        connector: Arc<dyn StreamConnector>,
        stream: StreamConfig,
    ) -> Self {
        Self {
            registry,
            http,
            connector,
            stream,
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// `poll(task) -> (result | nil, error | nil)`
    pub fn poll(&self, task: &Value) -> Reply {
        let task = match self.task(task) {
            Ok(task) => task,
            Err(err) => return Reply::err(&err),
        };
        match task.poll(&self.registry) {
            TaskPoll::Pending => Reply::pending(),
            TaskPoll::Ready(value) => Reply::ok(value),
            TaskPoll::Failed(err) => Reply::err(&err),
            TaskPoll::Cancelled => Reply::err(&BridgeError::Cancelled),
        }
    }

    /// `read(conn) -> (frames | nil, error | nil)`
    ///
    /// Queued frames win over a pending error; the error is reported once the
    /// queue is empty.
    pub fn read(&self, conn: &Value) -> Reply {
        let conn = match self.connection(conn) {
            Ok(conn) => conn,
            Err(err) => return Reply::err(&err),
        };
        let batch = conn.read();
        if batch.frames.is_empty() {
            if let Some(err) = batch.error {
                return Reply::err(&err);
            }
        }
        Reply::ok(Value::List(
            batch.frames.into_iter().map(Value::Bytes).collect(),
        ))
    }

    /// `write(conn, frame...) -> error | nil`
    ///
    /// Every frame must be a string; nothing is queued otherwise.
    pub fn write(&self, conn: &Value, frames: &[Value]) -> Option<String> {
        let result = self.connection(conn).and_then(|conn| {
            let frames = frames
                .iter()
                .map(|f| f.as_bytes().map(<[u8]>::to_vec))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| BridgeError::malformed("invalid argument type"))?;
            conn.write(frames)
        });
        result.err().map(|err| err.to_string())
    }

    /// `httpRequest(config) -> (task | nil, error | nil)`
    pub fn http_request(&self, config: &Value) -> Reply {
        Reply::from_result(
            ops::http_request(&self.registry, Arc::clone(&self.http), config).map(Value::Handle),
        )
    }

    /// `openStream(config) -> (task | nil, error | nil)`
    pub fn open_stream(&self, config: &Value) -> Reply {
        Reply::from_result(
            ops::open_stream(
                &self.registry,
                Arc::clone(&self.connector),
                self.stream,
                config,
            )
            .map(Value::Handle),
        )
    }

    /// `cancel(task) -> error | nil`
    pub fn cancel(&self, task: &Value) -> Option<String> {
        match self.task(task) {
            Ok(task) => {
                task.cancel();
                None
            }
            Err(err) => Some(err.to_string()),
        }
    }

    /// Finalizer hook: the script runtime found `handle` unreachable
    ///
    /// Returns whether a live handle was released.
    pub fn release(&self, handle: &Value) -> bool {
        match handle_arg(handle) {
            Ok(handle) => self.registry.release(handle),
            Err(_) => false,
        }
    }

    fn task(&self, value: &Value) -> BridgeResult<Arc<Task>> {
        self.registry.resolve::<Task>(handle_arg(value)?, TASK_KIND)
    }

    fn connection(&self, value: &Value) -> BridgeResult<Arc<ConnectionRef>> {
        self.registry
            .resolve::<ConnectionRef>(handle_arg(value)?, CONNECTION_KIND)
    }
}
