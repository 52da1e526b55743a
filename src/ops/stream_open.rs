//! Stream-open task: dial, start the loops, hand back a connection

use std::sync::Arc;

use url::Url;

use super::{config_table, header_table, required_url};
use crate::conn::{ConnectionRef, StreamConfig, StreamConnection};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::{Handle, HandleRegistry};
use crate::task;
use crate::transport::{StreamConnector, StreamTarget};
use crate::value::Value;

/// Validate a stream-open config table
///
/// Fields: `url` (required), `origin` (optional string), `header` (optional
/// table).
pub fn parse_stream_target(config: &Value) -> BridgeResult<StreamTarget> {
    config_table(config)?;
    let url = required_url(config)?;

    let origin = match config.get("origin") {
        None | Some(Value::Nil) => None,
        Some(Value::Bytes(raw)) => Some(
            Url::parse(&String::from_utf8_lossy(raw))
                .map_err(|e| BridgeError::malformed(e.to_string()))?,
        ),
        Some(_) => return Err(BridgeError::malformed("invalid origin argument")),
    };
    let header = header_table(config.get("header"))?;

    Ok(StreamTarget {
        url,
        origin,
        header,
    })
}

/// Validate `config` and spawn a stream-open task
///
/// The task result is a connection; each poll of the completed task yields a
/// fresh handle to it.
pub fn open_stream(
    registry: &HandleRegistry,
    connector: Arc<dyn StreamConnector>,
    stream_config: StreamConfig,
    config: &Value,
) -> BridgeResult<Handle> {
    let target = parse_stream_target(config)?;
    tracing::debug!(url = %target.url, "starting stream-open task");
    let (handle, _task) = task::spawn(registry, move |cancel| {
        let transport = connector.connect(&target, cancel)?;
        if cancel.is_cancelled() {
            transport.close();
            return Err(BridgeError::Cancelled);
        }
        let conn = StreamConnection::start(transport, stream_config)?;
        tracing::info!(url = %target.url, conn = conn.id(), "stream opened");
        // Dropping the reference on the cancelled path closes the connection.
        let conn = Arc::new(ConnectionRef::new(Arc::new(conn)));
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        Ok(conn)
    });
    Ok(handle)
}
