//! Request task: one request/response exchange

use std::sync::Arc;

use super::{config_table, header_table, required_url};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::{Handle, HandleRegistry};
use crate::task;
use crate::transport::{valid_header_name, HttpRequest, HttpTransport};
use crate::value::Value;

const DEFAULT_METHOD: &str = "GET";

/// Validate a request config table
///
/// Fields: `method` (defaults to GET when absent or not a string), `url`
/// (required), `header` (optional table), `body` (optional string).
pub fn parse_request(config: &Value) -> BridgeResult<HttpRequest> {
    config_table(config)?;

    let method = match config.get("method").and_then(Value::as_bytes) {
        Some(raw) => String::from_utf8_lossy(raw).into_owned(),
        None => DEFAULT_METHOD.to_string(),
    };
    let url = required_url(config)?;
    if !valid_header_name(&method) {
        return Err(BridgeError::malformed(format!("invalid method {}", method)));
    }
    let header = header_table(config.get("header"))?;
    let body = match config.get("body") {
        None | Some(Value::Nil) => None,
        Some(Value::Bytes(b)) => Some(b.clone()),
        Some(_) => return Err(BridgeError::malformed("unrecognized body type")),
    };

    Ok(HttpRequest {
        method,
        url,
        header,
        body,
    })
}

/// Validate `config` and spawn a request task
pub fn http_request(
    registry: &HandleRegistry,
    transport: Arc<dyn HttpTransport>,
    config: &Value,
) -> BridgeResult<Handle> {
    let request = parse_request(config)?;
    tracing::debug!(method = %request.method, url = %request.url, "starting request task");
    let (handle, _task) = task::spawn(registry, move |cancel| {
        let response = transport.execute(&request, cancel)?;
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        Ok(response)
    });
    Ok(handle)
}
