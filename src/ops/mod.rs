//! Task bodies behind the script-facing open calls
//!
//! Each call validates its config table synchronously and only then spawns a
//! task, so malformed input never costs a thread.

mod request;
mod stream_open;

pub use request::{http_request, parse_request};
pub use stream_open::{open_stream, parse_stream_target};

use std::collections::BTreeMap;

use url::Url;

use crate::error::{BridgeError, BridgeResult};
use crate::transport::{canonical_header_key, valid_header_name, valid_header_value};
use crate::value::Value;

/// Render a scalar the way a script would print it, for error messages
fn render(value: &Value) -> String {
    match value {
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Integer(n) => n.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
        other => other.type_name().to_string(),
    }
}

/// String-like table entries; numbers are accepted in their printed form
fn string_like(value: &Value) -> Option<String> {
    match value {
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Value::Integer(n) => Some(n.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn config_table(config: &Value) -> BridgeResult<()> {
    match config {
        Value::Map(_) => Ok(()),
        // An empty table may arrive as an empty sequence.
        Value::List(items) if items.is_empty() => Ok(()),
        _ => Err(BridgeError::malformed("missing table argument")),
    }
}

fn required_url(config: &Value) -> BridgeResult<Url> {
    let raw = config
        .get("url")
        .and_then(Value::as_bytes)
        .ok_or_else(|| BridgeError::malformed("missing url argument"))?;
    let raw = String::from_utf8_lossy(raw);
    Url::parse(&raw).map_err(|e| BridgeError::malformed(e.to_string()))
}

/// Read an optional header table into canonical name/value pairs
///
/// Later duplicates of the same canonical name replace earlier ones.
fn header_table(value: Option<&Value>) -> BridgeResult<BTreeMap<String, String>> {
    let mut header = BTreeMap::new();
    let entries = match value {
        None | Some(Value::Nil) => return Ok(header),
        Some(Value::List(items)) if items.is_empty() => return Ok(header),
        Some(Value::Map(entries)) => entries,
        Some(other) => {
            return Err(BridgeError::malformed(format!(
                "invalid header {}",
                render(other)
            )))
        }
    };
    for (name, value) in entries {
        let Some(text) = string_like(value) else {
            return Err(BridgeError::malformed(format!(
                "invalid header item[{}] = {}",
                name,
                render(value)
            )));
        };
        if !valid_header_name(name) || !valid_header_value(&text) {
            return Err(BridgeError::malformed(format!("invalid header {}", name)));
        }
        header.insert(canonical_header_key(name), text);
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_table() {
        let table = Value::map([
            ("content-type", Value::from("text/plain")),
            ("x-retry", Value::Integer(3)),
        ]);
        let header = header_table(Some(&table)).unwrap();
        assert_eq!(header.get("Content-Type").map(String::as_str), Some("text/plain"));
        assert_eq!(header.get("X-Retry").map(String::as_str), Some("3"));

        assert!(header_table(None).unwrap().is_empty());
        assert!(header_table(Some(&Value::List(vec![]))).unwrap().is_empty());
    }

    #[test]
    fn test_header_table_errors() {
        let err = header_table(Some(&Value::from("oops"))).unwrap_err();
        assert_eq!(err.to_string(), "invalid header oops");

        let table = Value::map([("x-flag", Value::Boolean(true))]);
        let err = header_table(Some(&table)).unwrap_err();
        assert_eq!(err.to_string(), "invalid header item[x-flag] = true");

        let table = Value::map([("bad name", Value::from("v"))]);
        let err = header_table(Some(&table)).unwrap_err();
        assert_eq!(err.to_string(), "invalid header bad name");
    }
}
