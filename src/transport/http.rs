//! Request/response transport
//!
//! Wraps a shared `ureq` agent. Non-2xx statuses are ordinary responses;
//! only transport-level failures become errors.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};

use url::Url;

use crate::config::HttpConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::registry::HandleRegistry;
use crate::task::CancelToken;
use crate::value::{Marshal, Value};

const READ_CHUNK: usize = 16 * 1024;

/// A validated request, ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: Url,
    /// Canonical header name to value
    pub header: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

/// A completed response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Numeric status, e.g. 200
    pub code: u16,
    /// Status line, e.g. "200 OK"
    pub status: String,
    /// Canonical header name to its first value
    pub header: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Build a response from a status code and reason phrase
    pub fn new(code: u16, reason: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            status: status_line(code, reason),
            header: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.header
            .entry(canonical_header_key(name))
            .or_insert_with(|| value.to_string());
        self
    }
}

impl Marshal for HttpResponse {
    fn marshal(&self, _registry: &HandleRegistry) -> Value {
        let header = Value::map(
            self.header
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str()))),
        );
        Value::map([
            ("code", Value::Integer(i64::from(self.code))),
            ("status", Value::from(self.status.as_str())),
            ("header", header),
            ("body", Value::Bytes(self.body.clone())),
        ])
    }
}

/// Strategy that executes one request
pub trait HttpTransport: Send + Sync {
    /// Run `request` to completion
    ///
    /// Implementations check `cancel` at their I/O boundaries and return
    /// [`BridgeError::Cancelled`] once they notice it.
    fn execute(&self, request: &HttpRequest, cancel: &CancelToken) -> BridgeResult<HttpResponse>;
}

/// Canonical MIME header form: `content-type` becomes `Content-Type`
///
/// Names containing characters outside the token set are returned unchanged.
pub fn canonical_header_key(name: &str) -> String {
    if !super::valid_header_name(name) {
        return name.to_string();
    }
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn status_line(code: u16, reason: &str) -> String {
    if reason.is_empty() {
        code.to_string()
    } else {
        format!("{} {}", code, reason)
    }
}

/// Default transport backed by a `ureq::Agent`
pub struct UreqTransport {
    agent: ureq::Agent,
    max_body_bytes: usize,
}

impl UreqTransport {
    pub fn new(config: &HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(&config.user_agent)
            .build();
        Self {
            agent,
            max_body_bytes: config.max_body_bytes,
        }
    }

    fn read_body(&self, response: ureq::Response, cancel: &CancelToken) -> BridgeResult<Vec<u8>> {
        let mut reader = response.into_reader();
        let mut body = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            let n = match reader.read(&mut chunk) {
                Ok(0) => return Ok(body),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(BridgeError::transport(e)),
            };
            if self.max_body_bytes > 0 && body.len() + n > self.max_body_bytes {
                return Err(BridgeError::Transport(format!(
                    "response body exceeds {} bytes",
                    self.max_body_bytes
                )));
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }
}

impl HttpTransport for UreqTransport {
    fn execute(&self, request: &HttpRequest, cancel: &CancelToken) -> BridgeResult<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let mut call = self.agent.request_url(&request.method, &request.url);
        for (name, value) in &request.header {
            call = call.set(name, value);
        }
        let outcome = match &request.body {
            Some(body) => call.send_bytes(body),
            None => call.call(),
        };
        let response = match outcome {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(err)) => {
                if cancel.is_cancelled() {
                    return Err(BridgeError::Cancelled);
                }
                return Err(BridgeError::transport(err));
            }
        };

        let code = response.status();
        let status = status_line(code, response.status_text());
        let mut header = BTreeMap::new();
        for name in response.headers_names() {
            if let Some(value) = response.header(&name) {
                header
                    .entry(canonical_header_key(&name))
                    .or_insert_with(|| value.to_string());
            }
        }
        let body = self.read_body(response, cancel)?;

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            code,
            bytes = body.len(),
            "request completed"
        );
        Ok(HttpResponse {
            code,
            status,
            header,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("X-REQUEST-ID"), "X-Request-Id");
        assert_eq!(canonical_header_key("etag"), "Etag");
        assert_eq!(canonical_header_key("bad header"), "bad header");
    }

    #[test]
    fn test_status_line() {
        assert_eq!(status_line(200, "OK"), "200 OK");
        assert_eq!(status_line(599, ""), "599");
    }

    #[test]
    fn test_response_marshal() {
        let registry = HandleRegistry::new();
        let response =
            HttpResponse::new(200, "OK", "hi").with_header("content-type", "text/plain");
        let value = response.marshal(&registry);

        assert_eq!(value.get("code"), Some(&Value::Integer(200)));
        assert_eq!(value.get("status").and_then(Value::as_str), Some("200 OK"));
        assert_eq!(value.get("body").and_then(Value::as_bytes), Some(&b"hi"[..]));
        let header = value.get("header").unwrap();
        assert_eq!(
            header.get("Content-Type").and_then(Value::as_str),
            Some("text/plain")
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancelled_before_start() {
        let transport = UreqTransport::new(&HttpConfig::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let request = HttpRequest {
            method: "GET".to_string(),
            url: Url::parse("http://127.0.0.1:9/").unwrap(),
            header: BTreeMap::new(),
            body: None,
        };
        assert_eq!(
            transport.execute(&request, &cancel),
            Err(BridgeError::Cancelled)
        );
    }
}
