//! Default transport strategies
//!
//! The task bodies only see the [`HttpTransport`] and [`StreamConnector`]
//! traits; hosts and tests can swap in their own implementations.

pub mod http;
pub mod websocket;

pub use http::{canonical_header_key, HttpRequest, HttpResponse, HttpTransport, UreqTransport};
pub use websocket::{StreamConnector, StreamTarget, WebSocketConnector};

/// Whether `name` is a valid header field name (an RFC 7230 token)
pub fn valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// Whether `value` can be sent as a header field value
pub fn valid_header_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_validation() {
        assert!(valid_header_name("X-Request-Id"));
        assert!(!valid_header_name(""));
        assert!(!valid_header_name("bad header"));
        assert!(!valid_header_name("colon:"));
        assert!(valid_header_value("text/plain; charset=utf-8"));
        assert!(!valid_header_value("evil\r\nInjected: 1"));
    }
}
