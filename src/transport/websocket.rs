//! Duplex stream transport over WebSocket
//!
//! The socket is shared by a connection's reader and writer loops through a
//! mutex. Reads and writes run in short slices, so neither loop holds the
//! lock for longer than one slice and a close is noticed within one slice
//! even when the peer has stopped reading.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::header::ORIGIN;
use tungstenite::http::{HeaderName, HeaderValue};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{HandshakeError, Message, WebSocket};
use url::Url;

use crate::conn::memory::USE_OF_CLOSED;
use crate::conn::FrameTransport;
use crate::error::{BridgeError, BridgeResult};
use crate::task::CancelToken;

const READ_SLICE: Duration = Duration::from_millis(50);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Where and how to open a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTarget {
    pub url: Url,
    pub origin: Option<Url>,
    /// Extra handshake headers, canonical name to value
    pub header: BTreeMap<String, String>,
}

/// Strategy that dials a stream and hands back its frame transport
pub trait StreamConnector: Send + Sync {
    fn connect(
        &self,
        target: &StreamTarget,
        cancel: &CancelToken,
    ) -> BridgeResult<Arc<dyn FrameTransport>>;
}

/// Default connector backed by `tungstenite`
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn dial(&self, url: &Url, cancel: &CancelToken) -> BridgeResult<TcpStream> {
        let host = url
            .host_str()
            .ok_or_else(|| BridgeError::Transport(format!("missing host in {}", url)))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(BridgeError::transport)?;

        let mut last_err = None;
        for addr in addrs {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => BridgeError::Transport(format!("dial tcp {}:{}: {}", host, port, e)),
            None => BridgeError::Transport(format!("no addresses for {}", host)),
        })
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Map `http`/`https` onto `ws`/`wss`; other schemes are left alone
pub fn websocket_url(url: &Url) -> Url {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return url.clone(),
    };
    let mut mapped = url.clone();
    // Both schemes are "special", so the switch cannot fail.
    let _ = mapped.set_scheme(scheme);
    mapped
}

impl StreamConnector for WebSocketConnector {
    fn connect(
        &self,
        target: &StreamTarget,
        cancel: &CancelToken,
    ) -> BridgeResult<Arc<dyn FrameTransport>> {
        let url = websocket_url(&target.url);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(BridgeError::transport)?;
        {
            let headers = request.headers_mut();
            if let Some(origin) = &target.origin {
                let value = HeaderValue::from_str(&origin.origin().ascii_serialization())
                    .map_err(|_| BridgeError::malformed("invalid origin argument"))?;
                headers.insert(ORIGIN, value);
            }
            for (name, value) in &target.header {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| BridgeError::malformed(format!("invalid header {}", name)))?;
                let value = HeaderValue::from_str(value).map_err(|_| {
                    BridgeError::malformed(format!("invalid header {}", name.as_str()))
                })?;
                headers.insert(name, value);
            }
        }

        let stream = self.dial(&url, cancel)?;
        stream
            .set_read_timeout(Some(self.connect_timeout))
            .map_err(BridgeError::transport)?;
        let (socket, _response) = match tungstenite::client_tls(request, stream) {
            Ok(pair) => pair,
            Err(HandshakeError::Interrupted(_)) => {
                return Err(BridgeError::Transport(format!(
                    "websocket handshake with {} timed out",
                    url
                )))
            }
            Err(HandshakeError::Failure(err)) => return Err(BridgeError::transport(err)),
        };
        set_slice_timeouts(&socket).map_err(BridgeError::transport)?;

        tracing::debug!(%url, "websocket connected");
        Ok(Arc::new(WsFrameTransport::new(socket)))
    }
}

fn tcp_stream(socket: &Socket) -> Option<&TcpStream> {
    match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => Some(stream),
        MaybeTlsStream::Rustls(stream) => Some(stream.get_ref()),
        _ => None,
    }
}

/// Bound every socket read and write to one slice
fn set_slice_timeouts(socket: &Socket) -> std::io::Result<()> {
    match tcp_stream(socket) {
        Some(stream) => {
            stream.set_read_timeout(Some(READ_SLICE))?;
            stream.set_write_timeout(Some(READ_SLICE))
        }
        None => Ok(()),
    }
}

fn is_retryable(err: &tungstenite::Error) -> bool {
    let tungstenite::Error::Io(e) = err else {
        return false;
    };
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

fn closed_error() -> BridgeError {
    BridgeError::transport(USE_OF_CLOSED)
}

/// Send the close frame and shut the TCP stream down, once
///
/// The close frame is best effort: its write is bounded by the socket's
/// write timeout.
fn shut_down(shut: &AtomicBool, socket: &mut Socket) {
    if shut.swap(true, Ordering::AcqRel) {
        return;
    }
    let _ = socket.close(None);
    let _ = socket.flush();
    if let Some(stream) = tcp_stream(socket) {
        let _ = stream.shutdown(Shutdown::Both);
    }
    tracing::debug!("websocket shut down");
}

/// Frame transport over an established WebSocket
///
/// `close` never waits for the socket lock. If a reader slice or a stalled
/// send holds it, the holder sees the closing flag within one slice and
/// shuts the socket down itself.
pub struct WsFrameTransport {
    socket: Mutex<Socket>,
    closing: AtomicBool,
    shut: AtomicBool,
}

impl WsFrameTransport {
    fn new(socket: Socket) -> Self {
        Self {
            socket: Mutex::new(socket),
            closing: AtomicBool::new(false),
            shut: AtomicBool::new(false),
        }
    }

    /// Finish a requested close while holding the lock
    fn check_closing(&self, socket: &mut Socket) -> BridgeResult<()> {
        if self.closing.load(Ordering::Acquire) {
            shut_down(&self.shut, socket);
            return Err(closed_error());
        }
        Ok(())
    }
}

impl FrameTransport for WsFrameTransport {
    fn send(&self, frame: &[u8]) -> BridgeResult<()> {
        let mut socket = self.socket.lock();
        self.check_closing(&mut socket)?;
        let mut result = socket.send(Message::binary(frame.to_vec()));
        loop {
            match result {
                Ok(()) => return Ok(()),
                Err(err) if is_retryable(&err) => {}
                Err(err) => return Err(BridgeError::transport(err)),
            }
            self.check_closing(&mut socket)?;
            // The frame is buffered inside the socket; flushing resumes it.
            MutexGuard::unlock_fair(socket);
            socket = self.socket.lock();
            result = socket.flush();
        }
    }

    fn receive(&self, timeout: Duration) -> BridgeResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut socket = self.socket.lock();
            self.check_closing(&mut socket)?;
            match socket.read() {
                Ok(msg @ (Message::Binary(_) | Message::Text(_))) => {
                    return Ok(Some(msg.into_data().to_vec()));
                }
                // Control frames; replies are queued by the library.
                Ok(_) => {
                    let _ = socket.flush();
                }
                Err(err) if is_retryable(&err) => {}
                Err(err) => return Err(BridgeError::transport(err)),
            }
            // Hand the lock to a waiting writer before the next slice.
            MutexGuard::unlock_fair(socket);
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn close(&self) {
        self.closing.store(true, Ordering::Release);
        if let Some(mut socket) = self.socket.try_lock() {
            shut_down(&self.shut, &mut socket);
        }
    }
}

impl Drop for WsFrameTransport {
    fn drop(&mut self) {
        shut_down(&self.shut, self.socket.get_mut());
    }
}
