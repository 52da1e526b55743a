//! In-process frame transport
//!
//! [`pair`] returns a transport for a [`StreamConnection`](super::StreamConnection)
//! and the peer end a host (or a test) uses to play the remote side.
//! [`echo`] returns a transport whose peer sends every frame straight back.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::FrameTransport;
use crate::error::{BridgeError, BridgeResult};
use crate::task::Signal;

/// Receive error once the peer has gone away
pub const EOF: &str = "EOF";

/// Error for I/O on a transport that was closed locally
pub const USE_OF_CLOSED: &str = "use of closed network connection";

struct Link {
    closed: Signal,
    send_failure: Mutex<Option<String>>,
}

/// Connection side of an in-process pipe
pub struct MemoryTransport {
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<Vec<u8>>,
    link: Arc<Link>,
}

/// Remote side of an in-process pipe
pub struct MemoryPeer {
    to_conn: Sender<Vec<u8>>,
    from_conn: Receiver<Vec<u8>>,
    link: Arc<Link>,
}

/// Create a connected transport/peer pair
pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let (to_conn, inbound) = unbounded();
    let (outbound, from_conn) = unbounded();
    let link = Arc::new(Link {
        closed: Signal::new(),
        send_failure: Mutex::new(None),
    });
    (
        MemoryTransport {
            outbound,
            inbound,
            link: Arc::clone(&link),
        },
        MemoryPeer {
            to_conn,
            from_conn,
            link,
        },
    )
}

/// Transport whose peer echoes every frame back
///
/// The echo thread exits when the transport is closed or dropped.
pub fn echo() -> MemoryTransport {
    let (transport, peer) = pair();
    let spawned = thread::Builder::new()
        .name("scriptlink-echo".to_string())
        .spawn(move || loop {
            let frame = select! {
                recv(peer.link.closed.receiver()) -> _ => None,
                recv(peer.from_conn) -> msg => msg.ok(),
            };
            match frame {
                Some(frame) => peer.push(frame),
                None => break,
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "failed to start echo peer");
    }
    transport
}

impl FrameTransport for MemoryTransport {
    fn send(&self, frame: &[u8]) -> BridgeResult<()> {
        if self.link.closed.is_raised() {
            return Err(BridgeError::transport(USE_OF_CLOSED));
        }
        if let Some(msg) = self.link.send_failure.lock().as_ref() {
            return Err(BridgeError::transport(msg));
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| BridgeError::transport(EOF))
    }

    fn receive(&self, timeout: Duration) -> BridgeResult<Option<Vec<u8>>> {
        if self.link.closed.is_raised() {
            return Err(BridgeError::transport(USE_OF_CLOSED));
        }
        let outcome = select! {
            recv(self.link.closed.receiver()) -> _ => None,
            recv(self.inbound) -> msg => Some(msg.map_err(|_| RecvTimeoutError::Disconnected)),
            default(timeout) => Some(Err(RecvTimeoutError::Timeout)),
        };
        match outcome {
            None => Err(BridgeError::transport(USE_OF_CLOSED)),
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(RecvTimeoutError::Timeout)) => Ok(None),
            Some(Err(RecvTimeoutError::Disconnected)) => Err(BridgeError::transport(EOF)),
        }
    }

    fn close(&self) {
        self.link.closed.raise();
    }
}

impl MemoryPeer {
    /// Deliver a frame to the connection
    pub fn push(&self, frame: Vec<u8>) {
        let _ = self.to_conn.send(frame);
    }

    /// Wait for the next frame the connection sent
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.from_conn.recv_timeout(timeout).ok()
    }

    /// Whether the connection side closed the transport
    pub fn is_closed(&self) -> bool {
        self.link.closed.is_raised()
    }

    /// Make every later send on the transport fail with `msg`
    pub fn fail_sends(&self, msg: &str) {
        *self.link.send_failure.lock() = Some(msg.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_moves_frames_both_ways() {
        let (transport, peer) = pair();
        transport.send(b"up").unwrap();
        assert_eq!(peer.recv_timeout(Duration::from_secs(1)).unwrap(), b"up");

        peer.push(b"down".to_vec());
        assert_eq!(
            transport.receive(Duration::from_secs(1)).unwrap(),
            Some(b"down".to_vec())
        );
        assert_eq!(transport.receive(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_close_and_hangup() {
        let (transport, peer) = pair();
        drop(peer);
        assert_eq!(
            transport.receive(Duration::from_secs(1)),
            Err(BridgeError::transport(EOF))
        );
        transport.close();
        assert_eq!(
            transport.send(b"x"),
            Err(BridgeError::transport(USE_OF_CLOSED))
        );
    }

    #[test]
    fn test_echo() {
        let transport = echo();
        transport.send(b"ping").unwrap();
        assert_eq!(
            transport.receive(Duration::from_secs(5)).unwrap(),
            Some(b"ping".to_vec())
        );
        transport.close();
    }
}
