//! Stream connection: one reader loop and one writer loop per transport

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

use super::{Connection, FrameTransport, ReadBatch};
use crate::error::{BridgeError, BridgeResult};
use crate::task::Signal;

static CONN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Tuning for the background loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Upper bound of a single receive attempt
    pub receive_timeout: Duration,
    /// Receive queue cap; 0 means unbounded
    pub max_queued_frames: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(5000),
            max_queued_frames: 0,
        }
    }
}

#[derive(Default)]
struct Queue {
    frames: Vec<Vec<u8>>,
    error: Option<BridgeError>,
}

impl Queue {
    /// Store the first error only
    fn fail(&mut self, err: BridgeError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

struct Shared {
    id: u64,
    config: StreamConfig,
    transport: Arc<dyn FrameTransport>,
    send: Mutex<Queue>,
    recv: Mutex<Queue>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    drained_tx: Sender<()>,
    drained_rx: Receiver<()>,
    closed: Signal,
    running: AtomicUsize,
    stopped: Signal,
}

impl Shared {
    fn loop_exited(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stopped.raise();
            tracing::debug!(conn = self.id, "connection loops stopped");
        }
    }

    /// Block the reader while the receive queue is at its cap
    ///
    /// Returns `false` if the connection was closed while waiting.
    fn wait_for_room(&self) -> bool {
        let cap = self.config.max_queued_frames;
        if cap == 0 {
            return true;
        }
        loop {
            if self.recv.lock().frames.len() < cap {
                return true;
            }
            let closed = select! {
                recv(self.closed.receiver()) -> _ => true,
                recv(self.drained_rx) -> _ => false,
                default(self.config.receive_timeout) => false,
            };
            if closed {
                return false;
            }
        }
    }
}

/// A connection driven by a reader loop and a writer loop
///
/// Both loops hold the shared state; it is freed once the close signal has
/// been raised and both have exited.
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl StreamConnection {
    /// Start both loops over `transport`
    pub fn start(
        transport: Arc<dyn FrameTransport>,
        config: StreamConfig,
    ) -> BridgeResult<StreamConnection> {
        let (wake_tx, wake_rx) = bounded(1);
        let (drained_tx, drained_rx) = bounded(1);
        let shared = Arc::new(Shared {
            id: CONN_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            config,
            transport,
            send: Mutex::new(Queue::default()),
            recv: Mutex::new(Queue::default()),
            wake_tx,
            wake_rx,
            drained_tx,
            drained_rx,
            closed: Signal::new(),
            running: AtomicUsize::new(2),
            stopped: Signal::new(),
        });

        let reader = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("scriptlink-reader-{}", shared.id))
            .spawn(move || reader_loop(reader))
            .map_err(|e| {
                shared.transport.close();
                BridgeError::Transport(format!("failed to start connection: {}", e))
            })?;

        let writer = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("scriptlink-writer-{}", shared.id))
            .spawn(move || writer_loop(writer));
        if let Err(e) = spawned {
            // The reader is already running; it exits once the transport is gone.
            shared.closed.raise();
            shared.transport.close();
            shared.loop_exited();
            return Err(BridgeError::Transport(format!(
                "failed to start connection: {}",
                e
            )));
        }

        tracing::debug!(conn = shared.id, "connection started");
        Ok(StreamConnection { shared })
    }

    /// Process-unique connection id, used in thread names and logs
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_raised()
    }

    /// Block until both loops have exited or `timeout` elapses
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.shared.stopped.wait_timeout(timeout)
    }
}

impl Connection for StreamConnection {
    fn read(&self) -> ReadBatch {
        let (frames, error) = {
            let mut recv = self.shared.recv.lock();
            (mem::take(&mut recv.frames), recv.error.clone())
        };
        if !frames.is_empty() && self.shared.config.max_queued_frames > 0 {
            let _ = self.shared.drained_tx.try_send(());
        }
        ReadBatch { frames, error }
    }

    fn write(&self, frames: Vec<Vec<u8>>) -> BridgeResult<()> {
        let mut send = self.shared.send.lock();
        if let Some(err) = &send.error {
            return Err(err.clone());
        }
        if self.shared.closed.is_raised() {
            return Err(BridgeError::Closed);
        }
        if frames.is_empty() {
            return Ok(());
        }
        let was_empty = send.frames.is_empty();
        send.frames.extend(frames);
        drop(send);
        if was_empty {
            // A full wake channel already holds a token for this batch.
            let _ = self.shared.wake_tx.try_send(());
        }
        Ok(())
    }

    fn close(&self) {
        if self.shared.closed.raise() {
            tracing::debug!(conn = self.shared.id, "connection close requested");
            // Unblocks a writer stuck in send; the loops exit on the error.
            self.shared.transport.close();
        }
    }
}

enum WriterExit {
    Closed,
    Failed(BridgeError),
}

fn writer_loop(shared: Arc<Shared>) {
    let exit = 'outer: loop {
        let woken = select! {
            recv(shared.closed.receiver()) -> _ => false,
            recv(shared.wake_rx) -> _ => true,
        };
        if !woken || shared.closed.is_raised() {
            break WriterExit::Closed;
        }

        let frames = mem::take(&mut shared.send.lock().frames);
        for frame in &frames {
            if let Err(err) = shared.transport.send(frame) {
                if shared.closed.is_raised() {
                    break 'outer WriterExit::Closed;
                }
                break 'outer WriterExit::Failed(err);
            }
        }
        tracing::trace!(conn = shared.id, frames = frames.len(), "frames sent");
    };

    match exit {
        WriterExit::Closed => {
            shared.send.lock().fail(BridgeError::Closed);
            tracing::debug!(conn = shared.id, "writer stopped by close");
        }
        WriterExit::Failed(err) => {
            tracing::info!(conn = shared.id, error = %err, "writer stopped by send error");
            shared.send.lock().fail(err);
        }
    }
    shared.transport.close();
    shared.loop_exited();
}

fn reader_loop(shared: Arc<Shared>) {
    let timeout = shared.config.receive_timeout;
    let err = loop {
        if shared.closed.is_raised() || !shared.wait_for_room() {
            break BridgeError::Closed;
        }
        match shared.transport.receive(timeout) {
            Ok(Some(frame)) => shared.recv.lock().frames.push(frame),
            Ok(None) => continue,
            // Closing the transport to stop the loop surfaces as a receive error.
            Err(_) if shared.closed.is_raised() => break BridgeError::Closed,
            Err(err) => break err,
        }
    };

    if err == BridgeError::Closed {
        tracing::debug!(conn = shared.id, "reader stopped by close");
    } else {
        tracing::info!(conn = shared.id, error = %err, "reader stopped by receive error");
    }
    shared.recv.lock().fail(err);
    shared.loop_exited();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::memory::{self, MemoryPeer};

    const WAIT: Duration = Duration::from_secs(10);

    fn fast_config() -> StreamConfig {
        StreamConfig {
            receive_timeout: Duration::from_millis(50),
            max_queued_frames: 0,
        }
    }

    fn start(config: StreamConfig) -> (StreamConnection, MemoryPeer) {
        let (transport, peer) = memory::pair();
        let conn = StreamConnection::start(Arc::new(transport), config).unwrap();
        (conn, peer)
    }

    fn read_until(conn: &StreamConnection, count: usize) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let deadline = std::time::Instant::now() + WAIT;
        while frames.len() < count && std::time::Instant::now() < deadline {
            frames.extend(conn.read().frames);
            thread::sleep(Duration::from_millis(5));
        }
        frames
    }

    #[test]
    fn test_writes_are_sent_in_order() {
        let (conn, peer) = start(fast_config());
        conn.write(vec![b"a".to_vec()]).unwrap();
        conn.write(vec![b"b".to_vec(), b"c".to_vec()]).unwrap();

        assert_eq!(peer.recv_timeout(WAIT).unwrap(), b"a");
        assert_eq!(peer.recv_timeout(WAIT).unwrap(), b"b");
        assert_eq!(peer.recv_timeout(WAIT).unwrap(), b"c");
        conn.close();
    }

    #[test]
    fn test_reads_in_arrival_order_never_twice() {
        let (conn, peer) = start(fast_config());
        assert_eq!(conn.read(), ReadBatch::default());

        peer.push(b"one".to_vec());
        peer.push(b"two".to_vec());
        assert_eq!(read_until(&conn, 2), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(conn.read().frames.is_empty());
        conn.close();
    }

    #[test]
    fn test_close_stops_both_loops() {
        let (conn, peer) = start(StreamConfig::default());
        conn.close();
        conn.close();
        assert!(conn.wait_stopped(WAIT));
        assert!(peer.is_closed());

        assert_eq!(conn.read().error, Some(BridgeError::Closed));
        assert_eq!(conn.write(vec![b"late".to_vec()]), Err(BridgeError::Closed));
    }

    /// Transport whose sends block until it is closed
    struct StalledTransport {
        closed: Signal,
        sends: AtomicUsize,
    }

    impl FrameTransport for StalledTransport {
        fn send(&self, _frame: &[u8]) -> BridgeResult<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.closed.wait_timeout(Duration::from_secs(60));
            Err(BridgeError::transport("write: broken pipe"))
        }

        fn receive(&self, timeout: Duration) -> BridgeResult<Option<Vec<u8>>> {
            if self.closed.wait_timeout(timeout) {
                return Err(BridgeError::transport(memory::USE_OF_CLOSED));
            }
            Ok(None)
        }

        fn close(&self) {
            self.closed.raise();
        }
    }

    #[test]
    fn test_close_unblocks_a_stalled_send() {
        let transport = Arc::new(StalledTransport {
            closed: Signal::new(),
            sends: AtomicUsize::new(0),
        });
        let conn = StreamConnection::start(transport.clone(), StreamConfig::default()).unwrap();
        conn.write(vec![b"stuck".to_vec()]).unwrap();
        let deadline = std::time::Instant::now() + WAIT;
        while transport.sends.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "send never started");
            thread::sleep(Duration::from_millis(1));
        }

        conn.close();
        assert!(transport.closed.is_raised());
        assert!(conn.wait_stopped(WAIT));
        assert_eq!(conn.write(vec![b"late".to_vec()]), Err(BridgeError::Closed));
        assert_eq!(conn.read().error, Some(BridgeError::Closed));
    }

    #[test]
    fn test_peer_hangup_is_sticky_receive_error() {
        let (conn, peer) = start(fast_config());
        peer.push(b"last".to_vec());
        drop(peer);

        let deadline = std::time::Instant::now() + WAIT;
        let mut frames = Vec::new();
        let mut error = None;
        while error.is_none() && std::time::Instant::now() < deadline {
            let batch = conn.read();
            frames.extend(batch.frames);
            error = batch.error;
            thread::sleep(Duration::from_millis(5));
        }
        frames.extend(conn.read().frames);

        assert_eq!(frames, vec![b"last".to_vec()]);
        let err = error.unwrap();
        assert_eq!(err, BridgeError::transport(memory::EOF));
        assert_eq!(conn.read().error, Some(err));
        conn.close();
    }

    #[test]
    fn test_send_failure_is_sticky() {
        let (conn, peer) = start(fast_config());
        peer.fail_sends("broken pipe");
        conn.write(vec![b"x".to_vec()]).unwrap();

        // The writer closes the transport on failure, which also ends the reader.
        assert!(conn.wait_stopped(WAIT));
        assert!(peer.is_closed());
        let err = BridgeError::transport("broken pipe");
        assert_eq!(conn.write(vec![b"y".to_vec()]), Err(err.clone()));
        assert_eq!(conn.write(vec![b"z".to_vec()]), Err(err));
        conn.close();
    }

    #[test]
    fn test_bounded_receive_queue_applies_backpressure() {
        let (conn, peer) = start(StreamConfig {
            receive_timeout: Duration::from_millis(50),
            max_queued_frames: 2,
        });
        for i in 0..5u8 {
            peer.push(vec![i]);
        }

        thread::sleep(Duration::from_millis(200));
        assert_eq!(conn.shared.recv.lock().frames.len(), 2);

        let frames = read_until(&conn, 5);
        assert_eq!(frames, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
        conn.close();
        assert!(conn.wait_stopped(WAIT));
    }
}
