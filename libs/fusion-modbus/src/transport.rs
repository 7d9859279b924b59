//! Byte-stream transports
//!
//! The engine only needs three primitives from a connected stream: a blocking
//! `read(n)`, a non-blocking `try_read(n)` and `write`. Channel security is handled
//! before a stream reaches this layer.
//!
//! - [`TcpTransport`]: plain `std::net::TcpStream`
//! - [`MemoryTransport`]: in-process pipe used by tests and simulations

use crate::error::{ModbusError, ModbusResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Connected byte stream
///
/// Implementations synchronize internally so one thread can read while another writes.
pub trait Transport: Send + Sync {
    /// Block until exactly `n` bytes are available
    fn read(&self, n: usize) -> ModbusResult<Vec<u8>>;

    /// Return `n` bytes if they are already available, `None` otherwise
    fn try_read(&self, n: usize) -> ModbusResult<Option<Vec<u8>>>;

    /// Write all bytes
    fn write(&self, bytes: &[u8]) -> ModbusResult<()>;
}

// ============================================================================
// TCP
// ============================================================================

/// How long `try_read` waits for the first byte before reporting "nothing yet"
const TRY_READ_POLL: Duration = Duration::from_millis(1);

/// Upper bound for the reconnect backoff
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Plain TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Wrap an already connected stream
    pub fn new(stream: TcpStream) -> ModbusResult<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            peer,
        })
    }

    /// Connect once
    pub fn connect(address: impl ToSocketAddrs) -> ModbusResult<Self> {
        let stream = TcpStream::connect(address)?;
        Self::new(stream)
    }

    /// Connect with exponential backoff between attempts
    ///
    /// `retries` is the number of additional attempts after the first one.
    pub fn connect_with_retry(
        address: &str,
        retries: u32,
        backoff: Duration,
    ) -> ModbusResult<Self> {
        let mut delay = backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("Connecting to {} (attempt #{})", address, attempt);
            match Self::connect(address) {
                Ok(transport) => {
                    info!("Connected to {}", transport.peer);
                    return Ok(transport);
                },
                Err(e) if attempt <= retries => {
                    warn!(
                        "Connection to {} failed: {}, retrying in {:?}",
                        address, e, delay
                    );
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(MAX_BACKOFF);
                },
                Err(e) => {
                    warn!("Giving up on {} after {} attempts: {}", address, attempt, e);
                    return Err(e);
                },
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Shut down both directions, unblocking any pending read
    pub fn shutdown(&self) {
        if let Err(e) = self.writer.lock().shutdown(std::net::Shutdown::Both) {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }
}

impl Transport for TcpTransport {
    fn read(&self, n: usize) -> ModbusResult<Vec<u8>> {
        let mut stream = self.reader.lock();
        stream.set_read_timeout(None)?;
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn try_read(&self, n: usize) -> ModbusResult<Option<Vec<u8>>> {
        let mut stream = self.reader.lock();
        stream.set_read_timeout(Some(TRY_READ_POLL))?;
        let mut buf = vec![0u8; n];
        let available = match stream.peek(&mut buf) {
            Ok(0) => {
                return Err(ModbusError::ConnectionClosed(format!(
                    "{} closed the connection",
                    self.peer
                )))
            },
            Ok(available) => available,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None)
            },
            Err(e) => return Err(e.into()),
        };
        if available < n {
            return Ok(None);
        }
        stream.set_read_timeout(None)?;
        stream.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn write(&self, bytes: &[u8]) -> ModbusResult<()> {
        let mut stream = self.writer.lock();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }
}

// ============================================================================
// In-memory pipe
// ============================================================================

#[derive(Debug, Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) -> ModbusResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ModbusError::ConnectionClosed("pipe closed".to_string()));
        }
        state.data.extend(bytes);
        self.readable.notify_all();
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_all();
    }
}

/// In-memory transport
///
/// A standalone instance exposes its incoming and outgoing buffers through
/// [`push_incoming`](Self::push_incoming) and [`take_outgoing`](Self::take_outgoing).
/// [`MemoryTransport::pair`] cross-wires two instances into a full-duplex link.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            incoming: Arc::new(Pipe::default()),
            outgoing: Arc::new(Pipe::default()),
        }
    }

    /// Two transports where each one's writes are the other's reads
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        (
            Self {
                incoming: b_to_a.clone(),
                outgoing: a_to_b.clone(),
            },
            Self {
                incoming: a_to_b,
                outgoing: b_to_a,
            },
        )
    }

    /// Queue bytes for the next read
    pub fn push_incoming(&self, bytes: &[u8]) {
        // A closed pipe drops late data, same as a dead socket
        if self.incoming.push(bytes).is_err() {
            trace!("Dropping {} bytes pushed into closed transport", bytes.len());
        }
    }

    /// Drain everything written so far
    pub fn take_outgoing(&self) -> Vec<u8> {
        let mut state = self.outgoing.state.lock();
        state.data.drain(..).collect()
    }

    /// Wait until at least `n` bytes have been written, then drain them all
    pub fn wait_outgoing(&self, n: usize, timeout: Duration) -> Vec<u8> {
        let mut state = self.outgoing.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while state.data.len() < n {
            if self
                .outgoing
                .readable
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.data.drain(..).collect()
    }

    /// Close both directions; blocked readers fail with `ConnectionClosed`
    pub fn close(&self) {
        self.incoming.close();
        self.outgoing.close();
    }
}

impl Transport for MemoryTransport {
    fn read(&self, n: usize) -> ModbusResult<Vec<u8>> {
        let mut state = self.incoming.state.lock();
        while state.data.len() < n {
            if state.closed {
                return Err(ModbusError::ConnectionClosed("pipe closed".to_string()));
            }
            self.incoming.readable.wait(&mut state);
        }
        Ok(state.data.drain(..n).collect())
    }

    fn try_read(&self, n: usize) -> ModbusResult<Option<Vec<u8>>> {
        let mut state = self.incoming.state.lock();
        if state.data.len() >= n {
            return Ok(Some(state.data.drain(..n).collect()));
        }
        if state.closed {
            return Err(ModbusError::ConnectionClosed("pipe closed".to_string()));
        }
        Ok(None)
    }

    fn write(&self, bytes: &[u8]) -> ModbusResult<()> {
        self.outgoing.push(bytes)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;

    #[test]
    fn test_try_read_waits_for_complete_chunk() {
        let transport = MemoryTransport::new();
        transport.push_incoming(&[1, 2, 3]);
        assert_eq!(transport.try_read(4).unwrap(), None);
        transport.push_incoming(&[4, 5]);
        assert_eq!(transport.try_read(4).unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(transport.read(1).unwrap(), vec![5]);
    }

    #[test]
    fn test_pair_is_full_duplex() {
        let (a, b) = MemoryTransport::pair();
        a.write(&[0xAA, 0xBB]).unwrap();
        b.write(&[0xCC]).unwrap();
        assert_eq!(b.read(2).unwrap(), vec![0xAA, 0xBB]);
        assert_eq!(a.read(1).unwrap(), vec![0xCC]);
    }

    #[test]
    fn test_close_unblocks_reader() {
        let transport = MemoryTransport::new();
        let reader = transport.clone();
        let handle = std::thread::spawn(move || reader.read(7));
        std::thread::sleep(Duration::from_millis(20));
        transport.close();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(ModbusError::ConnectionClosed(_))));
    }

    #[test]
    fn test_tcp_transport_exchanges_bytes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let transport =
            TcpTransport::connect_with_retry(&address, 2, Duration::from_millis(10)).unwrap();
        transport.write(&[7, 8, 9]).unwrap();
        assert_eq!(transport.read(3).unwrap(), vec![7, 8, 9]);
        server.join().unwrap();
    }
}
