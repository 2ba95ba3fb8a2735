//! Socket ownership and the byte-level read/write pumps.
//!
//! The I/O worker is the only thread that ever touches the [`Transport`].
//! Connecting happens in blocking mode with a bounded timeout; the stream is
//! switched to non-blocking before it is registered with the worker's poll.

#[cfg(feature = "rustls")]
#[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
pub(crate) mod tls;

use std::io::{self, Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use tracing::debug;

use crate::connection::options::ConnectionOptions;
use crate::error::{Error, Result};
use crate::frames::buffer::FrameBuffer;

pub(crate) const READ_CHUNK: usize = 16 * 1024;

/// Counters the heartbeat monitor reads without talking to the worker.
#[derive(Debug)]
pub(crate) struct TransportStats {
    bytes_written: AtomicU64,
    last_received: Mutex<Instant>,
}

impl TransportStats {
    pub(crate) fn new() -> Self {
        Self {
            bytes_written: AtomicU64::new(0),
            last_received: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn touch_received(&self) {
        *self.last_received.lock() = Instant::now();
    }

    pub(crate) fn since_last_received(&self) -> Duration {
        self.last_received.lock().elapsed()
    }
}

/// What a read pump observed.
#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    /// Plaintext bytes appended to the frame buffer
    pub(crate) bytes: usize,
    /// The peer closed its end of the stream
    pub(crate) closed: bool,
}

/// The connected stream, plain or TLS-wrapped.
#[derive(Debug)]
pub(crate) enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "rustls")]
    Tls(Box<tls::TlsTransport>),
}

/// Resolve and connect with the configured timeout, enable `TCP_NODELAY`,
/// and wrap in TLS when the URL scheme asked for it.
pub(crate) fn connect(options: &ConnectionOptions) -> Result<Transport> {
    let addrs: Vec<_> = (options.host.as_str(), options.port)
        .to_socket_addrs()?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses resolved for {}:{}", options.host, options.port),
        )));
    }

    let mut last_err = None;
    let mut connected = None;
    for addr in addrs {
        match StdTcpStream::connect_timeout(&addr, options.timeout) {
            Ok(stream) => {
                debug!(%addr, "connected");
                connected = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let stream = match connected {
        Some(stream) => stream,
        None => return Err(Error::Io(last_err.expect("at least one address attempted"))),
    };

    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(stream);

    if options.tls {
        #[cfg(feature = "rustls")]
        {
            return Ok(Transport::Tls(Box::new(tls::TlsTransport::new(
                stream, options,
            )?)));
        }
        #[cfg(not(feature = "rustls"))]
        return Err(Error::TlsDisabled);
    }
    Ok(Transport::Plain(stream))
}

impl Transport {
    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            self.socket_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            #[cfg(feature = "rustls")]
            Transport::Tls(tls) => tls.socket_mut(),
        }
    }

    /// Pump available bytes off the socket into the frame buffer until the
    /// socket would block.
    pub(crate) fn read_into(&mut self, buffer: &mut FrameBuffer) -> Result<ReadOutcome> {
        match self {
            Transport::Plain(stream) => {
                let mut outcome = ReadOutcome::default();
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => {
                            outcome.closed = true;
                            return Ok(outcome);
                        }
                        Ok(n) => {
                            buffer.extend(&chunk[..n]);
                            outcome.bytes += n;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(outcome),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            #[cfg(feature = "rustls")]
            Transport::Tls(tls) => tls.read_into(buffer),
        }
    }

    /// Hand outbound bytes to the stream. Returns how many were accepted;
    /// zero means backpressure and the caller should retry after the next
    /// writable event.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self {
            Transport::Plain(stream) => loop {
                match stream.write(data) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            #[cfg(feature = "rustls")]
            Transport::Tls(tls) => tls.write(data),
        }
    }

    /// Flush protocol bytes the stream itself generated, e.g. TLS handshake
    /// records. A plain stream has none.
    pub(crate) fn flush_pending(&mut self) -> Result<()> {
        match self {
            Transport::Plain(_) => Ok(()),
            #[cfg(feature = "rustls")]
            Transport::Tls(tls) => tls.flush_pending(),
        }
    }
}
