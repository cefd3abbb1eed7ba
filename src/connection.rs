// Copyright 2020 Joyent, Inc.

//! One live duplex socket bound to one endpoint.
//!
//! The socket sits behind the [`Transport`] trait so the same
//! [`Connection`] drives a rustls stream in production, plain TCP on
//! trusted networks, or an in-memory double in tests. A shared
//! [`ConnectionControl`] lets another thread close the socket while a
//! read or write is blocked on it, which is how calls get cancelled.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use slog::{debug, Logger};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Read timeout used by the extensive health probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A byte stream a [`Connection`] can run over.
pub trait Transport: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    fn read_timeout(&self) -> io::Result<Option<Duration>>;

    /// A handle that can shut the underlying socket down from another
    /// thread.
    fn shutdown_handle(&self) -> io::Result<Box<dyn ShutdownHandle>>;
}

pub trait ShutdownHandle: Send + Sync {
    fn shutdown(&self) -> io::Result<()>;
}

impl ShutdownHandle for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl Transport for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        TcpStream::read_timeout(self)
    }

    fn shutdown_handle(&self) -> io::Result<Box<dyn ShutdownHandle>> {
        Ok(Box::new(self.try_clone()?))
    }
}

impl Transport for StreamOwned<ClientConnection, TcpStream> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_write_timeout(timeout)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        self.sock.read_timeout()
    }

    fn shutdown_handle(&self) -> io::Result<Box<dyn ShutdownHandle>> {
        Ok(Box::new(self.sock.try_clone()?))
    }
}

/// Opens transports to endpoints.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Box<dyn Transport>>;
}

/// TLS over TCP. The server certificate is verified against the endpoint
/// host name by rustls during the handshake.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new(config: Arc<ClientConfig>) -> TlsConnector {
        TlsConnector { config }
    }

    /// A connector trusting exactly the given roots, without client
    /// authentication.
    pub fn with_root_certificates(roots: rustls::RootCertStore) -> TlsConnector {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::new(Arc::new(config))
    }
}

impl Connector for TlsConnector {
    fn connect(&self, endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Box<dyn Transport>> {
        let server_name = ServerName::try_from(endpoint.host().to_string()).map_err(|_| {
            Error::Config(format!("{} is not a valid TLS server name", endpoint.host()))
        })?;
        let sock = connect_tcp(endpoint, timeout)?;
        // The handshake runs under the connect timeout; the caller applies
        // its own read/write timeouts afterwards.
        sock.set_read_timeout(timeout)?;
        sock.set_write_timeout(timeout)?;

        let conn = ClientConnection::new(Arc::clone(&self.config), server_name)?;
        let mut stream = StreamOwned::new(conn, sock);
        // Both halves are dropped (and the socket closed) on any error here.
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock)?;
        }
        Ok(Box::new(stream))
    }
}

/// Unencrypted TCP, for tests and trusted networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainConnector;

impl Connector for PlainConnector {
    fn connect(&self, endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Box<dyn Transport>> {
        Ok(Box::new(connect_tcp(endpoint, timeout)?))
    }
}

fn connect_tcp(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<TcpStream> {
    let addrs = (endpoint.host(), endpoint.port()).to_socket_addrs()?;
    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::Io(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} resolved to no addresses", endpoint),
        )
    })))
}

/// Close state shared between a connection and whoever may need to abort
/// it from another thread.
pub struct ConnectionControl {
    closed: AtomicBool,
    shutdown: Box<dyn ShutdownHandle>,
}

impl ConnectionControl {
    /// Shuts the socket down once. Later calls do nothing.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    stream: BufReader<Box<dyn Transport>>,
    control: Arc<ConnectionControl>,
    idle_since: Option<Instant>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Connection {
    /// Opens a connection through `connector`. A `Connection` only exists
    /// connected; on failure whatever was opened has already been closed.
    pub fn connect(
        endpoint: &Endpoint,
        connector: &dyn Connector,
        timeout: Option<Duration>,
        log: &Logger,
    ) -> Result<Connection> {
        let transport = connector.connect(endpoint, timeout)?;
        let conn = Connection::new(endpoint.clone(), transport)?;
        debug!(log, "connected"; "endpoint" => %endpoint, "connection" => conn.id);
        Ok(conn)
    }

    /// Wraps an already open transport.
    pub fn new(endpoint: Endpoint, transport: Box<dyn Transport>) -> Result<Connection> {
        let control = ConnectionControl {
            closed: AtomicBool::new(false),
            shutdown: transport.shutdown_handle()?,
        };
        Ok(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            stream: BufReader::with_capacity(READ_BUFFER_SIZE, transport),
            control: Arc::new(control),
            idle_since: None,
            read_timeout: None,
            write_timeout: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Buffered read side.
    pub fn reader(&mut self) -> &mut BufReader<Box<dyn Transport>> {
        &mut self.stream
    }

    /// Write side. Callers hand it whole encoded frames.
    pub fn writer(&mut self) -> &mut dyn Transport {
        self.stream.get_mut().as_mut()
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.get_mut().set_read_timeout(timeout)?;
        self.read_timeout = timeout;
        Ok(())
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.get_mut().set_write_timeout(timeout)?;
        self.write_timeout = timeout;
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub(crate) fn mark_idle(&mut self, now: Instant) {
        self.idle_since = Some(now);
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.idle_since = None;
    }

    /// When this connection entered the pool, if it is idle.
    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    pub(crate) fn control(&self) -> Arc<ConnectionControl> {
        Arc::clone(&self.control)
    }

    /// The cheap check only looks at the close flag. The extensive check
    /// also probes the socket for a millisecond: end of stream means the
    /// peer closed its side, and unread bytes mean the stream is no longer
    /// at a response boundary. Either makes the connection unusable.
    pub fn is_healthy(&mut self, extensive: bool) -> bool {
        if self.control.is_closed() {
            return false;
        }
        if !extensive {
            return true;
        }
        if !self.stream.buffer().is_empty() {
            return false;
        }

        let original = match self.stream.get_ref().read_timeout() {
            Ok(t) => t,
            Err(_) => return false,
        };
        if self
            .stream
            .get_mut()
            .set_read_timeout(Some(HEALTH_PROBE_TIMEOUT))
            .is_err()
        {
            return false;
        }
        let healthy = match self.stream.fill_buf() {
            Ok(_) => false,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                true
            }
            Err(_) => false,
        };
        let restored = self.stream.get_mut().set_read_timeout(original).is_ok();
        healthy && restored
    }

    pub fn close(&self) {
        self.control.close();
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.control.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .field("idle_since", &self.idle_since)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use std::net::TcpListener;
    use std::thread;

    fn mock_connection() -> (Connection, MockTransport) {
        let transport = MockTransport::new();
        let conn = Connection::new(Endpoint::new("mock", 1), Box::new(transport.clone())).unwrap();
        (conn, transport)
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, transport) = mock_connection();
        assert!(!conn.is_closed());
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(transport.shutdown_count(), 1);
    }

    #[test]
    fn drop_closes() {
        let (conn, transport) = mock_connection();
        drop(conn);
        assert_eq!(transport.shutdown_count(), 1);
    }

    #[test]
    fn quiet_open_peer_is_healthy() {
        let (mut conn, _transport) = mock_connection();
        assert!(conn.is_healthy(false));
        assert!(conn.is_healthy(true));
    }

    #[test]
    fn half_closed_peer_is_unhealthy() {
        let (mut conn, transport) = mock_connection();
        transport.close_peer();
        assert!(conn.is_healthy(false));
        assert!(!conn.is_healthy(true));
    }

    #[test]
    fn stray_bytes_are_unhealthy() {
        let (mut conn, transport) = mock_connection();
        transport.push_incoming(&[1, 2, 3]);
        assert!(!conn.is_healthy(true));
    }

    #[test]
    fn closed_is_unhealthy() {
        let (mut conn, _transport) = mock_connection();
        conn.close();
        assert!(!conn.is_healthy(false));
    }

    #[test]
    fn health_probe_restores_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || listener.accept().map(|(s, _)| s));

        let log = Logger::root(slog::Discard, slog::o!());
        let ep = Endpoint::new("127.0.0.1", port);
        let mut conn = Connection::connect(&ep, &PlainConnector, Some(Duration::from_secs(2)), &log)
            .unwrap();
        let _peer = server.join().unwrap().unwrap();

        conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        assert!(conn.is_healthy(true));
        assert_eq!(
            conn.reader().get_ref().read_timeout().unwrap(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn plain_connect_failure_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let log = Logger::root(slog::Discard, slog::o!());
        let ep = Endpoint::new("127.0.0.1", port);
        let res = Connection::connect(&ep, &PlainConnector, Some(Duration::from_secs(1)), &log);
        assert!(matches!(res, Err(Error::Io(_))));
    }
}
