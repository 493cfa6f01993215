//! Connections, handlers, and the transport upgrade hook.
//!
//! A [`Connection`] is a cheap clonable handle over the shared state of one
//! socket: its buffered bytes and its close progress. The loop owns the
//! socket and the handler; user code talks to the connection handle from
//! callbacks or from any other thread.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::trace;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};

use crate::error::ConnectionError;
use crate::reactor::Inner;

/// User callbacks dispatched by the reactor loop.
///
/// Every callback runs on the loop thread and must not block for long; the
/// loop has no preemption. All callbacks default to no-ops.
///
/// Handlers are `Send` because a handler constructed off the loop thread
/// crosses onto it exactly once at attach time; after that it never leaves.
pub trait Handler: Send {
    /// A client socket finished its non-blocking connect, or an accepted
    /// socket was attached.
    fn on_connect(&mut self, conn: &Connection) {
        let _ = conn;
    }

    /// Bytes arrived. The same bytes are also appended to
    /// [`Connection::received_data`].
    fn on_read(&mut self, conn: &Connection, data: &[u8]) {
        let _ = (conn, data);
    }

    /// The outgoing buffer was flushed to the socket.
    fn on_write(&mut self, conn: &Connection) {
        let _ = conn;
    }

    /// The connection terminated. `reason` is `None` for a locally requested
    /// clean close, otherwise the translated failure. Called at most once.
    fn on_close(&mut self, conn: &Connection, reason: Option<ConnectionError>) {
        let _ = (conn, reason);
    }
}

/// The no-op handler used when the caller has nothing to say.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseHandler;

impl Handler for BaseHandler {}

/// A handler assembled from closures, for callers that would otherwise
/// write a one-off struct per connection.
///
/// # Examples
///
/// ```ignore
/// let client = Hooks::new()
///     .on_connect(|conn| conn.send_data(b"ping"))
///     .on_read(|conn, _| conn.close());
/// reactor.connect_tcp("127.0.0.1", 7000, client)?;
/// ```
#[derive(Default)]
pub struct Hooks {
    connect: Option<Box<dyn FnMut(&Connection) + Send>>,
    read: Option<Box<dyn FnMut(&Connection, &[u8]) + Send>>,
    write: Option<Box<dyn FnMut(&Connection) + Send>>,
    close: Option<Box<dyn FnMut(&Connection, Option<ConnectionError>) + Send>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, f: impl FnMut(&Connection) + Send + 'static) -> Self {
        self.connect = Some(Box::new(f));
        self
    }

    pub fn on_read(mut self, f: impl FnMut(&Connection, &[u8]) + Send + 'static) -> Self {
        self.read = Some(Box::new(f));
        self
    }

    pub fn on_write(mut self, f: impl FnMut(&Connection) + Send + 'static) -> Self {
        self.write = Some(Box::new(f));
        self
    }

    pub fn on_close(
        mut self,
        f: impl FnMut(&Connection, Option<ConnectionError>) + Send + 'static,
    ) -> Self {
        self.close = Some(Box::new(f));
        self
    }
}

impl Handler for Hooks {
    fn on_connect(&mut self, conn: &Connection) {
        if let Some(f) = &mut self.connect {
            f(conn);
        }
    }

    fn on_read(&mut self, conn: &Connection, data: &[u8]) {
        if let Some(f) = &mut self.read {
            f(conn, data);
        }
    }

    fn on_write(&mut self, conn: &Connection) {
        if let Some(f) = &mut self.write {
            f(conn);
        }
    }

    fn on_close(&mut self, conn: &Connection, reason: Option<ConnectionError>) {
        if let Some(f) = &mut self.close {
            f(conn, reason);
        }
    }
}

/// A raw byte channel the transport wrapper reads and writes through.
pub trait Io: Read + Write {}

impl<T: Read + Write> Io for T {}

/// Byte-in/byte-out wrapper substituted for raw socket I/O, e.g. a TLS
/// record layer.
///
/// Both sides may return `WouldBlock` while a handshake is in flight; the
/// loop treats that as no progress and retries on the next readiness event.
/// The reactor implements no framing of its own.
pub trait Transport: Send {
    /// Pulls application bytes out of the wrapped socket into `buf`.
    fn read(&mut self, io: &mut dyn Io, buf: &mut [u8]) -> io::Result<usize>;

    /// Pushes application bytes from `buf` through the wrapper, returning
    /// how many were consumed.
    fn write(&mut self, io: &mut dyn Io, buf: &[u8]) -> io::Result<usize>;

    /// True while the wrapper needs write readiness to make progress even
    /// though the outgoing buffer is empty (handshakes).
    fn wants_write(&self) -> bool {
        false
    }
}

/// How a connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated by `connect_tcp` / `connect_unix`.
    Client,
    /// A listening socket created by `listen_tcp` / `listen_unix`.
    Listener,
    /// Produced by a listener accepting a peer.
    Accepted,
}

/// Close progress for one connection.
pub(crate) enum Closing {
    No,
    /// Close once the outgoing buffer drains.
    AfterWrite,
    /// Close on the next sweep.
    Now {
        reason: Option<ConnectionError>,
        notify: bool,
    },
}

/// Shared state behind a [`Connection`] handle.
pub(crate) struct ConnState {
    pub(crate) incoming: Vec<u8>,
    pub(crate) outgoing: Vec<u8>,
    pub(crate) closing: Closing,
    pub(crate) closed: bool,
    /// Installed by `start_transport`, picked up by the loop next tick.
    pub(crate) transport_pending: Option<Box<dyn Transport>>,
}

/// Handle to one reactor-attached socket.
///
/// Clones are cheap and all refer to the same connection. The handle stays
/// valid after close; operations on a closed connection are ignored.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

struct ConnShared {
    token: usize,
    role: Role,
    label: String,
    reactor: Weak<Inner>,
    state: Mutex<ConnState>,
}

impl Connection {
    pub(crate) fn new(token: usize, role: Role, label: String, reactor: Weak<Inner>) -> Self {
        Self {
            shared: Arc::new(ConnShared {
                token,
                role,
                label,
                reactor,
                state: Mutex::new(ConnState {
                    incoming: Vec::new(),
                    outgoing: Vec::new(),
                    closing: Closing::No,
                    closed: false,
                    transport_pending: None,
                }),
            }),
        }
    }

    /// Registry key of the underlying socket.
    pub fn id(&self) -> usize {
        self.shared.token
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Peer address or bind target, for diagnostics.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Appends bytes to the outgoing buffer. The loop marks the socket
    /// write-ready on its next interest pass and flushes as the OS allows.
    ///
    /// Safe from any thread. Ignored once the connection is closing.
    pub fn send_data(&self, data: &[u8]) {
        {
            let mut state = self.state().lock().unwrap();
            if state.closed || !matches!(state.closing, Closing::No) {
                trace!("send_data on closing connection {} dropped", self.shared.token);
                return;
            }
            state.outgoing.extend_from_slice(data);
        }
        self.wake();
    }

    /// Closes cleanly: detaches on the next sweep and fires `on_close(None)`.
    pub fn close(&self) {
        self.request_close(None, true);
        self.wake();
    }

    /// Closes with a failure reason delivered to `on_close`.
    pub fn close_with_reason(&self, reason: ConnectionError) {
        self.request_close(Some(reason), true);
        self.wake();
    }

    /// Closes once the outgoing buffer has drained.
    pub fn close_after_write(&self) {
        {
            let mut state = self.state().lock().unwrap();
            if state.closed || !matches!(state.closing, Closing::No) {
                return;
            }
            state.closing = Closing::AfterWrite;
        }
        self.wake();
    }

    /// Closes without invoking `on_close`, the way reactor shutdown closes
    /// its remaining connections.
    pub fn close_without_callback(&self) {
        self.request_close(None, false);
        self.wake();
    }

    /// All bytes received so far, in arrival order.
    pub fn received_data(&self) -> Vec<u8> {
        self.state().lock().unwrap().incoming.clone()
    }

    /// True once a close has been requested or completed.
    pub fn is_closed(&self) -> bool {
        let state = self.state().lock().unwrap();
        state.closed || matches!(state.closing, Closing::Now { .. })
    }

    /// Installs a byte-level transport wrapper (e.g. a TLS session) over the
    /// socket. The loop swaps it in before its next readiness pass.
    pub fn start_transport(&self, transport: Box<dyn Transport>) {
        {
            let mut state = self.state().lock().unwrap();
            if state.closed {
                return;
            }
            state.transport_pending = Some(transport);
        }
        self.wake();
    }

    pub(crate) fn state(&self) -> &Mutex<ConnState> {
        &self.shared.state
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.shared.state.lock().unwrap()
    }

    pub(crate) fn push_incoming(&self, data: &[u8]) {
        self.lock_state().incoming.extend_from_slice(data);
    }

    pub(crate) fn request_close(&self, reason: Option<ConnectionError>, notify: bool) {
        let mut state = self.lock_state();
        if state.closed || matches!(state.closing, Closing::Now { .. }) {
            return;
        }
        state.closing = Closing::Now { reason, notify };
    }

    /// Marks the connection fully detached. Returns false if it already was,
    /// which keeps `on_close` single-shot.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut state = self.lock_state();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.outgoing.clear();
        true
    }

    fn wake(&self) {
        if let Some(inner) = self.shared.reactor.upgrade() {
            inner.wake();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.token)
            .field("role", &self.shared.role)
            .field("label", &self.shared.label)
            .finish()
    }
}

/// A connected stream socket, TCP or UNIX-domain.
pub(crate) enum StreamSocket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl StreamSocket {
    /// Pending SO_ERROR, if the OS recorded one.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            StreamSocket::Tcp(s) => s.take_error(),
            StreamSocket::Unix(s) => s.take_error(),
        }
    }

    /// Whether a non-blocking connect has completed. A `NotConnected` or
    /// `WouldBlock` peer lookup means still in flight.
    pub(crate) fn connected(&self) -> io::Result<bool> {
        let peer = match self {
            StreamSocket::Tcp(s) => s.peer_addr().map(|_| ()),
            StreamSocket::Unix(s) => s.peer_addr().map(|_| ()),
        };
        match peer {
            Ok(()) => Ok(true),
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl Read for StreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(s) => s.read(buf),
            StreamSocket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for StreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(s) => s.write(buf),
            StreamSocket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.flush(),
            StreamSocket::Unix(s) => s.flush(),
        }
    }
}

impl Source for StreamSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.register(registry, token, interests),
            StreamSocket::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.reregister(registry, token, interests),
            StreamSocket::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.deregister(registry),
            StreamSocket::Unix(s) => s.deregister(registry),
        }
    }
}

/// A listening socket. The UNIX variant remembers its filesystem path so the
/// socket file can be unlinked on close.
pub(crate) enum ListenerSocket {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl ListenerSocket {
    /// Accepts one pending peer, returning the stream and a display label.
    pub(crate) fn accept(&self) -> io::Result<(StreamSocket, String)> {
        match self {
            ListenerSocket::Tcp(l) => {
                let (stream, addr) = l.accept()?;
                Ok((StreamSocket::Tcp(stream), addr.to_string()))
            }
            ListenerSocket::Unix { listener, .. } => {
                let (stream, addr) = listener.accept()?;
                Ok((StreamSocket::Unix(stream), format!("{addr:?}")))
            }
        }
    }

    /// Removes the socket file of a UNIX listener.
    pub(crate) fn cleanup(&self) {
        if let ListenerSocket::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path) {
                trace!("could not remove socket file {}: {e}", path.display());
            }
        }
    }
}

impl Source for ListenerSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            ListenerSocket::Tcp(l) => l.register(registry, token, interests),
            ListenerSocket::Unix { listener, .. } => listener.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            ListenerSocket::Tcp(l) => l.reregister(registry, token, interests),
            ListenerSocket::Unix { listener, .. } => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            ListenerSocket::Tcp(l) => l.deregister(registry),
            ListenerSocket::Unix { listener, .. } => listener.deregister(registry),
        }
    }
}

/// Resolves `host:port` to the first usable address.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectionError> {
    use std::net::ToSocketAddrs;

    (host, port)
        .to_socket_addrs()
        .map_err(|_| ConnectionError::HostNotFound)?
        .next()
        .ok_or(ConnectionError::HostNotFound)
}
