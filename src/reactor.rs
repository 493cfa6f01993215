//! The event loop.
//!
//! A [`Reactor`] owns a registry of non-blocking sockets and a queue of
//! deferred tasks, and multiplexes both on a single loop thread. Each tick
//! it waits for readiness, dispatches error, write, and read events to the
//! matching connections in that order, then runs every due task.
//!
//! The reactor handle is cheap to clone and safe to share: `stop` and the
//! scheduling entry points work from any thread by appending to an injector
//! queue and waking the selector, so the loop observes them on its next
//! tick. All user callbacks and task bodies run on the loop thread only.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use log::{debug, error, trace, warn};
use metrics::{counter, gauge};
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::{
    BaseHandler, Closing, Connection, Handler, ListenerSocket, Role, StreamSocket, Transport,
    resolve,
};
use crate::error::{ConnectionError, ListenError, ReactorError};
use crate::queue::Queue;
use crate::task::Task;

/// Token reserved for the cross-thread waker, outside the space handed to
/// sockets by the allocating counter.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Closure producing a fresh boxed handler for each accepted socket.
pub(crate) type HandlerFactory = Box<dyn FnMut() -> Box<dyn Handler> + Send>;

/// Construction-time options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Upper bound on one readiness wait. `None` blocks until an event or a
    /// cross-thread wake-up arrives.
    pub max_tick_interval: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_tick_interval: Some(Duration::from_millis(100)),
        }
    }
}

/// Single-threaded network event reactor.
///
/// Clones share one loop. The reactor is created idle; `run` (or
/// `run_in_thread`) starts the loop, `stop` requests termination, and after
/// the loop exits the instance can be run again.
///
/// # Examples
///
/// ```ignore
/// let reactor = Reactor::new()?;
/// let handle = reactor.run_in_thread()?;
/// reactor.listen_tcp("127.0.0.1", 7000, || EchoServer)?;
/// ```
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

/// State shared between the reactor handle and the loop.
pub(crate) struct Inner {
    /// Idle holds the selector between runs; Running holds the loop thread.
    lifecycle: Mutex<LoopState>,
    /// Signalled when the loop returns to idle.
    exited: Condvar,
    /// Cross-thread work: registrations, failed connects, tasks.
    injector: SegQueue<Job>,
    /// Wakes a blocked selector so injected work is noticed promptly.
    waker: Waker,
    stop: AtomicBool,
    ticks: AtomicU64,
    next_token: AtomicUsize,
    /// Mirror of the loop's registry, for cross-thread snapshots.
    conns: Mutex<HashMap<usize, Connection>>,
    /// The most recent listener, shut down last at teardown.
    server: Mutex<Option<Connection>>,
    max_tick_interval: Option<Duration>,
}

enum LoopState {
    Idle(Poll),
    Running(Thread),
}

impl Inner {
    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            trace!("selector wake-up failed: {e}");
        }
    }

    fn alloc_token(&self) -> usize {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }
}

/// Work injected from outside the loop, drained once per tick.
pub(crate) enum Job {
    Register(Registration),
    /// A connect that failed before its socket existed; the handler still
    /// gets its `on_close`.
    DeadConnect {
        handler: Box<dyn Handler>,
        conn: Connection,
        reason: ConnectionError,
    },
    Task(Task),
}

/// A socket waiting to enter the loop's registry.
pub(crate) struct Registration {
    endpoint: Endpoint,
    handler: Box<dyn Handler>,
    conn: Connection,
}

/// Loop-side view of one registered socket.
enum Endpoint {
    Stream {
        socket: StreamSocket,
        transport: Option<Box<dyn Transport>>,
        /// True until a non-blocking connect completes.
        connecting: bool,
    },
    Listener {
        socket: ListenerSocket,
        factory: HandlerFactory,
    },
}

struct LoopConn {
    endpoint: Endpoint,
    handler: Box<dyn Handler>,
    conn: Connection,
    /// Interest currently registered with the selector.
    interest: Interest,
}

impl Reactor {
    /// Creates an idle reactor with default options.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the OS selector cannot be created.
    pub fn new() -> io::Result<Self> {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            inner: Arc::new(Inner {
                lifecycle: Mutex::new(LoopState::Idle(poll)),
                exited: Condvar::new(),
                injector: SegQueue::new(),
                waker,
                stop: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                next_token: AtomicUsize::new(0),
                conns: Mutex::new(HashMap::new()),
                server: Mutex::new(None),
                max_tick_interval: options.max_tick_interval,
            }),
        })
    }

    /// Runs the loop on the calling thread until `stop` is observed.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyRunning` if another thread is in the loop.
    pub fn run(&self) -> Result<(), ReactorError> {
        self.run_inner(|| {}, false)
    }

    /// Like [`run`](Self::run), with a bootstrap body executed on the loop
    /// thread as part of the first tick.
    pub fn run_with<F: FnOnce()>(&self, first_tick: F) -> Result<(), ReactorError> {
        self.run_inner(first_tick, false)
    }

    /// Spawns a thread and runs the loop there, returning the join handle.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyRunning` if the loop is already up.
    pub fn run_in_thread(&self) -> Result<JoinHandle<()>, ReactorError> {
        if self.is_running() {
            return Err(ReactorError::AlreadyRunning);
        }

        let reactor = self.clone();
        let handle = thread::Builder::new()
            .name("eddy-loop".into())
            .spawn(move || {
                if let Err(e) = reactor.run() {
                    debug!("loop thread did not start: {e}");
                }
            })
            .expect("failed to spawn reactor loop thread");

        Ok(handle)
    }

    /// Runs a short-lived loop: `body` executes on the loop thread as the
    /// first tick, then the loop keeps ticking until the reactor is stopped
    /// or it has nothing left — no connections and no tasks.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyRunning` if the loop is already up.
    pub fn run_block<F: FnOnce()>(&self, body: F) -> Result<(), ReactorError> {
        self.run_inner(body, true)
    }

    /// Requests termination. Idempotent and safe from any thread; the flag
    /// is set by a next-tick task so the loop observes it at a tick
    /// boundary. A reactor that is not running is left untouched.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        let inner = self.inner.clone();
        self.push_detached_task(Task::next_tick(move || {
            inner.stop.store(true, Ordering::Release);
        }));
    }

    /// True iff a loop thread is active.
    pub fn is_running(&self) -> bool {
        matches!(&*self.inner.lifecycle.lock().unwrap(), LoopState::Running(_))
    }

    /// The loop thread, while running.
    pub fn thread(&self) -> Option<Thread> {
        match &*self.inner.lifecycle.lock().unwrap() {
            LoopState::Running(thread) => Some(thread.clone()),
            LoopState::Idle(_) => None,
        }
    }

    /// Completed loop iterations. Zero whenever the reactor is idle.
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// Whether the caller is on the loop thread.
    ///
    /// # Errors
    ///
    /// Fails with `NotRunning` when no loop is active.
    pub fn in_loop_thread(&self) -> Result<bool, ReactorError> {
        match &*self.inner.lifecycle.lock().unwrap() {
            LoopState::Running(thread) => Ok(thread.id() == thread::current().id()),
            LoopState::Idle(_) => Err(ReactorError::NotRunning),
        }
    }

    /// Runs `f` inline when called on the loop thread, otherwise enqueues it
    /// as a next-tick task.
    ///
    /// # Errors
    ///
    /// Fails with `NotRunning` when no loop is active.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, f: F) -> Result<(), ReactorError> {
        if self.in_loop_thread()? {
            f();
        } else {
            self.push_detached_task(Task::next_tick(f));
        }
        Ok(())
    }

    /// Enqueues `f` to run once on the next tick.
    pub fn next_tick<F: FnOnce() + Send + 'static>(&self, f: F) -> Result<(), ReactorError> {
        self.require_running()?;
        self.push_detached_task(Task::next_tick(f));
        Ok(())
    }

    /// Enqueues `f` to run on every tick until the reactor stops.
    pub fn on_tick<F: FnMut() + Send + 'static>(&self, f: F) -> Result<(), ReactorError> {
        self.require_running()?;
        self.push_detached_task(Task::every_tick(f));
        Ok(())
    }

    /// Enqueues `f` to fire every `every`, measured from the previous
    /// firing, until the reactor stops.
    pub fn at_interval<F: FnMut() + Send + 'static>(
        &self,
        every: Duration,
        f: F,
    ) -> Result<(), ReactorError> {
        self.require_running()?;
        self.push_detached_task(Task::interval(every, f));
        Ok(())
    }

    /// Enqueues `f` to fire once, no earlier than `after` from now.
    pub fn delay<F: FnOnce() + Send + 'static>(
        &self,
        after: Duration,
        f: F,
    ) -> Result<(), ReactorError> {
        self.require_running()?;
        self.push_detached_task(Task::delayed(after, f));
        Ok(())
    }

    /// Creates a FIFO queue whose consumers run on this reactor's loop
    /// thread.
    pub fn create_queue<T: Send + 'static>(&self) -> Queue<T> {
        Queue::new(self.clone())
    }

    /// Opens a non-blocking TCP connection to `host:port` and attaches it
    /// with `handler`.
    ///
    /// Resolution and connect failures are never raised here: they arrive
    /// through the handler's `on_close` with the translated reason, and the
    /// returned connection is already closed. The in-progress state of a
    /// non-blocking connect is swallowed; `on_connect` fires once the socket
    /// reports writable without an error.
    ///
    /// # Errors
    ///
    /// Fails with `NotRunning` when no loop is active.
    pub fn connect_tcp<H: Handler + 'static>(
        &self,
        host: &str,
        port: u16,
        handler: H,
    ) -> Result<Connection, ReactorError> {
        self.require_running()?;

        let token = self.inner.alloc_token();
        let conn = Connection::new(
            token,
            Role::Client,
            format!("{host}:{port}"),
            Arc::downgrade(&self.inner),
        );
        let handler: Box<dyn Handler> = Box::new(handler);

        let job = match resolve(host, port) {
            Err(reason) => Job::DeadConnect {
                handler,
                conn: conn.clone(),
                reason,
            },
            Ok(addr) => match TcpStream::connect(addr) {
                Ok(socket) => Job::Register(Registration {
                    endpoint: Endpoint::Stream {
                        socket: StreamSocket::Tcp(socket),
                        transport: None,
                        connecting: true,
                    },
                    handler,
                    conn: conn.clone(),
                }),
                Err(e) => Job::DeadConnect {
                    handler,
                    conn: conn.clone(),
                    reason: ConnectionError::from(&e),
                },
            },
        };

        counter!("eddy_connects_total").increment(1);
        self.inner.injector.push(job);
        self.inner.wake();
        Ok(conn)
    }

    /// Opens a non-blocking UNIX-domain stream connection to `path`.
    ///
    /// Failure reporting matches [`connect_tcp`](Self::connect_tcp): always
    /// through `on_close`.
    pub fn connect_unix<H: Handler + 'static>(
        &self,
        path: impl AsRef<Path>,
        handler: H,
    ) -> Result<Connection, ReactorError> {
        self.require_running()?;

        let path = path.as_ref();
        let token = self.inner.alloc_token();
        let conn = Connection::new(
            token,
            Role::Client,
            path.display().to_string(),
            Arc::downgrade(&self.inner),
        );
        let handler: Box<dyn Handler> = Box::new(handler);

        let job = match UnixStream::connect(path) {
            Ok(socket) => Job::Register(Registration {
                endpoint: Endpoint::Stream {
                    socket: StreamSocket::Unix(socket),
                    transport: None,
                    connecting: true,
                },
                handler,
                conn: conn.clone(),
            }),
            Err(e) => Job::DeadConnect {
                handler,
                conn: conn.clone(),
                reason: ConnectionError::from(&e),
            },
        };

        counter!("eddy_connects_total").increment(1);
        self.inner.injector.push(job);
        self.inner.wake();
        Ok(conn)
    }

    /// Binds a TCP listener on `host:port`. Each accepted peer gets a fresh
    /// handler from `factory`.
    ///
    /// # Errors
    ///
    /// Unlike connect, bind problems are configuration errors and are raised
    /// synchronously. Also fails with `NotRunning` when no loop is active.
    pub fn listen_tcp<H, F>(
        &self,
        host: &str,
        port: u16,
        mut factory: F,
    ) -> Result<Connection, ListenError>
    where
        H: Handler + 'static,
        F: FnMut() -> H + Send + 'static,
    {
        self.require_running()?;

        let addr = resolve(host, port)?;
        let socket = TcpListener::bind(addr).map_err(|e| ConnectionError::from(&e))?;
        let label = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{host}:{port}"));

        self.finish_listen(
            ListenerSocket::Tcp(socket),
            label,
            Box::new(move || Box::new(factory())),
        )
    }

    /// Binds a UNIX-domain listener at `path`. The socket file is unlinked
    /// when the listener closes.
    ///
    /// # Errors
    ///
    /// Bind problems are raised synchronously, like
    /// [`listen_tcp`](Self::listen_tcp).
    pub fn listen_unix<H, F>(
        &self,
        path: impl AsRef<Path>,
        mut factory: F,
    ) -> Result<Connection, ListenError>
    where
        H: Handler + 'static,
        F: FnMut() -> H + Send + 'static,
    {
        self.require_running()?;

        let path = path.as_ref();
        let listener = UnixListener::bind(path).map_err(|e| ConnectionError::from(&e))?;

        self.finish_listen(
            ListenerSocket::Unix {
                listener,
                path: path.to_path_buf(),
            },
            path.display().to_string(),
            Box::new(move || Box::new(factory())),
        )
    }

    /// Snapshot of the attached connections, listener included.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.conns.lock().unwrap().values().cloned().collect()
    }

    /// The current listening connection, if any.
    pub fn server(&self) -> Option<Connection> {
        self.inner.server.lock().unwrap().clone()
    }

    /// Blocks until the loop has fully exited and the reactor is idle.
    pub(crate) fn wait_until_stopped(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        while matches!(&*lifecycle, LoopState::Running(_)) {
            lifecycle = self.inner.exited.wait(lifecycle).unwrap();
        }
    }

    /// Appends a task without the `NotRunning` guard; used by queues whose
    /// deliveries must survive until the loop next runs.
    pub(crate) fn push_detached_task(&self, task: Task) {
        counter!("eddy_tasks_scheduled_total").increment(1);
        self.inner.injector.push(Job::Task(task));
        self.inner.wake();
    }

    fn require_running(&self) -> Result<(), ReactorError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ReactorError::NotRunning)
        }
    }

    fn finish_listen(
        &self,
        socket: ListenerSocket,
        label: String,
        factory: HandlerFactory,
    ) -> Result<Connection, ListenError> {
        let token = self.inner.alloc_token();
        let conn = Connection::new(token, Role::Listener, label, Arc::downgrade(&self.inner));

        *self.inner.server.lock().unwrap() = Some(conn.clone());
        self.inner.injector.push(Job::Register(Registration {
            endpoint: Endpoint::Listener { socket, factory },
            handler: Box::new(BaseHandler),
            conn: conn.clone(),
        }));
        self.inner.wake();

        debug!("listening on {}", conn.label());
        Ok(conn)
    }

    fn run_inner(&self, first_tick: impl FnOnce(), drain_mode: bool) -> Result<(), ReactorError> {
        let poll = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            match std::mem::replace(&mut *lifecycle, LoopState::Running(thread::current())) {
                LoopState::Idle(poll) => poll,
                running => {
                    *lifecycle = running;
                    return Err(ReactorError::AlreadyRunning);
                }
            }
        };
        debug!("reactor loop running on {:?}", thread::current().id());

        let mut core = Core {
            inner: self.inner.clone(),
            poll,
            events: Events::with_capacity(1024),
            conns: HashMap::new(),
            tasks: Vec::new(),
            drain_mode,
        };

        first_tick();
        core.drain_jobs();
        while core.tick() {}
        let poll = core.teardown();

        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        *lifecycle = LoopState::Idle(poll);
        self.inner.exited.notify_all();
        debug!("reactor loop stopped");
        Ok(())
    }
}

impl PartialEq for Reactor {
    /// Handle equality: two handles are equal iff they share a loop.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Reactor {}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("running", &self.is_running())
            .field("ticks", &self.ticks())
            .finish()
    }
}

/// Loop-thread state: the selector plus both registries.
struct Core {
    inner: Arc<Inner>,
    poll: Poll,
    events: Events,
    conns: HashMap<usize, LoopConn>,
    tasks: Vec<Task>,
    drain_mode: bool,
}

impl Core {
    /// One iteration: reconcile interests, wait for readiness, dispatch
    /// errors then writes then reads, sweep closes, run the task queue.
    /// Returns false once the loop should exit.
    fn tick(&mut self) -> bool {
        self.reconcile();

        if let Err(e) = self.poll.poll(&mut self.events, self.inner.max_tick_interval) {
            if e.kind() == io::ErrorKind::Interrupted {
                self.events.clear();
            } else {
                error!("selector failed: {e}");
                return false;
            }
        }

        let mut errors = Vec::new();
        let mut writables = Vec::new();
        let mut readables = Vec::new();
        for event in self.events.iter() {
            let Token(token) = event.token();
            if token == WAKE_TOKEN.0 {
                continue;
            }
            if event.is_error() {
                errors.push(token);
            }
            if event.is_writable() {
                writables.push(token);
            }
            if event.is_readable() || event.is_read_closed() {
                readables.push(token);
            }
        }

        for token in errors {
            self.handle_error(token);
        }

        // Writes go before reads so outgoing buffers drain and relieve
        // back-pressure before new bytes arrive. The write pass covers every
        // socket with pending output, not just those the selector flagged:
        // an edge-triggered selector stays silent for a socket that was
        // already writable when bytes were queued.
        for (token, lc) in &self.conns {
            if writables.contains(token) {
                continue;
            }
            if let Endpoint::Stream {
                connecting: false, ..
            } = &lc.endpoint
            {
                if !lc.conn.lock_state().outgoing.is_empty() {
                    writables.push(*token);
                }
            }
        }
        for token in writables {
            self.handle_writable(token);
        }

        for token in readables {
            self.handle_readable(token);
        }

        self.sweep_closes();
        self.run_tasks();
        self.sweep_closes();

        let ticks = self.inner.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("eddy_ticks_total").increment(1);
        trace!("tick {ticks}: {} connections, {} tasks", self.conns.len(), self.tasks.len());

        if self.inner.stop.load(Ordering::Acquire) {
            return false;
        }
        if self.drain_mode
            && self.conns.is_empty()
            && self.tasks.is_empty()
            && self.inner.injector.is_empty()
        {
            return false;
        }
        true
    }

    /// Pulls injected work into the loop: registrations enter the registry,
    /// failed connects report, tasks join the queue for this tick's pass.
    fn drain_jobs(&mut self) {
        while let Some(job) = self.inner.injector.pop() {
            match job {
                Job::Task(task) => self.tasks.push(task),
                Job::Register(reg) => self.register(reg),
                Job::DeadConnect {
                    mut handler,
                    conn,
                    reason,
                } => {
                    debug!("connect to {} failed: {reason}", conn.label());
                    if conn.mark_closed() {
                        let c = conn.clone();
                        guard("on_close handler", || handler.on_close(&c, Some(reason)));
                    }
                }
            }
        }
    }

    fn register(&mut self, reg: Registration) {
        let Registration {
            mut endpoint,
            handler,
            conn,
        } = reg;
        let token = conn.id();
        let interest = desired_interest(&endpoint, &conn);

        let registered = match &mut endpoint {
            Endpoint::Stream { socket, .. } => {
                mio::event::Source::register(socket, self.poll.registry(), Token(token), interest)
            }
            Endpoint::Listener { socket, .. } => {
                mio::event::Source::register(socket, self.poll.registry(), Token(token), interest)
            }
        };
        if let Err(e) = registered {
            warn!("could not register {}: {e}", conn.label());
            if conn.mark_closed() {
                let mut handler = handler;
                let reason = ConnectionError::from(&e);
                let c = conn.clone();
                guard("on_close handler", move || {
                    handler.on_close(&c, Some(reason));
                });
            }
            return;
        }

        trace!("registered {} ({}) for {:?}", token, conn.label(), interest);
        self.inner.conns.lock().unwrap().insert(token, conn.clone());

        let announce = conn.role() == Role::Accepted;
        let mut lc = LoopConn {
            endpoint,
            handler,
            conn,
            interest,
        };
        if announce {
            let c = lc.conn.clone();
            if !guard("on_connect handler", || lc.handler.on_connect(&c)) {
                lc.conn.request_close(
                    Some(ConnectionError::Other("handler panicked".into())),
                    true,
                );
            }
        }
        self.conns.insert(token, lc);
        gauge!("eddy_connections_open").set(self.conns.len() as f64);
    }

    /// Installs pending transports, then re-registers any socket whose
    /// desired interest set changed since the previous tick. Interests are
    /// recomputed every tick: readable always, writable while a connect is
    /// in flight, output is buffered, or the transport asks for it.
    fn reconcile(&mut self) {
        let registry = self.poll.registry();
        for (token, lc) in self.conns.iter_mut() {
            if let Endpoint::Stream { transport, .. } = &mut lc.endpoint {
                let pending = lc.conn.lock_state().transport_pending.take();
                if let Some(t) = pending {
                    debug!("transport installed on {} ({})", token, lc.conn.label());
                    *transport = Some(t);
                }
            }

            let desired = desired_interest(&lc.endpoint, &lc.conn);
            if desired == lc.interest {
                continue;
            }
            let reregistered = match &mut lc.endpoint {
                Endpoint::Stream { socket, .. } => {
                    mio::event::Source::reregister(socket, registry, Token(*token), desired)
                }
                Endpoint::Listener { socket, .. } => {
                    mio::event::Source::reregister(socket, registry, Token(*token), desired)
                }
            };
            match reregistered {
                Ok(()) => {
                    trace!("interest on {} now {:?}", token, desired);
                    lc.interest = desired;
                }
                Err(e) => {
                    warn!("could not reregister {}: {e}", lc.conn.label());
                    lc.conn.request_close(Some(ConnectionError::from(&e)), true);
                }
            }
        }
    }

    fn handle_error(&mut self, token: usize) {
        let Some(lc) = self.conns.get_mut(&token) else {
            return;
        };
        let reason = match &lc.endpoint {
            Endpoint::Stream { socket, .. } => match socket.take_error() {
                Ok(Some(e)) => ConnectionError::from(&e),
                Ok(None) => ConnectionError::Other("socket error readiness".into()),
                Err(e) => ConnectionError::from(&e),
            },
            Endpoint::Listener { .. } => ConnectionError::Other("listener error readiness".into()),
        };
        debug!("error on {} ({}): {reason}", token, lc.conn.label());
        lc.conn.request_close(Some(reason), true);
    }

    fn handle_writable(&mut self, token: usize) {
        let Some(lc) = self.conns.get_mut(&token) else {
            return;
        };
        if matches!(lc.conn.lock_state().closing, Closing::Now { .. }) {
            return;
        }
        let LoopConn {
            endpoint,
            handler,
            conn,
            ..
        } = lc;
        let Endpoint::Stream {
            socket,
            transport,
            connecting,
        } = endpoint
        else {
            return;
        };

        if *connecting {
            match socket.take_error() {
                Ok(Some(e)) => {
                    conn.request_close(Some(ConnectionError::from(&e)), true);
                    return;
                }
                Err(e) => {
                    conn.request_close(Some(ConnectionError::from(&e)), true);
                    return;
                }
                Ok(None) => {}
            }
            match socket.connected() {
                Ok(true) => {
                    *connecting = false;
                    debug!("connected to {} ({})", conn.label(), token);
                    let c = conn.clone();
                    if !guard("on_connect handler", || handler.on_connect(&c)) {
                        conn.request_close(
                            Some(ConnectionError::Other("handler panicked".into())),
                            true,
                        );
                    }
                }
                // Spurious wake-up, connect still in flight.
                Ok(false) => {}
                Err(e) => conn.request_close(Some(ConnectionError::from(&e)), true),
            }
            return;
        }

        let mut wrote = false;
        let mut failure = None;
        let (flushed, close_after_write) = {
            let mut state = conn.lock_state();
            while !state.outgoing.is_empty() {
                let res = match transport {
                    Some(t) => t.write(socket, &state.outgoing),
                    None => io::Write::write(socket, &state.outgoing),
                };
                match res {
                    Ok(0) => {
                        failure = Some(ConnectionError::Other("write returned zero bytes".into()));
                        break;
                    }
                    Ok(n) => {
                        wrote = true;
                        counter!("eddy_bytes_written_total").increment(n as u64);
                        state.outgoing.drain(..n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(ConnectionError::from(&e));
                        break;
                    }
                }
            }
            (
                state.outgoing.is_empty(),
                matches!(state.closing, Closing::AfterWrite),
            )
        };

        if let Some(reason) = failure {
            conn.request_close(Some(reason), true);
            return;
        }
        if wrote && flushed {
            let c = conn.clone();
            if !guard("on_write handler", || handler.on_write(&c)) {
                conn.request_close(
                    Some(ConnectionError::Other("handler panicked".into())),
                    true,
                );
                return;
            }
            if close_after_write {
                conn.request_close(None, true);
            }
        }
    }

    fn handle_readable(&mut self, token: usize) {
        let is_listener = matches!(
            self.conns.get(&token).map(|lc| &lc.endpoint),
            Some(Endpoint::Listener { .. })
        );
        if is_listener {
            self.accept_pending(token);
        } else {
            self.read_stream(token);
        }
    }

    /// Accepts until the listener would block, attaching each peer with a
    /// fresh handler from the stored factory and firing its `on_connect`.
    fn accept_pending(&mut self, token: usize) {
        let mut accepted = Vec::new();
        if let Some(lc) = self.conns.get_mut(&token) {
            if let Endpoint::Listener { socket, factory } = &mut lc.endpoint {
                loop {
                    match socket.accept() {
                        Ok((stream, label)) => accepted.push((stream, label, factory())),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("accept failed on {}: {e}", lc.conn.label());
                            break;
                        }
                    }
                }
            }
        }

        for (socket, label, handler) in accepted {
            let token = self.inner.alloc_token();
            let conn = Connection::new(token, Role::Accepted, label, Arc::downgrade(&self.inner));
            counter!("eddy_accepts_total").increment(1);
            trace!("accepted {} ({})", token, conn.label());
            self.register(Registration {
                endpoint: Endpoint::Stream {
                    socket,
                    transport: None,
                    connecting: false,
                },
                handler,
                conn,
            });
        }
    }

    /// Reads until the socket would block, delivering each chunk to
    /// `on_read` and accumulating it on the connection.
    fn read_stream(&mut self, token: usize) {
        let Some(lc) = self.conns.get_mut(&token) else {
            return;
        };
        {
            let state = lc.conn.lock_state();
            if state.closed || !matches!(state.closing, Closing::No) {
                return;
            }
        }
        let LoopConn {
            endpoint,
            handler,
            conn,
            ..
        } = lc;
        let Endpoint::Stream {
            socket,
            transport,
            connecting,
        } = endpoint
        else {
            return;
        };
        if *connecting {
            return;
        }

        let mut buf = [0u8; 16 * 1024];
        loop {
            let res = match transport {
                Some(t) => t.read(socket, &mut buf),
                None => io::Read::read(socket, &mut buf),
            };
            match res {
                Ok(0) => {
                    conn.request_close(Some(ConnectionError::Closed), true);
                    break;
                }
                Ok(n) => {
                    counter!("eddy_bytes_read_total").increment(n as u64);
                    conn.push_incoming(&buf[..n]);
                    let c = conn.clone();
                    if !guard("on_read handler", || handler.on_read(&c, &buf[..n])) {
                        conn.request_close(
                            Some(ConnectionError::Other("handler panicked".into())),
                            true,
                        );
                        break;
                    }
                    // The handler may have requested a close; stop reading.
                    if !matches!(conn.lock_state().closing, Closing::No) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    conn.request_close(Some(ConnectionError::from(&e)), true);
                    break;
                }
            }
        }
    }

    /// Detaches every connection whose close request is due: immediate
    /// closes, and drained close-after-write connections.
    fn sweep_closes(&mut self) {
        let mut due = Vec::new();
        for (token, lc) in &self.conns {
            let state = lc.conn.lock_state();
            match &state.closing {
                Closing::Now { reason, notify } => due.push((*token, reason.clone(), *notify)),
                Closing::AfterWrite if state.outgoing.is_empty() => due.push((*token, None, true)),
                _ => {}
            }
        }
        for (token, reason, notify) in due {
            self.detach(token, reason, notify);
        }
    }

    fn detach(&mut self, token: usize, reason: Option<ConnectionError>, notify: bool) {
        let Some(mut lc) = self.conns.remove(&token) else {
            return;
        };

        let registry = self.poll.registry();
        match &mut lc.endpoint {
            Endpoint::Stream { socket, .. } => {
                let _ = mio::event::Source::deregister(socket, registry);
            }
            Endpoint::Listener { socket, .. } => {
                let _ = mio::event::Source::deregister(socket, registry);
                socket.cleanup();
            }
        }

        self.inner.conns.lock().unwrap().remove(&token);
        if lc.conn.role() == Role::Listener {
            let mut server = self.inner.server.lock().unwrap();
            if server.as_ref().map(Connection::id) == Some(token) {
                *server = None;
            }
        }
        gauge!("eddy_connections_open").set(self.conns.len() as f64);

        let first_close = lc.conn.mark_closed();
        debug!("detached {} ({})", token, lc.conn.label());
        if notify && first_close {
            let c = lc.conn.clone();
            guard("on_close handler", move || lc.handler.on_close(&c, reason));
        }
    }

    /// One pass over the task queue: drain injected work, run every due
    /// task in insertion order, drop the expired ones. Tasks appended during
    /// the pass wait for the next tick.
    fn run_tasks(&mut self) {
        self.drain_jobs();

        let due_len = self.tasks.len();
        let now = Instant::now();
        for i in 0..due_len {
            let task = &mut self.tasks[i];
            if task.due(now) {
                guard("task", || task.run());
            }
        }
        self.tasks.retain(|t| !t.expired());
    }

    /// Shutdown: every connection is closed without user callbacks, the
    /// task queue and injector are cleared, counters reset.
    fn teardown(mut self) -> Poll {
        debug!("loop exiting; dropping {} connections", self.conns.len());

        let tokens: Vec<usize> = self.conns.keys().copied().collect();
        for token in tokens {
            self.detach(token, None, false);
        }
        while self.inner.injector.pop().is_some() {}
        self.tasks.clear();

        self.inner.conns.lock().unwrap().clear();
        *self.inner.server.lock().unwrap() = None;
        self.inner.stop.store(false, Ordering::Release);
        self.inner.ticks.store(0, Ordering::Release);
        gauge!("eddy_connections_open").set(0.0);

        self.poll
    }
}

fn desired_interest(endpoint: &Endpoint, conn: &Connection) -> Interest {
    match endpoint {
        Endpoint::Listener { .. } => Interest::READABLE,
        Endpoint::Stream {
            connecting: true, ..
        } => Interest::WRITABLE,
        Endpoint::Stream { transport, .. } => {
            let pending_output = !conn.lock_state().outgoing.is_empty();
            let handshaking = transport.as_ref().is_some_and(|t| t.wants_write());
            if pending_output || handshaking {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            }
        }
    }
}

/// Runs user code without letting a panic kill the loop. Returns false if
/// the code panicked.
fn guard<F: FnOnce()>(what: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            warn!("{what} panicked; continuing");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_on_an_idle_reactor_is_a_no_op() {
        let reactor = Reactor::new().unwrap();
        reactor.stop();
        assert!(!reactor.is_running());
        assert_eq!(reactor.ticks(), 0);
    }

    #[test]
    fn schedulers_demand_a_running_loop() {
        let reactor = Reactor::new().unwrap();
        assert_eq!(reactor.next_tick(|| {}), Err(ReactorError::NotRunning));
        assert_eq!(reactor.on_tick(|| {}), Err(ReactorError::NotRunning));
        assert_eq!(
            reactor.at_interval(Duration::from_millis(1), || {}),
            Err(ReactorError::NotRunning)
        );
        assert_eq!(
            reactor.delay(Duration::from_millis(1), || {}),
            Err(ReactorError::NotRunning)
        );
        assert_eq!(reactor.schedule(|| {}), Err(ReactorError::NotRunning));
        assert_eq!(reactor.in_loop_thread(), Err(ReactorError::NotRunning));
    }

    #[test]
    fn run_block_executes_its_body_on_the_loop_thread() {
        let reactor = Reactor::new().unwrap();
        let reactor2 = reactor.clone();
        let mut observed = None;

        reactor
            .run_block(|| {
                observed = Some(reactor2.in_loop_thread());
            })
            .unwrap();

        assert_eq!(observed, Some(Ok(true)));
        assert!(!reactor.is_running());
        assert_eq!(reactor.ticks(), 0);
    }

    #[test]
    fn handle_equality_is_loop_identity() {
        let a = Reactor::new().unwrap();
        let b = Reactor::new().unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
