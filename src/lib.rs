//! A single-threaded network event reactor.
//!
//! One loop thread multiplexes many non-blocking stream sockets (TCP and
//! UNIX-domain), dispatches readiness to user-supplied connection handlers,
//! and interleaves deferred work with I/O. It consists of:
//!
//! - [`reactor`]: the event loop — run/stop lifecycle, tick cycle,
//!   connect/listen, and the scheduling entry points
//! - [`connection`]: handlers, the connection handle, and the transport
//!   upgrade hook for TLS-style byte wrappers
//! - [`queue`]: cross-thread FIFO delivering values onto the loop thread
//! - [`global`]: the process-wide default reactor
//! - [`error`]: the reactor and connection error taxonomies
//!
//! The scheduling model is cooperative: all callbacks and task bodies run on
//! the loop thread, so none of them may block for long. `stop`, `schedule`,
//! and the task schedulers are safe from any thread; they enqueue work that
//! the loop picks up on its next tick.

pub mod connection;
pub mod error;
pub mod global;
pub mod queue;
pub mod reactor;
mod task;

pub use connection::{BaseHandler, Connection, Handler, Hooks, Io, Role, Transport};
pub use error::{ConnectionError, ListenError, ReactorError};
pub use global::{global, stop_global};
pub use queue::Queue;
pub use reactor::{Options, Reactor};
