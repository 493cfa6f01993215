//! The process-wide default reactor.
//!
//! One lazily created instance lives in a global slot. Stopping it through
//! [`stop_global`] waits for the loop to exit and empties the slot, so the
//! next [`global`] call hands out a fresh instance.

use std::sync::Mutex;

use log::debug;

use crate::reactor::Reactor;

static GLOBAL: Mutex<Option<Reactor>> = Mutex::new(None);

/// Returns the process-wide reactor, creating it on first use. Repeated
/// calls return the same instance until [`stop_global`] replaces it.
///
/// # Panics
///
/// Panics if the OS selector cannot be created.
pub fn global() -> Reactor {
    let mut slot = GLOBAL.lock().unwrap();
    slot.get_or_insert_with(|| {
        debug!("creating global reactor");
        Reactor::new().expect("failed to create the global reactor")
    })
    .clone()
}

/// Stops the global reactor, blocks until its loop has fully exited, and
/// discards the instance. A later [`global`] call produces a different
/// reactor. Without a current instance this is a no-op.
pub fn stop_global() {
    let taken = GLOBAL.lock().unwrap().take();
    if let Some(reactor) = taken {
        debug!("stopping global reactor");
        reactor.stop();
        reactor.wait_until_stopped();
    }
}
