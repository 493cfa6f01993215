//! Deferred work interleaved with I/O.
//!
//! A task is a boxed closure plus a firing rule. The reactor keeps tasks in a
//! plain insertion-ordered queue and walks it once per tick; each entry is
//! asked whether it is due, run if so, and dropped once it has expired.

use std::time::{Duration, Instant};

/// The closure type every task body is stored as.
///
/// One-shot schedulers accept `FnOnce` and wrap it; storing `FnMut` keeps the
/// queue uniform across all four variants.
pub(crate) type TaskBody = Box<dyn FnMut() + Send>;

/// Firing rule for a task.
enum Kind {
    /// Fires on the next tick, then expires.
    NextTick,
    /// Fires every tick until the reactor stops.
    EveryTick,
    /// Fires whenever wall-clock time reaches `next_fire`, which then
    /// advances by exactly `every` so that slow ticks do not accumulate
    /// drift.
    Interval { every: Duration, next_fire: Instant },
    /// Fires once at `fire_at`, then expires.
    Delayed { fire_at: Instant },
}

/// A scheduled unit of work, run on the loop thread within a tick.
pub(crate) struct Task {
    kind: Kind,
    body: TaskBody,
    done: bool,
}

impl Task {
    pub(crate) fn next_tick<F: FnOnce() + Send + 'static>(f: F) -> Self {
        let mut f = Some(f);
        Self {
            kind: Kind::NextTick,
            body: Box::new(move || {
                if let Some(f) = f.take() {
                    f();
                }
            }),
            done: false,
        }
    }

    pub(crate) fn every_tick<F: FnMut() + Send + 'static>(f: F) -> Self {
        Self {
            kind: Kind::EveryTick,
            body: Box::new(f),
            done: false,
        }
    }

    pub(crate) fn interval<F: FnMut() + Send + 'static>(every: Duration, f: F) -> Self {
        Self {
            kind: Kind::Interval {
                every,
                next_fire: Instant::now() + every,
            },
            body: Box::new(f),
            done: false,
        }
    }

    pub(crate) fn delayed<F: FnOnce() + Send + 'static>(after: Duration, f: F) -> Self {
        let mut f = Some(f);
        Self {
            kind: Kind::Delayed {
                fire_at: Instant::now() + after,
            },
            body: Box::new(move || {
                if let Some(f) = f.take() {
                    f();
                }
            }),
            done: false,
        }
    }

    /// Whether the task should run this tick.
    pub(crate) fn due(&self, now: Instant) -> bool {
        if self.done {
            return false;
        }
        match &self.kind {
            Kind::NextTick | Kind::EveryTick => true,
            Kind::Interval { next_fire, .. } => now >= *next_fire,
            Kind::Delayed { fire_at } => now >= *fire_at,
        }
    }

    /// Runs the body and advances the firing rule. The rule advances first,
    /// so a panicking one-shot body still expires.
    pub(crate) fn run(&mut self) {
        match &mut self.kind {
            Kind::NextTick | Kind::Delayed { .. } => self.done = true,
            Kind::EveryTick => {}
            Kind::Interval { every, next_fire } => *next_fire += *every,
        }
        (self.body)();
    }

    /// Expired tasks are removed from the queue after the current pass.
    pub(crate) fn expired(&self) -> bool {
        self.done
    }
}
