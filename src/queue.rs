//! Cross-thread FIFO delivering values into the loop.
//!
//! Producers push from any thread; consumers register a callback that the
//! reactor invokes on the loop thread with the next value. Values and
//! consumers pair up first-in-first-out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::reactor::Reactor;

type Consumer<T> = Box<dyn FnOnce(T) + Send>;

/// FIFO queue bound to a reactor, from [`Reactor::create_queue`].
pub struct Queue<T> {
    inner: Arc<Mutex<State<T>>>,
    reactor: Reactor,
}

struct State<T> {
    values: VecDeque<T>,
    waiters: VecDeque<Consumer<T>>,
}

impl<T: Send + 'static> Queue<T> {
    pub(crate) fn new(reactor: Reactor) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                values: VecDeque::new(),
                waiters: VecDeque::new(),
            })),
            reactor,
        }
    }

    /// Enqueues a value. Safe from any thread; if a consumer is waiting, the
    /// pair is dispatched onto the loop.
    pub fn push(&self, value: T) {
        let ready = {
            let mut state = self.inner.lock().unwrap();
            match state.waiters.pop_front() {
                Some(consumer) => Some((consumer, value)),
                None => {
                    state.values.push_back(value);
                    None
                }
            }
        };
        if let Some((consumer, value)) = ready {
            self.dispatch(consumer, value);
        }
    }

    /// Registers a consumer for the next value. The callback runs on the
    /// loop thread; if no value is queued yet, it waits its turn.
    pub fn pop(&self, consumer: impl FnOnce(T) + Send + 'static) {
        let ready = {
            let mut state = self.inner.lock().unwrap();
            match state.values.pop_front() {
                Some(value) => Some((Box::new(consumer) as Consumer<T>, value)),
                None => {
                    state.waiters.push_back(Box::new(consumer));
                    None
                }
            }
        };
        if let Some((consumer, value)) = ready {
            self.dispatch(consumer, value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().values.is_empty()
    }

    fn dispatch(&self, consumer: Consumer<T>, value: T) {
        // Delivery rides the task injector, so a blocked selector wakes
        // promptly and the callback lands on the loop thread.
        self.reactor
            .push_detached_task(crate::task::Task::next_tick(move || consumer(value)));
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            reactor: self.reactor.clone(),
        }
    }
}
