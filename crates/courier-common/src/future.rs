// Completion handles: a `Promise` is resolved exactly once with success or
// failure; its `Future` side supports blocking waits and completion
// callbacks. Used both for call completions (payload bytes) and for
// directory registration results.
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Result<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn complete(&self, result: Result<T>) {
        let callbacks = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => {
                    tracing::warn!("completion resolved more than once; keeping first result");
                    return;
                }
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(result.clone());
                    callbacks
                }
            }
        };
        self.cond.notify_all();
        // Callbacks run outside the lock so they may wait on other futures.
        for callback in callbacks {
            callback(&result);
        }
    }
}

/// Write side of a completion. Cloning shares the same completion; when the
/// last clone is dropped unresolved, waiters fail with [`Error::Broken`].
pub struct Promise<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
    token: Arc<Token<T>>,
}

struct Token<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Drop for Token<T> {
    fn drop(&mut self) {
        let pending = matches!(&*self.shared.state.lock(), State::Pending(_));
        if pending {
            self.shared.complete(Err(Error::Broken));
        }
    }
}

impl<T: Clone + Send + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            token: Arc::clone(&self.token),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending(Vec::new())),
            cond: Condvar::new(),
        });
        Self {
            token: Arc::new(Token {
                shared: Arc::clone(&shared),
            }),
            shared,
        }
    }

    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn set_value(&self, value: T) {
        self.shared.complete(Ok(value));
    }

    pub fn set_error(&self, error: Error) {
        self.shared.complete(Err(error));
    }
}

/// Read side of a completion.
pub struct Future<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// An already-resolved future, for immediate failures.
    pub fn from_error(error: Error) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Done(Err(error))),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn from_value(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Done(Ok(value))),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Done(_))
    }

    /// Block until the completion resolves.
    pub fn wait(&self) -> Result<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.clone();
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Block up to `timeout`; `None` if the completion is still pending.
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return Some(result.clone());
            }
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    State::Done(result) => Some(result.clone()),
                    State::Pending(_) => None,
                };
            }
        }
    }

    /// Run `callback` when the completion resolves; immediately if it
    /// already has.
    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let result = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(result) => result.clone(),
            }
        };
        callback(&result);
    }
}
