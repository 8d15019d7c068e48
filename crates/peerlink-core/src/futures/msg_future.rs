//! Single-outcome correlator

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{LinkError, LinkResult, MsgFailure};

type Listener<T> = Box<dyn FnOnce(u32, Result<T, MsgFailure>) + Send>;

struct State<T> {
    message_id: u32,
    outcome: Option<Result<T, MsgFailure>>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

/// Ties a message id to its eventual outcome.
///
/// Exactly one of [`fulfill`](Self::fulfill) or [`fail`](Self::fail) takes
/// effect; later completions are logged and ignored. Every listener observes
/// the outcome exactly once, whether it was attached before or after
/// completion.
///
/// Handles are cheap to clone and all clones share the same outcome.
pub struct MsgFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MsgFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for MsgFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MsgFuture")
            .field("message_id", &state.message_id)
            .field("done", &state.outcome.is_some())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for MsgFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> MsgFuture<T> {
    /// Create an unbound correlator (message id 0 until completed).
    pub fn new() -> Self {
        Self::with_message_id(0)
    }

    pub fn with_message_id(message_id: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    message_id,
                    outcome: None,
                    listeners: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Create a correlator already completed with `value`.
    pub fn ready(message_id: u32, value: T) -> Self {
        let future = Self::with_message_id(message_id);
        future.fulfill(message_id, value);
        future
    }

    pub fn message_id(&self) -> u32 {
        self.inner.state.lock().message_id
    }

    /// Bind the id assigned by the transport, if the outcome has not arrived yet.
    pub fn set_message_id(&self, message_id: u32) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            state.message_id = message_id;
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// The outcome, if one has been delivered.
    pub fn outcome(&self) -> Option<Result<T, MsgFailure>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Deliver a success value. Returns false if already completed.
    pub fn fulfill(&self, message_id: u32, value: T) -> bool {
        self.complete(message_id, Ok(value))
    }

    /// Deliver a failure. Returns false if already completed.
    pub fn fail(&self, message_id: u32, status: i32, detail: impl Into<String>) -> bool {
        self.complete(message_id, Err(MsgFailure::new(message_id, status, detail)))
    }

    /// Deliver `err` as a failure under the currently bound message id.
    pub fn fail_with(&self, err: &LinkError) -> bool {
        let message_id = self.message_id();
        self.complete(message_id, Err(err.to_failure(message_id)))
    }

    fn complete(&self, message_id: u32, outcome: Result<T, MsgFailure>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                warn!(
                    message_id,
                    first_id = state.message_id,
                    "Correlator completed twice, ignoring second outcome"
                );
                return false;
            }
            state.message_id = message_id;
            state.outcome = Some(outcome.clone());
            self.inner.done.notify_all();
            std::mem::take(&mut state.listeners)
        };

        for listener in listeners {
            listener(message_id, outcome.clone());
        }
        true
    }

    /// Attach a listener invoked exactly once with the outcome.
    ///
    /// If the outcome is already known the listener runs immediately on the
    /// calling thread; otherwise it runs on the thread that completes.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(u32, Result<T, MsgFailure>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                let message_id = state.message_id;
                drop(state);
                listener(message_id, outcome);
            }
            None => state.listeners.push(Box::new(listener)),
        }
    }

    /// Block the calling thread until the outcome arrives or `timeout` elapses.
    pub fn get(&self, timeout: Duration) -> LinkResult<T> {
        // No deadline when `timeout` does not fit in an `Instant`.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        while state.outcome.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.done.wait(&mut state),
            }
        }
        match state.outcome.clone() {
            Some(Ok(value)) => Ok(value),
            Some(Err(failure)) => Err(failure.into()),
            None => Err(LinkError::WaitTimeout(timeout.as_millis() as u64)),
        }
    }

    /// Await the outcome.
    pub async fn wait(&self) -> LinkResult<T> {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |_, outcome| {
            let _ = tx.send(outcome);
        });
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(LinkError::InvalidState(
                "Correlator dropped before completion".to_string(),
            )),
        }
    }

    /// Await the outcome for at most `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> LinkResult<T> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| LinkError::WaitTimeout(timeout.as_millis() as u64))?
    }
}
