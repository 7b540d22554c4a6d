//! Hierarchical, one-shot cancellation.
//!
//! A [`Cancellation`] is a revocation scope. Work started under a scope is wrapped through
//! [`Cancellation::map`] or [`Cancellation::run`], and scopes are nested with
//! [`Cancellation::derive`]. Cancelling a scope synchronously cancels every live descendant and
//! ends every stream or future that was wrapped through them.

use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{self, Either};
use once_cell::sync::Lazy;

use crate::Error;
use crate::cache::Cache;
use crate::stream::{CancellableStream, Cancelled, Signal};

type Handler = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a handler registered on a still active [`Cancellation`].
pub(crate) type HandlerId = u64;

enum State {
    Active {
        next_id: HandlerId,
        handlers: Vec<(HandlerId, Handler)>,
    },
    Cancelled,
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // handlers never run under the lock, a poisoned state is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deregister(&self, id: HandlerId) {
        if let State::Active { handlers, .. } = &mut *self.lock() {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }
}

static CANCELLED: Lazy<Cancellation> = Lazy::new(|| Cancellation {
    inner: Arc::new(Inner {
        state: Mutex::new(State::Cancelled),
    }),
});

/// A hierarchical, one-shot cancellation signal.
///
/// Cloning a `Cancellation` yields another handle to the same signal.
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    /// Creates a new, active cancellation.
    pub fn new() -> Self {
        Cancellation {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Active {
                    next_id: 0,
                    handlers: Vec::new(),
                }),
            }),
        }
    }

    /// Returns the shared instance that is cancelled from construction.
    ///
    /// Useful as the starting value of a slot that is later replaced via
    /// [`derive_and_cancel`](Self::derive_and_cancel).
    pub fn cancelled() -> Self {
        CANCELLED.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.lock(), State::Cancelled)
    }

    /// Registers `handler`, or runs it right away if this is already cancelled.
    ///
    /// Returns the id of the registration while it is pending.
    pub(crate) fn register(&self, handler: Handler) -> Option<HandlerId> {
        let mut state = self.inner.lock();
        if let State::Active { next_id, handlers } = &mut *state {
            let id = *next_id;
            *next_id += 1;
            handlers.push((id, handler));
            return Some(id);
        }
        drop(state);

        handler();
        None
    }

    pub(crate) fn deregister(&self, id: HandlerId) {
        self.inner.deregister(id);
    }

    /// Registers a callback that runs exactly once when this is cancelled.
    ///
    /// If this is already cancelled, `handler` runs immediately on the calling thread.
    pub fn on_cancel<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(Box::new(handler));
    }

    /// Cancels this and, transitively, every cancellation derived from it.
    ///
    /// Handlers run in registration order. Derived cancellations are cancelled by one of those
    /// handlers, so propagation is depth-first and complete by the time this returns.
    /// Calling this again is a no-op.
    pub fn cancel_all(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock(), State::Cancelled);
        let handlers = match previous {
            State::Active { handlers, .. } => handlers,
            State::Cancelled => return,
        };

        tracing::trace!(handlers = handlers.len(), "running cancellation handlers");
        for (_, handler) in handlers {
            handler();
        }
    }

    /// Creates a child that is cancelled whenever this is cancelled.
    ///
    /// Cancelling the child does not affect this or any sibling. If this is already cancelled,
    /// the child is created cancelled.
    pub fn derive(&self) -> Cancellation {
        let child = Cancellation::new();

        let propagate = child.clone();
        let registration = self.register(Box::new(move || propagate.cancel_all()));

        // a child cancelled on its own no longer needs to hear from its parent
        if let Some(id) = registration {
            let parent: Weak<Inner> = Arc::downgrade(&self.inner);
            child.register(Box::new(move || {
                if let Some(parent) = parent.upgrade() {
                    parent.deregister(id);
                }
            }));
        }

        child
    }

    /// Cancels `previous` and returns a fresh child of `self`.
    ///
    /// Used to rotate the token of a slot when its in-flight work gets replaced.
    pub fn derive_and_cancel(&self, previous: &Cancellation) -> Cancellation {
        previous.cancel_all();
        self.derive()
    }

    /// Forwards `source` until this is cancelled.
    ///
    /// Once cancelled, the returned stream drops `source` and ends. When this is already
    /// cancelled, `source` is dropped without ever being polled.
    pub fn map<S>(&self, source: S) -> CancellableStream<S> {
        if self.is_cancelled() {
            return CancellableStream::terminated();
        }

        let signal = Arc::new(Signal::default());
        let registration = Registration::new(self, Signal::notifier(&signal));
        CancellableStream::new(source, signal, registration)
    }

    /// Like [`map`](Self::map), for callers whose source may be missing.
    pub fn try_map<S>(&self, source: Option<S>) -> Result<CancellableStream<S>, Error> {
        match source {
            Some(source) => Ok(self.map(source)),
            None => Err(Error::MissingSource),
        }
    }

    /// Returns a future that resolves once this is cancelled.
    pub fn wait(&self) -> Cancelled {
        let signal = Arc::new(Signal::default());
        let registration = Registration::new(self, Signal::notifier(&signal));
        Cancelled::new(signal, registration)
    }

    /// Runs `future` to completion unless this is cancelled first.
    ///
    /// Resolves to `None` when cancelled, in which case `future` is dropped.
    pub async fn run<F: Future>(&self, future: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }

        // polls the cancellation first, so a cancelled run never yields a value
        match future::select(self.wait(), pin!(future)).await {
            Either::Left(_) => None,
            Either::Right((output, _)) => Some(output),
        }
    }

    /// Returns a guard that cancels this when dropped.
    pub fn drop_guard(&self) -> DropGuard {
        DropGuard {
            cancellation: Some(self.clone()),
        }
    }

    /// Creates a single-flight [`Cache`] scoped to a child of this cancellation.
    pub fn cache<I, O, F>(&self, update: F) -> Cache<I, O>
    where
        I: Clone + PartialEq + Send + 'static,
        F: FnMut(I, Cancellation) -> futures::stream::BoxStream<'static, O> + Send + 'static,
    {
        Cache::with_parent(self, update)
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = match &*self.inner.lock() {
            State::Active { handlers, .. } => Some(handlers.len()),
            State::Cancelled => None,
        };
        f.debug_struct("Cancellation")
            .field("cancelled", &handlers.is_none())
            .field("handlers", &handlers.unwrap_or_default())
            .finish()
    }
}

/// A handler registration that is removed again when dropped.
pub(crate) struct Registration {
    cancellation: Cancellation,
    id: Option<HandlerId>,
}

impl Registration {
    pub(crate) fn new(cancellation: &Cancellation, handler: Handler) -> Self {
        Registration {
            id: cancellation.register(handler),
            cancellation: cancellation.clone(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.cancellation.deregister(id);
        }
    }
}

/// Cancels its [`Cancellation`] when dropped, unless [disarmed](Self::disarm).
#[derive(Debug)]
pub struct DropGuard {
    cancellation: Option<Cancellation>,
}

impl DropGuard {
    /// Returns the guarded cancellation without cancelling it.
    pub fn disarm(mut self) -> Cancellation {
        // `Drop` sees `None` and does nothing
        self.cancellation.take().unwrap_or_else(Cancellation::cancelled)
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(cancellation) = self.cancellation.take() {
            cancellation.cancel_all();
        }
    }
}
