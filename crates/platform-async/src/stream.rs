use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::stream::{FusedStream, Stream};
use futures::task::AtomicWaker;

use crate::cancellation::Registration;

/// Wakes up a stream or future once its cancellation fires.
#[derive(Default)]
pub(crate) struct Signal {
    fired: AtomicBool,
    waker: AtomicWaker,
}

impl Signal {
    /// Returns a cancellation handler that fires this signal.
    pub(crate) fn notifier(signal: &Arc<Signal>) -> Box<dyn FnOnce() + Send + 'static> {
        let signal = Arc::clone(signal);
        Box::new(move || {
            signal.fired.store(true, Ordering::Release);
            signal.waker.wake();
        })
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn poll_fired(&self, cx: &mut Context<'_>) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return true;
        }
        self.waker.register(cx.waker());
        // the notifier may have run between the check and the registration
        self.fired.load(Ordering::Acquire)
    }
}

/// A stream that forwards its source until a [`Cancellation`](crate::Cancellation) fires.
///
/// Created by [`Cancellation::map`](crate::Cancellation::map). After cancellation, the source
/// is dropped and no further items are observed, even ones the source had already produced.
#[must_use = "streams do nothing unless polled"]
pub struct CancellableStream<S> {
    source: Option<Pin<Box<S>>>,
    signal: Option<Arc<Signal>>,
    _registration: Option<Registration>,
}

impl<S> CancellableStream<S> {
    pub(crate) fn new(source: S, signal: Arc<Signal>, registration: Registration) -> Self {
        CancellableStream {
            source: Some(Box::pin(source)),
            signal: Some(signal),
            _registration: Some(registration),
        }
    }

    /// A stream that has already ended.
    pub(crate) fn terminated() -> Self {
        CancellableStream {
            source: None,
            signal: None,
            _registration: None,
        }
    }

    fn terminate(&mut self) {
        self.source = None;
        self.signal = None;
        self._registration = None;
    }
}

impl<S: Stream> Stream for CancellableStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let fired = match &this.signal {
            Some(signal) => signal.poll_fired(cx),
            None => return Poll::Ready(None),
        };
        if fired {
            this.terminate();
            return Poll::Ready(None);
        }

        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(None);
        };
        match source.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.terminate();
                Poll::Ready(None)
            }
            poll => poll,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.source {
            Some(source) => (0, source.size_hint().1),
            None => (0, Some(0)),
        }
    }
}

impl<S> CancellableStream<S> {
    fn is_done(&self) -> bool {
        match &self.signal {
            Some(signal) => self.source.is_none() || signal.is_fired(),
            None => true,
        }
    }
}

impl<S: Stream> FusedStream for CancellableStream<S> {
    fn is_terminated(&self) -> bool {
        self.is_done()
    }
}

impl<S> fmt::Debug for CancellableStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableStream")
            .field("terminated", &self.is_done())
            .finish()
    }
}

/// Future returned by [`Cancellation::wait`](crate::Cancellation::wait).
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Cancelled {
    signal: Arc<Signal>,
    _registration: Registration,
}

impl Cancelled {
    pub(crate) fn new(signal: Arc<Signal>, registration: Registration) -> Self {
        Cancelled {
            signal,
            _registration: registration,
        }
    }
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.poll_fired(cx) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelled")
            .field("fired", &self.signal.fired.load(Ordering::Relaxed))
            .finish()
    }
}
