use std::fmt;

use futures::stream::BoxStream;

use crate::cancellation::Cancellation;
use crate::stream::CancellableStream;

type Update<I, O> = Box<dyn FnMut(I, Cancellation) -> BoxStream<'static, O> + Send>;
type ShouldUpdate<I> = Box<dyn Fn(&I, &I) -> bool + Send + Sync>;

/// A single-flight cache that recomputes its output whenever its input changes.
///
/// The cache owns one child [`Cancellation`] of its root at a time. Each recomputation cancels
/// the previous child first, so the stream returned for a superseded input never yields.
/// Once the parent cancellation fires, the cache stops computing for good.
pub struct Cache<I, O> {
    root: Cancellation,
    current: Cancellation,
    last_input: Option<I>,
    update: Update<I, O>,
    should_update: ShouldUpdate<I>,
}

impl<I, O> Cache<I, O>
where
    I: Clone + PartialEq + Send + 'static,
{
    /// Creates a cache with its own root cancellation.
    pub fn new<F>(update: F) -> Self
    where
        F: FnMut(I, Cancellation) -> BoxStream<'static, O> + Send + 'static,
    {
        Self::with_parent(&Cancellation::new(), update)
    }

    /// Creates a cache whose root is derived from `parent`.
    pub fn with_parent<F>(parent: &Cancellation, update: F) -> Self
    where
        F: FnMut(I, Cancellation) -> BoxStream<'static, O> + Send + 'static,
    {
        Cache {
            root: parent.derive(),
            current: Cancellation::cancelled(),
            last_input: None,
            update: Box::new(update),
            should_update: Box::new(|input, last| input != last),
        }
    }
}

impl<I, O> Cache<I, O>
where
    I: Clone + Send + 'static,
{
    /// Replaces the comparison deciding whether a new input triggers a recomputation.
    ///
    /// The function receives the new input first and the last seen input second.
    pub fn with_should_update<F>(mut self, should_update: F) -> Self
    where
        F: Fn(&I, &I) -> bool + Send + Sync + 'static,
    {
        self.should_update = Box::new(should_update);
        self
    }

    /// Returns the output for `input`, recomputing only when the input changed.
    ///
    /// If `input` is considered unchanged, the returned stream has already ended and the last
    /// seen input is updated to `input`. Otherwise any in-flight computation is cancelled and
    /// `update` is invoked with a fresh child cancellation.
    pub fn compute(&mut self, input: I) -> CancellableStream<BoxStream<'static, O>> {
        self.compute_inner(input, false)
    }

    /// Like [`compute`](Self::compute), but always recomputes.
    pub fn compute_forced(&mut self, input: I) -> CancellableStream<BoxStream<'static, O>> {
        self.compute_inner(input, true)
    }

    fn compute_inner(&mut self, input: I, force: bool) -> CancellableStream<BoxStream<'static, O>> {
        // a cancelled slot forgets its input, the next computation starts fresh
        let changed = match &self.last_input {
            Some(last) if !self.current.is_cancelled() => (self.should_update)(&input, last),
            _ => true,
        };

        if !changed && !force {
            tracing::trace!("cache input unchanged, skipping recomputation");
            self.last_input = Some(input);
            return CancellableStream::terminated();
        }

        self.current = self.root.derive_and_cancel(&self.current);
        if self.current.is_cancelled() {
            tracing::trace!("cache is cancelled, not recomputing");
            self.last_input = None;
            return CancellableStream::terminated();
        }

        tracing::trace!(force, "recomputing cache");
        metric!(counter("cache.recompute") += 1, "forced" => if force { "true" } else { "false" });

        self.last_input = Some(input.clone());
        let output = (self.update)(input, self.current.clone());
        self.current.map(output)
    }

    /// Cancels the in-flight computation, if any.
    ///
    /// The next [`compute`](Self::compute) starts fresh regardless of its input.
    pub fn cancel(&mut self) {
        self.current.cancel_all();
        self.last_input = None;
    }

    /// Whether the cache was torn down through its parent cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl<I: fmt::Debug, O> fmt::Debug for Cache<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("root", &self.root)
            .field("current", &self.current)
            .field("last_input", &self.last_input)
            .finish()
    }
}
