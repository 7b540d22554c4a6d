//! Coalescing of point queries into bulk fetches.
//!
//! A [`BatchedPool`] funnels every [`query`](BatchedPool::query) into a shared queue. A
//! dispatcher task groups the queue into windows: a window opens with its first input and is
//! dispatched once it holds [`batch_size`](BatchConfig::batch_size) inputs or once
//! [`window`](BatchConfig::window) has elapsed, whichever comes first. Each window is
//! deduplicated and handed to the fetch function as one set, and the outcome is demultiplexed
//! back to the callers whose inputs were part of it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::stream::{FusedStream, Stream};
use tokio::sync::mpsc;
use tokio::time;

use crate::Error;
use crate::config::BatchConfig;

type Fetch<I, O, E> =
    Arc<dyn Fn(HashSet<I>) -> BoxFuture<'static, Result<HashMap<I, O>, E>> + Send + Sync>;

/// The outcome of one dispatched window.
#[derive(Clone, Debug)]
pub struct FetchResult<I, O, E> {
    /// The unique inputs of the window.
    pub inputs: HashSet<I>,
    /// The batch returned by the fetch function, or its error.
    pub outcome: Result<HashMap<I, O>, E>,
}

impl<I, O, E> FetchResult<I, O, E>
where
    I: Eq + Hash,
    O: Clone,
    E: Clone,
{
    /// Looks up the answer for a single input.
    ///
    /// Returns `None` if `input` was not part of this window. An input the fetch function did
    /// not return a value for resolves to `Ok(None)`.
    pub fn lookup(&self, input: &I) -> Option<Result<Option<O>, E>> {
        if !self.inputs.contains(input) {
            return None;
        }
        Some(match &self.outcome {
            Ok(batch) => Ok(batch.get(input).cloned()),
            Err(error) => Err(error.clone()),
        })
    }
}

struct Request<I, O, E> {
    input: I,
    respond: oneshot::Sender<Result<Option<O>, E>>,
}

/// Coalesces concurrent point queries into windowed bulk fetches.
///
/// Handles are cheap to clone and share one dispatcher. The dispatcher shuts down after the last
/// handle is dropped, once it has dispatched whatever was still queued.
pub struct BatchedPool<I, O, E> {
    requests: mpsc::UnboundedSender<Request<I, O, E>>,
    config: BatchConfig,
}

impl<I, O, E> BatchedPool<I, O, E>
where
    I: Eq + Hash + Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a pool with the default [`BatchConfig`].
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(HashSet<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<I, O>, E>> + Send + 'static,
    {
        Self::spawn(BatchConfig::default(), fetch)
    }

    /// Creates a pool with the given window configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn with_config<F, Fut>(config: BatchConfig, fetch: F) -> Result<Self, Error>
    where
        F: Fn(HashSet<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<I, O>, E>> + Send + 'static,
    {
        config.validate()?;
        Ok(Self::spawn(config, fetch))
    }

    fn spawn<F, Fut>(config: BatchConfig, fetch: F) -> Self
    where
        F: Fn(HashSet<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<I, O>, E>> + Send + 'static,
    {
        let fetch: Fetch<I, O, E> = Arc::new(move |inputs| fetch(inputs).boxed());
        let (requests, queue) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(queue, fetch, config));

        BatchedPool { requests, config }
    }

    /// Requests the output for a single input.
    ///
    /// The input is queued right away. The returned stream yields exactly one item once the
    /// window containing the input was fetched, and then ends: `Ok(Some(_))` for a value,
    /// `Ok(None)` when the batch had no entry for the input, and `Err(_)` when the whole batch
    /// failed. If the window is abandoned, the stream ends without an item.
    pub fn query(&self, input: I) -> Query<O, E> {
        let (respond, response) = oneshot::channel();
        if self.requests.send(Request { input, respond }).is_err() {
            tracing::debug!("batch dispatcher is gone, dropping query");
        }
        Query {
            response: Some(response),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

impl<I, O, E> Clone for BatchedPool<I, O, E> {
    fn clone(&self) -> Self {
        BatchedPool {
            requests: self.requests.clone(),
            config: self.config,
        }
    }
}

impl<I, O, E> fmt::Debug for BatchedPool<I, O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchedPool")
            .field("config", &self.config)
            .field("closed", &self.requests.is_closed())
            .finish()
    }
}

/// Groups queued requests into windows and spawns one fetch per window.
async fn dispatch<I, O, E>(
    mut queue: mpsc::UnboundedReceiver<Request<I, O, E>>,
    fetch: Fetch<I, O, E>,
    config: BatchConfig,
) where
    I: Eq + Hash + Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    while let Some(first) = queue.recv().await {
        let mut window = vec![first];
        let mut closed = false;

        let deadline = time::sleep(config.window);
        tokio::pin!(deadline);

        while window.len() < config.batch_size {
            tokio::select! {
                biased;
                request = queue.recv() => match request {
                    Some(request) => window.push(request),
                    None => {
                        closed = true;
                        break;
                    }
                },
                () = &mut deadline => break,
            }
        }

        // windows are fetched concurrently, a slow fetch does not hold back the next window
        tokio::spawn(fetch_window(Arc::clone(&fetch), window));

        if closed {
            break;
        }
    }

    tracing::debug!("batch dispatcher shut down");
}

async fn fetch_window<I, O, E>(fetch: Fetch<I, O, E>, window: Vec<Request<I, O, E>>)
where
    I: Eq + Hash + Clone,
    O: Clone,
    E: Clone,
{
    let inputs: HashSet<I> = window.iter().map(|request| request.input.clone()).collect();
    let size = inputs.len();
    tracing::debug!(queued = window.len(), size, "dispatching batch");
    metric!(counter("batch.dispatched") += 1);
    metric!(histogram("batch.size") = size as u64);

    let outcome = fetch(inputs.clone()).await;
    if outcome.is_err() {
        tracing::debug!(size, "batch fetch failed");
        metric!(counter("batch.fetch.failed") += 1);
    }

    let result = FetchResult { inputs, outcome };
    for request in window {
        if let Some(response) = result.lookup(&request.input) {
            // the caller may have dropped its query in the meantime
            request.respond.send(response).ok();
        }
    }
}

/// The answer to a single [`BatchedPool::query`].
///
/// Yields at most one item and then ends.
#[must_use = "streams do nothing unless polled"]
pub struct Query<O, E> {
    response: Option<oneshot::Receiver<Result<Option<O>, E>>>,
}

impl<O, E> Stream for Query<O, E> {
    type Item = Result<Option<O>, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(response) = self.response.as_mut() else {
            return Poll::Ready(None);
        };
        let item = match Pin::new(response).poll(cx) {
            Poll::Ready(Ok(item)) => Some(item),
            Poll::Ready(Err(oneshot::Canceled)) => None,
            Poll::Pending => return Poll::Pending,
        };
        self.response = None;
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.response {
            Some(_) => (0, Some(1)),
            None => (0, Some(0)),
        }
    }
}

impl<O, E> FusedStream for Query<O, E> {
    fn is_terminated(&self) -> bool {
        self.response.is_none()
    }
}

impl<O, E> fmt::Debug for Query<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("terminated", &self.response.is_none())
            .finish()
    }
}
