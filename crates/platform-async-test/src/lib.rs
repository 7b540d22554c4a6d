//! Helpers for testing the coordination primitives.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every integration test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - Batching windows are driven by tokio timers. Call `tokio::time::pause()` at the start of a
//!    test so windows close deterministically as soon as the runtime is idle.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use tracing_subscriber::filter::EnvFilter;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `platform_async` crate and mutes
///    all other logs.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("platform_async=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Returns the first item of `stream`, or `None` if it ends without one.
pub async fn first<S: Stream + Unpin>(mut stream: S) -> Option<S::Item> {
    stream.next().await
}

/// Records the input sets a fetch function was called with.
pub struct FetchLog<I> {
    calls: Arc<Mutex<Vec<HashSet<I>>>>,
}

impl<I: Clone + Eq + Hash> FetchLog<I> {
    /// Records one fetch call.
    pub fn record(&self, inputs: &HashSet<I>) {
        self.calls.lock().unwrap().push(inputs.clone());
    }

    /// All recorded input sets, in call order.
    pub fn calls(&self) -> Vec<HashSet<I>> {
        self.calls.lock().unwrap().clone()
    }

    /// The size of every recorded input set, in call order.
    pub fn sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(HashSet::len).collect()
    }
}

impl<I> Clone for FetchLog<I> {
    fn clone(&self) -> Self {
        FetchLog {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<I> Default for FetchLog<I> {
    fn default() -> Self {
        FetchLog {
            calls: Default::default(),
        }
    }
}

impl<I: fmt::Debug> fmt::Debug for FetchLog<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchLog")
            .field("calls", &*self.calls.lock().unwrap())
            .finish()
    }
}
