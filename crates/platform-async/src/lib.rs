//! Asynchronous coordination primitives.
//!
//! - [`Cancellation`]: a hierarchical, one-shot cancellation signal. Streams and futures wrapped
//!   through it end silently once it fires.
//! - [`Cache`]: a single-flight cache that cancels stale work when its input changes.
//! - [`BatchedPool`]: coalesces concurrent point queries into windowed bulk fetches and
//!   demultiplexes the results, isolating failures per window.
//!
//! Results are delivered as [`futures::Stream`]s. A cancelled or superseded computation ends its
//! stream without an item, failures of user-supplied functions are passed through unchanged.

#[macro_use]
pub mod metrics;

mod batching;
mod cache;
mod cancellation;
pub mod config;
mod error;
mod stream;

pub use batching::{BatchedPool, FetchResult, Query};
pub use cache::Cache;
pub use cancellation::{Cancellation, DropGuard};
pub use config::{BatchConfig, MetricsConfig};
pub use error::Error;
pub use stream::{CancellableStream, Cancelled};
