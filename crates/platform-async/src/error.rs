use std::io;

use thiserror::Error;

/// Errors raised by this crate itself.
///
/// Failures of user-supplied `update` and `fetch` functions are never wrapped into this type.
/// They reach the caller verbatim as the error half of the result the caller is waiting on.
#[derive(Debug, Error)]
pub enum Error {
    /// [`Cancellation::try_map`](crate::Cancellation::try_map) was called without a source.
    #[error("source stream is missing")]
    MissingSource,
    /// A [`BatchConfig`](crate::BatchConfig) with a batch size of zero.
    #[error("batch size must be positive")]
    InvalidBatchSize,
    /// The statsd address could not be resolved or bound.
    #[error("failed to set up statsd socket")]
    StatsdSocket(#[source] io::Error),
    /// The statsd sink could not be created.
    #[error("failed to create statsd sink")]
    StatsdSink(#[from] cadence::MetricError),
}
