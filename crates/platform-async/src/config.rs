use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::Error;

/// Controls how a [`BatchedPool`](crate::BatchedPool) groups queries into windows.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of queued inputs in one window.
    ///
    /// A window is dispatched as soon as it holds this many inputs, duplicates included.
    pub batch_size: usize,

    /// Maximum time a window stays open after its first input arrived.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl BatchConfig {
    /// Checks that the configuration can drive a pool.
    pub fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::InvalidBatchSize);
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            batch_size: 100,
            window: Duration::from_millis(20),
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "platform".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}
