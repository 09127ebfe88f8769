use std::time::Duration;

use crate::models::StreamCounts;

/// What to write for a stream that has no record inside the window while
/// another stream of the same patient does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StaleStreamPolicy {
    /// Write the stream as unset, dropping any earlier checkpoint value.
    #[default]
    Overwrite,
    /// Keep the earlier checkpoint value for that stream.
    Preserve,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub window: chrono::Duration,
    pub analysis_sample: usize,
    pub recommendation_context: StreamCounts,
    pub dedup_threshold: usize,
    pub store_deadline: Duration,
    pub llm_deadline: Duration,
    pub blob_deadline: Duration,
    pub lease_ttl: chrono::Duration,
    pub stale_streams: StaleStreamPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            window: chrono::Duration::days(30),
            analysis_sample: 10,
            recommendation_context: StreamCounts {
                vitals: 5,
                labs: 5,
                medications: 10,
            },
            dedup_threshold: crate::dedup::DEFAULT_THRESHOLD,
            store_deadline: Duration::from_secs(30),
            llm_deadline: Duration::from_secs(120),
            blob_deadline: Duration::from_secs(30),
            lease_ttl: chrono::Duration::minutes(5),
            stale_streams: StaleStreamPolicy::Overwrite,
        }
    }
}

impl MonitorConfig {
    pub fn window_days(&self) -> i64 {
        self.window.num_days().max(1)
    }
}
