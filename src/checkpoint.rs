use tracing::warn;

use crate::config::StaleStreamPolicy;
use crate::models::{PatientId, Stream, StreamRecords, StreamTimestamps};

/// Timestamp of the newest fetched record of each stream.
pub fn latest_timestamps(records: &StreamRecords) -> StreamTimestamps {
    let mut latest = StreamTimestamps::default();
    for stream in Stream::ALL {
        let newest = records.get(stream).iter().map(|r| r.recorded_at).max();
        latest.set(stream, newest);
    }
    latest
}

/// Streams whose newest record is later than the stored checkpoint, or
/// whose checkpoint value is unset.
pub fn changed_streams(
    latest: &StreamTimestamps,
    checkpoint: Option<&StreamTimestamps>,
) -> Vec<Stream> {
    Stream::ALL
        .into_iter()
        .filter(|stream| {
            let Some(newest) = latest.get(*stream) else {
                return false;
            };
            match checkpoint.and_then(|c| c.get(*stream)) {
                Some(seen) => newest > seen,
                None => true,
            }
        })
        .collect()
}

pub fn is_dirty(latest: &StreamTimestamps, checkpoint: Option<&StreamTimestamps>) -> bool {
    !changed_streams(latest, checkpoint).is_empty()
}

/// Checkpoint row to write after a completed evaluation.
pub fn next_checkpoint(
    patient_id: PatientId,
    latest: &StreamTimestamps,
    previous: Option<&StreamTimestamps>,
    policy: StaleStreamPolicy,
) -> StreamTimestamps {
    let mut next = *latest;
    let Some(previous) = previous else {
        return next;
    };

    for stream in Stream::ALL {
        let (Some(seen), None) = (previous.get(stream), latest.get(stream)) else {
            continue;
        };
        match policy {
            StaleStreamPolicy::Overwrite => {
                warn!(
                    target: "care_monitor::checkpoint",
                    patient_id,
                    stream = %stream,
                    previous = %seen,
                    "stream has no record in window; clearing its checkpoint"
                );
            }
            StaleStreamPolicy::Preserve => next.set(stream, Some(seen)),
        }
    }
    next
}
