use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{PatientId, Stream};
use crate::store::RecordStore;

pub fn window_start(now: DateTime<Utc>, window: chrono::Duration) -> DateTime<Utc> {
    now - window
}

/// Patients with at least one record in any stream at or after `since`,
/// each listed once, in ascending id order.
pub async fn scan_candidates(
    store: &dyn RecordStore,
    since: DateTime<Utc>,
) -> Result<BTreeSet<PatientId>, StoreError> {
    let mut candidates = BTreeSet::new();
    for stream in Stream::ALL {
        let patients = store.patients_with_records_since(stream, since).await?;
        tracing::debug!(
            target: "care_monitor::scanner",
            stream = %stream,
            count = patients.len(),
            "patients with recent records"
        );
        candidates.extend(patients);
    }
    Ok(candidates)
}
