use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AlertId, Checkpoint, ClinicalRecord, FacilityId, NewAlert, OpenAlert, PatientId, Stream,
    StreamTimestamps,
};

/// Query contract the monitoring pipeline needs from the durable store.
///
/// Every argument is bound as a typed value; implementations never
/// interpolate caller data into query text.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Distinct patients with at least one `stream` record at or after `since`.
    async fn patients_with_records_since(
        &self,
        stream: Stream,
        since: DateTime<Utc>,
    ) -> Result<Vec<PatientId>, StoreError>;

    /// Records of one stream for a patient at or after `since`, newest first.
    async fn list_records(
        &self,
        stream: Stream,
        patient_id: PatientId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClinicalRecord>, StoreError>;

    async fn get_checkpoint(&self, patient_id: PatientId)
        -> Result<Option<Checkpoint>, StoreError>;

    /// Inserts the checkpoint row or replaces all three timestamps in place.
    async fn upsert_checkpoint(
        &self,
        patient_id: PatientId,
        last_seen: &StreamTimestamps,
    ) -> Result<(), StoreError>;

    async fn latest_open_alert(&self, patient_id: PatientId)
        -> Result<Option<OpenAlert>, StoreError>;

    async fn patient_facility(&self, patient_id: PatientId)
        -> Result<Option<FacilityId>, StoreError>;

    async fn insert_alert(&self, alert: &NewAlert) -> Result<AlertId, StoreError>;

    async fn alert_patient(&self, alert_id: AlertId) -> Result<Option<PatientId>, StoreError>;

    /// Non-archived alerts created at or after `since`.
    async fn count_recent_open_alerts(&self, since: DateTime<Utc>) -> Result<i64, StoreError>;

    /// Takes the per-patient evaluation lease for `holder` unless another
    /// holder owns an unexpired one.
    async fn try_acquire_lease(
        &self,
        patient_id: PatientId,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError>;

    /// Extends a lease `holder` still owns. Returns `false` once the row is
    /// gone or belongs to someone else, even if it was ours earlier.
    async fn renew_lease(
        &self,
        patient_id: PatientId,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError>;

    async fn release_lease(&self, patient_id: PatientId, holder: Uuid) -> Result<(), StoreError>;
}
