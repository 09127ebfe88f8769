//! In-process [`RecordStore`] for tests, with switches to make individual
//! writes fail.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AlertId, Checkpoint, ClinicalRecord, FacilityId, NewAlert, OpenAlert, PatientId, Stream,
    StreamTimestamps,
};
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct StoredAlert {
    pub alert_id: AlertId,
    pub patient_id: PatientId,
    pub label: String,
    pub detail: String,
    pub facility_id: Option<FacilityId>,
    pub created_at: DateTime<Utc>,
    pub archived: bool,
}

#[derive(Default)]
struct Inner {
    records: Vec<ClinicalRecord>,
    facilities: HashMap<PatientId, FacilityId>,
    checkpoints: HashMap<PatientId, StreamTimestamps>,
    alerts: Vec<StoredAlert>,
    leases: HashMap<PatientId, (Uuid, DateTime<Utc>)>,
    checkpoint_writes: usize,
    fail_alert_inserts: bool,
    fail_checkpoint_writes: bool,
    stall_scans: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))
    }

    pub fn add_record(
        &self,
        stream: Stream,
        patient_id: PatientId,
        recorded_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut inner) = self.lock() {
            inner.records.push(ClinicalRecord {
                id,
                stream,
                patient_id,
                recorded_at,
                payload,
            });
        }
        id
    }

    pub fn set_facility(&self, patient_id: PatientId, facility_id: FacilityId) {
        if let Ok(mut inner) = self.lock() {
            inner.facilities.insert(patient_id, facility_id);
        }
    }

    pub fn set_checkpoint(&self, patient_id: PatientId, last_seen: StreamTimestamps) {
        if let Ok(mut inner) = self.lock() {
            inner.checkpoints.insert(patient_id, last_seen);
        }
    }

    pub fn checkpoint(&self, patient_id: PatientId) -> Option<StreamTimestamps> {
        self.lock()
            .ok()
            .and_then(|inner| inner.checkpoints.get(&patient_id).copied())
    }

    pub fn checkpoint_writes(&self) -> usize {
        self.lock().map(|inner| inner.checkpoint_writes).unwrap_or(0)
    }

    pub fn alerts(&self) -> Vec<StoredAlert> {
        self.lock()
            .map(|inner| inner.alerts.clone())
            .unwrap_or_default()
    }

    pub fn archive_alert(&self, alert_id: AlertId) {
        if let Ok(mut inner) = self.lock() {
            for alert in inner.alerts.iter_mut().filter(|a| a.alert_id == alert_id) {
                alert.archived = true;
            }
        }
    }

    pub fn fail_alert_inserts(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_alert_inserts = fail;
        }
    }

    pub fn fail_checkpoint_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_checkpoint_writes = fail;
        }
    }

    /// Makes candidate scans hang until the caller gives up.
    pub fn stall_scans(&self, stall: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.stall_scans = stall;
        }
    }

    pub fn hold_lease(&self, patient_id: PatientId, holder: Uuid, until: DateTime<Utc>) {
        if let Ok(mut inner) = self.lock() {
            inner.leases.insert(patient_id, (holder, until));
        }
    }

    pub fn lease_holder(&self, patient_id: PatientId) -> Option<Uuid> {
        self.lock()
            .ok()
            .and_then(|inner| inner.leases.get(&patient_id).map(|(holder, _)| *holder))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn patients_with_records_since(
        &self,
        stream: Stream,
        since: DateTime<Utc>,
    ) -> Result<Vec<PatientId>, StoreError> {
        let stalled = self.lock()?.stall_scans;
        if stalled {
            std::future::pending::<()>().await;
        }
        let inner = self.lock()?;
        let ids: BTreeSet<PatientId> = inner
            .records
            .iter()
            .filter(|r| r.stream == stream && r.recorded_at >= since)
            .map(|r| r.patient_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn list_records(
        &self,
        stream: Stream,
        patient_id: PatientId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClinicalRecord>, StoreError> {
        let inner = self.lock()?;
        let mut records: Vec<ClinicalRecord> = inner
            .records
            .iter()
            .filter(|r| r.stream == stream && r.patient_id == patient_id && r.recorded_at >= since)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(records)
    }

    async fn get_checkpoint(
        &self,
        patient_id: PatientId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .checkpoints
            .get(&patient_id)
            .map(|last_seen| Checkpoint {
                patient_id,
                last_seen: *last_seen,
            }))
    }

    async fn upsert_checkpoint(
        &self,
        patient_id: PatientId,
        last_seen: &StreamTimestamps,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.fail_checkpoint_writes {
            return Err(StoreError::Unavailable("checkpoint write rejected".to_string()));
        }
        inner.checkpoints.insert(patient_id, *last_seen);
        inner.checkpoint_writes += 1;
        Ok(())
    }

    async fn latest_open_alert(
        &self,
        patient_id: PatientId,
    ) -> Result<Option<OpenAlert>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .alerts
            .iter()
            .filter(|a| a.patient_id == patient_id && !a.archived)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then(a.alert_id.cmp(&b.alert_id))
            })
            .map(|a| OpenAlert {
                alert_id: a.alert_id,
                label: a.label.clone(),
            }))
    }

    async fn patient_facility(
        &self,
        patient_id: PatientId,
    ) -> Result<Option<FacilityId>, StoreError> {
        Ok(self.lock()?.facilities.get(&patient_id).copied())
    }

    async fn insert_alert(&self, alert: &NewAlert) -> Result<AlertId, StoreError> {
        let mut inner = self.lock()?;
        if inner.fail_alert_inserts {
            return Err(StoreError::Unavailable("alert insert rejected".to_string()));
        }
        let alert_id = inner.alerts.len() as AlertId + 1;
        inner.alerts.push(StoredAlert {
            alert_id,
            patient_id: alert.patient_id,
            label: alert.label.clone(),
            detail: alert.detail.clone(),
            facility_id: alert.facility_id,
            created_at: alert.created_at,
            archived: false,
        });
        Ok(alert_id)
    }

    async fn alert_patient(&self, alert_id: AlertId) -> Result<Option<PatientId>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .alerts
            .iter()
            .find(|a| a.alert_id == alert_id)
            .map(|a| a.patient_id))
    }

    async fn count_recent_open_alerts(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .alerts
            .iter()
            .filter(|a| !a.archived && a.created_at >= since)
            .count() as i64)
    }

    async fn try_acquire_lease(
        &self,
        patient_id: PatientId,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        match inner.leases.get(&patient_id) {
            Some((current, expires_at)) if *current != holder && *expires_at >= now => Ok(false),
            _ => {
                inner.leases.insert(patient_id, (holder, now + ttl));
                Ok(true)
            }
        }
    }

    async fn renew_lease(
        &self,
        patient_id: PatientId,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner.leases.get_mut(&patient_id) {
            Some((current, expires_at)) if *current == holder => {
                *expires_at = Utc::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, patient_id: PatientId, holder: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if matches!(inner.leases.get(&patient_id), Some((current, _)) if *current == holder) {
            inner.leases.remove(&patient_id);
        }
        Ok(())
    }
}
