use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AlertId, Checkpoint, ClinicalRecord, FacilityId, NewAlert, OpenAlert, PatientId, Stream,
    StreamTimestamps,
};
use crate::store::RecordStore;

pub async fn init_db(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let facilities = vec![(1_i64, "Maple Grove Senior Living"), (2, "Riverside Care Home")];
    for (facility_id, name) in facilities {
        sqlx::query(
            r#"
            INSERT INTO care_monitor.facilities (facility_id, facility_name)
            VALUES ($1, $2)
            ON CONFLICT (facility_id) DO UPDATE SET facility_name = EXCLUDED.facility_name
            "#,
        )
        .bind(facility_id)
        .bind(name)
        .execute(pool)
        .await?;
    }

    let patients = vec![
        (101_i64, "Avery", "Lee", Some(1_i64)),
        (102, "Jules", "Moreno", Some(1)),
        (103, "Kiara", "Patel", None),
    ];
    for (patient_id, first, last, facility_id) in patients {
        upsert_patient(pool, patient_id, Some((first, last)), facility_id).await?;
    }

    let now = Utc::now();
    let records = vec![
        (
            "seed-vitals-001",
            Stream::Vitals,
            101,
            now - Duration::hours(6),
            json!({"bp": "118/76", "heart_rate": 72, "temperature_f": 98.4, "spo2": 97}),
        ),
        (
            "seed-lab-001",
            Stream::Lab,
            101,
            now - Duration::hours(5),
            json!({"sodium": 148, "potassium": 4.2, "bun": 15, "creatinine": 0.9, "glucose": 96}),
        ),
        (
            "seed-vitals-002",
            Stream::Vitals,
            102,
            now - Duration::days(2),
            json!({"bp": "124/82", "heart_rate": 88, "spo2": 94}),
        ),
        (
            "seed-med-001",
            Stream::Medication,
            103,
            now - Duration::days(1),
            json!({"name": "lisinopril", "dose": "10 mg", "frequency": "daily"}),
        ),
    ];
    for (source_key, stream, patient_id, recorded_at, payload) in records {
        insert_record(pool, stream, patient_id, recorded_at, &payload, source_key).await?;
    }

    Ok(())
}

async fn upsert_patient(
    pool: &PgPool,
    patient_id: PatientId,
    name: Option<(&str, &str)>,
    facility_id: Option<FacilityId>,
) -> anyhow::Result<()> {
    let (first, last) = name.unzip();
    sqlx::query(
        r#"
        INSERT INTO care_monitor.patients
        (patient_id, patient_first_name, patient_last_name, facility_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (patient_id) DO UPDATE
        SET patient_first_name =
                COALESCE(EXCLUDED.patient_first_name, care_monitor.patients.patient_first_name),
            patient_last_name =
                COALESCE(EXCLUDED.patient_last_name, care_monitor.patients.patient_last_name),
            facility_id = COALESCE(EXCLUDED.facility_id, care_monitor.patients.facility_id)
        "#,
    )
    .bind(patient_id)
    .bind(first)
    .bind(last)
    .bind(facility_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert patient {patient_id}"))?;
    Ok(())
}

async fn insert_record(
    pool: &PgPool,
    stream: Stream,
    patient_id: PatientId,
    recorded_at: DateTime<Utc>,
    payload: &serde_json::Value,
    source_key: &str,
) -> anyhow::Result<bool> {
    let query = format!(
        "INSERT INTO {} (id, patient_id, recorded_at, payload, source_key) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (source_key) DO NOTHING",
        stream.table()
    );
    let result = sqlx::query(&query)
        .bind(Uuid::new_v4())
        .bind(patient_id)
        .bind(recorded_at)
        .bind(payload)
        .bind(source_key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Loads records of one stream from a CSV file with columns
/// `patient_id,recorded_at,payload[,facility_id][,source_key]`, where
/// `payload` is a JSON object.
pub async fn import_csv(
    pool: &PgPool,
    stream: Stream,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        patient_id: PatientId,
        recorded_at: DateTime<Utc>,
        payload: String,
        facility_id: Option<FacilityId>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid CSV row {}", line + 2))?;
        let payload: serde_json::Value = serde_json::from_str(&row.payload)
            .with_context(|| format!("row {} payload is not valid JSON", line + 2))?;

        upsert_patient(pool, row.patient_id, None, row.facility_id).await?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        if insert_record(
            pool,
            stream,
            row.patient_id,
            row.recorded_at,
            &payload,
            &source_key,
        )
        .await?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// [`RecordStore`] over the `care_monitor` Postgres schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn patients_with_records_since(
        &self,
        stream: Stream,
        since: DateTime<Utc>,
    ) -> Result<Vec<PatientId>, StoreError> {
        let query = format!(
            "SELECT DISTINCT patient_id FROM {} WHERE recorded_at >= $1",
            stream.table()
        );
        let rows = sqlx::query(&query).bind(since).fetch_all(&self.pool).await?;
        let mut patients: Vec<PatientId> = Vec::with_capacity(rows.len());
        for row in rows {
            patients.push(row.try_get("patient_id")?);
        }
        Ok(patients)
    }

    async fn list_records(
        &self,
        stream: Stream,
        patient_id: PatientId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClinicalRecord>, StoreError> {
        let query = format!(
            "SELECT id, patient_id, recorded_at, payload FROM {} \
             WHERE patient_id = $1 AND recorded_at >= $2 \
             ORDER BY recorded_at DESC",
            stream.table()
        );
        let rows = sqlx::query(&query)
            .bind(patient_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(ClinicalRecord {
                id: row.try_get("id")?,
                stream,
                patient_id: row.try_get("patient_id")?,
                recorded_at: row.try_get("recorded_at")?,
                payload: row.try_get("payload")?,
            });
        }
        Ok(records)
    }

    async fn get_checkpoint(
        &self,
        patient_id: PatientId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT vitals_last_date_time, lab_last_date_time, medication_last_date_time
            FROM care_monitor.eval
            WHERE patient_id = $1
            "#,
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Checkpoint {
            patient_id,
            last_seen: StreamTimestamps {
                vitals: row.try_get("vitals_last_date_time")?,
                lab: row.try_get("lab_last_date_time")?,
                medication: row.try_get("medication_last_date_time")?,
            },
        }))
    }

    async fn upsert_checkpoint(
        &self,
        patient_id: PatientId,
        last_seen: &StreamTimestamps,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO care_monitor.eval
            (patient_id, vitals_last_date_time, lab_last_date_time, medication_last_date_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (patient_id) DO UPDATE
            SET vitals_last_date_time = EXCLUDED.vitals_last_date_time,
                lab_last_date_time = EXCLUDED.lab_last_date_time,
                medication_last_date_time = EXCLUDED.medication_last_date_time
            "#,
        )
        .bind(patient_id)
        .bind(last_seen.vitals)
        .bind(last_seen.lab)
        .bind(last_seen.medication)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_open_alert(
        &self,
        patient_id: PatientId,
    ) -> Result<Option<OpenAlert>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT alert_id, alert_type
            FROM care_monitor.alert
            WHERE patient_id = $1 AND alert_archive = FALSE
            ORDER BY alert_date_time DESC, alert_id DESC
            LIMIT 1
            "#,
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(OpenAlert {
                alert_id: row.try_get("alert_id")?,
                label: row.try_get("alert_type")?,
            })),
            None => Ok(None),
        }
    }

    async fn patient_facility(
        &self,
        patient_id: PatientId,
    ) -> Result<Option<FacilityId>, StoreError> {
        let facility: Option<Option<FacilityId>> = sqlx::query_scalar(
            "SELECT facility_id FROM care_monitor.patients WHERE patient_id = $1",
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(facility.flatten())
    }

    async fn insert_alert(&self, alert: &NewAlert) -> Result<AlertId, StoreError> {
        let alert_id: AlertId = sqlx::query_scalar(
            r#"
            INSERT INTO care_monitor.alert
            (patient_id, alert_type, alert_detail, facility_id, alert_date_time, alert_archive)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            RETURNING alert_id
            "#,
        )
        .bind(alert.patient_id)
        .bind(&alert.label)
        .bind(&alert.detail)
        .bind(alert.facility_id)
        .bind(alert.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(alert_id)
    }

    async fn alert_patient(&self, alert_id: AlertId) -> Result<Option<PatientId>, StoreError> {
        let patient_id: Option<PatientId> = sqlx::query_scalar(
            "SELECT patient_id FROM care_monitor.alert WHERE alert_id = $1",
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(patient_id)
    }

    async fn count_recent_open_alerts(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM care_monitor.alert
            WHERE alert_date_time >= $1 AND alert_archive = FALSE
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn try_acquire_lease(
        &self,
        patient_id: PatientId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let acquired: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO care_monitor.monitor_lease (patient_id, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (patient_id) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE care_monitor.monitor_lease.expires_at < $4
               OR care_monitor.monitor_lease.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(patient_id)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    async fn renew_lease(
        &self,
        patient_id: PatientId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let renewed: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE care_monitor.monitor_lease
            SET expires_at = $3
            WHERE patient_id = $1 AND holder = $2
            RETURNING holder
            "#,
        )
        .bind(patient_id)
        .bind(holder)
        .bind(Utc::now() + ttl)
        .fetch_optional(&self.pool)
        .await?;
        Ok(renewed.is_some())
    }

    async fn release_lease(&self, patient_id: PatientId, holder: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM care_monitor.monitor_lease WHERE patient_id = $1 AND holder = $2")
            .bind(patient_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
