use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub type PatientId = i64;
pub type AlertId = i64;
pub type FacilityId = i64;
pub type AdminId = i64;

/// The three record streams tracked per patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Vitals,
    Lab,
    Medication,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::Vitals, Stream::Lab, Stream::Medication];

    pub fn table(self) -> &'static str {
        match self {
            Stream::Vitals => "care_monitor.vitals_data",
            Stream::Lab => "care_monitor.lab_result",
            Stream::Medication => "care_monitor.medication",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stream::Vitals => "vitals",
            Stream::Lab => "lab",
            Stream::Medication => "medication",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One clinical record. Only the timestamp matters to the pipeline; the
/// payload is forwarded to the analysis prompt untouched.
#[derive(Debug, Clone, Serialize)]
pub struct ClinicalRecord {
    pub id: Uuid,
    #[serde(skip)]
    pub stream: Stream,
    pub patient_id: PatientId,
    pub recorded_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Records fetched for one patient, each stream ordered newest-first.
#[derive(Debug, Clone, Default)]
pub struct StreamRecords {
    pub vitals: Vec<ClinicalRecord>,
    pub labs: Vec<ClinicalRecord>,
    pub medications: Vec<ClinicalRecord>,
}

impl StreamRecords {
    pub fn get(&self, stream: Stream) -> &[ClinicalRecord] {
        match stream {
            Stream::Vitals => &self.vitals,
            Stream::Lab => &self.labs,
            Stream::Medication => &self.medications,
        }
    }

    pub fn set(&mut self, stream: Stream, records: Vec<ClinicalRecord>) {
        match stream {
            Stream::Vitals => self.vitals = records,
            Stream::Lab => self.labs = records,
            Stream::Medication => self.medications = records,
        }
    }

    pub fn is_empty(&self) -> bool {
        Stream::ALL.iter().all(|stream| self.get(*stream).is_empty())
    }

    pub fn counts(&self) -> StreamCounts {
        StreamCounts {
            vitals: self.vitals.len(),
            labs: self.labs.len(),
            medications: self.medications.len(),
        }
    }

    /// Keeps at most `limits` records of each stream, newest first.
    pub fn recent(&self, limits: StreamCounts) -> StreamRecords {
        StreamRecords {
            vitals: self.vitals.iter().take(limits.vitals).cloned().collect(),
            labs: self.labs.iter().take(limits.labs).cloned().collect(),
            medications: self
                .medications
                .iter()
                .take(limits.medications)
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamCounts {
    pub vitals: usize,
    pub labs: usize,
    pub medications: usize,
}

impl StreamCounts {
    pub fn uniform(count: usize) -> Self {
        Self {
            vitals: count,
            labs: count,
            medications: count,
        }
    }

    pub fn get(&self, stream: Stream) -> usize {
        match stream {
            Stream::Vitals => self.vitals,
            Stream::Lab => self.labs,
            Stream::Medication => self.medications,
        }
    }
}

/// One optional timestamp per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamTimestamps {
    pub vitals: Option<DateTime<Utc>>,
    pub lab: Option<DateTime<Utc>>,
    pub medication: Option<DateTime<Utc>>,
}

impl StreamTimestamps {
    pub fn get(&self, stream: Stream) -> Option<DateTime<Utc>> {
        match stream {
            Stream::Vitals => self.vitals,
            Stream::Lab => self.lab,
            Stream::Medication => self.medication,
        }
    }

    pub fn set(&mut self, stream: Stream, value: Option<DateTime<Utc>>) {
        match stream {
            Stream::Vitals => self.vitals = value,
            Stream::Lab => self.lab = value,
            Stream::Medication => self.medication = value,
        }
    }
}

/// Persisted "last evaluated" marker for a patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub patient_id: PatientId,
    pub last_seen: StreamTimestamps,
}

/// An abnormality reported by analysis. Becomes an alert only after dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub label: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub patient_id: PatientId,
    pub label: String,
    pub detail: String,
    pub facility_id: Option<FacilityId>,
    pub created_at: DateTime<Utc>,
}

/// Most recent non-archived alert for a patient, as seen by dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAlert {
    pub alert_id: AlertId,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    NoData,
    Unchanged,
    NoFinding,
    DuplicateSuppressed {
        existing_alert_id: AlertId,
    },
    Alerted {
        alert_id: AlertId,
        recommendation_saved: bool,
    },
    LeaseBusy,
}

#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub candidates: usize,
    pub no_data: usize,
    pub unchanged: usize,
    pub no_finding: usize,
    pub suppressed: usize,
    pub lease_busy: usize,
    pub alerted: Vec<AlertId>,
    pub missing_recommendations: Vec<AlertId>,
    pub failed: Vec<(PatientId, String)>,
    pub interrupted: bool,
}

impl CycleSummary {
    pub fn new(started_at: DateTime<Utc>, window_start: DateTime<Utc>) -> Self {
        Self {
            started_at,
            window_start,
            candidates: 0,
            no_data: 0,
            unchanged: 0,
            no_finding: 0,
            suppressed: 0,
            lease_busy: 0,
            alerted: Vec::new(),
            missing_recommendations: Vec::new(),
            failed: Vec::new(),
            interrupted: false,
        }
    }

    pub fn record(&mut self, outcome: &EvaluationOutcome) {
        match outcome {
            EvaluationOutcome::NoData => self.no_data += 1,
            EvaluationOutcome::Unchanged => self.unchanged += 1,
            EvaluationOutcome::NoFinding => self.no_finding += 1,
            EvaluationOutcome::DuplicateSuppressed { .. } => self.suppressed += 1,
            EvaluationOutcome::Alerted {
                alert_id,
                recommendation_saved,
            } => {
                self.alerted.push(*alert_id);
                if !recommendation_saved {
                    self.missing_recommendations.push(*alert_id);
                }
            }
            EvaluationOutcome::LeaseBusy => self.lease_busy += 1,
        }
    }

    pub fn record_failure(&mut self, patient_id: PatientId, error: impl ToString) {
        self.failed.push((patient_id, error.to_string()));
    }

    pub fn evaluated(&self) -> usize {
        self.no_data
            + self.unchanged
            + self.no_finding
            + self.suppressed
            + self.lease_busy
            + self.alerted.len()
            + self.failed.len()
    }
}
