use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::blob::BlobStore;
use crate::error::{AnalysisError, BlobError, RecommendationError};
use crate::llm::LlmClient;
use crate::models::{AlertId, Finding, PatientId, StreamCounts, StreamRecords};

const RECOMMENDATION_MAX_TOKENS: u32 = 2000;

const RECOMMENDATION_SYSTEM_PROMPT: &str = "\
You are an expert physician providing clinical recommendations to a care coordinator.

Structure the recommendation as:
1. Clinical Context: brief summary
2. Potential Causes: possible causes
3. Recommended Actions: specific interventions
4. Follow-up: timeline for reassessment

Keep it professional, evidence-based and actionable.";

pub fn recommendation_key(alert_id: AlertId, patient_id: PatientId) -> String {
    format!("{alert_id}_{patient_id}_recommendation")
}

/// Key used before recommendations carried the patient id.
pub fn legacy_recommendation_key(alert_id: AlertId) -> String {
    format!("{alert_id}_recommendation")
}

#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(
        &self,
        patient_id: PatientId,
        finding: &Finding,
        recent: &StreamRecords,
    ) -> Result<String, AnalysisError>;
}

pub struct LlmRecommender {
    client: Arc<dyn LlmClient>,
}

impl LlmRecommender {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

pub fn render_context(
    patient_id: PatientId,
    finding: &Finding,
    recent: &StreamRecords,
) -> Result<String, AnalysisError> {
    Ok(format!(
        "PATIENT ID: {patient_id}\n\n\
         IDENTIFIED ALERT:\nType: {}\nDetails: {}\n\n\
         RECENT CLINICAL DATA:\nVitals: {}\nLabs: {}\nMedications: {}\n\n\
         Provide comprehensive clinical recommendations.",
        finding.label,
        finding.detail,
        serde_json::to_string(&recent.vitals)?,
        serde_json::to_string(&recent.labs)?,
        serde_json::to_string(&recent.medications)?,
    ))
}

#[async_trait]
impl Recommender for LlmRecommender {
    async fn recommend(
        &self,
        patient_id: PatientId,
        finding: &Finding,
        recent: &StreamRecords,
    ) -> Result<String, AnalysisError> {
        let context = render_context(patient_id, finding, recent)?;
        self.client
            .generate(RECOMMENDATION_SYSTEM_PROMPT, &context, RECOMMENDATION_MAX_TOKENS)
            .await
    }
}

/// Generates guidance for a freshly created alert and stores it under
/// [`recommendation_key`].
pub struct RecommendationPipeline {
    recommender: Arc<dyn Recommender>,
    blobs: Arc<dyn BlobStore>,
    context: StreamCounts,
    llm_deadline: Duration,
    blob_deadline: Duration,
}

impl RecommendationPipeline {
    pub fn new(
        recommender: Arc<dyn Recommender>,
        blobs: Arc<dyn BlobStore>,
        context: StreamCounts,
        llm_deadline: Duration,
        blob_deadline: Duration,
    ) -> Self {
        Self {
            recommender,
            blobs,
            context,
            llm_deadline,
            blob_deadline,
        }
    }

    pub async fn generate_and_store(
        &self,
        alert_id: AlertId,
        patient_id: PatientId,
        finding: &Finding,
        records: &StreamRecords,
    ) -> Result<String, RecommendationError> {
        let recent = records.recent(self.context);
        let text = tokio::time::timeout(
            self.llm_deadline,
            self.recommender.recommend(patient_id, finding, &recent),
        )
        .await
        .map_err(|_| RecommendationError::Deadline(self.llm_deadline))??;

        let key = recommendation_key(alert_id, patient_id);
        let size = text.len();
        tokio::time::timeout(self.blob_deadline, self.blobs.put(&key, text.into_bytes()))
            .await
            .map_err(|_| RecommendationError::Deadline(self.blob_deadline))??;

        info!(
            target: "care_monitor::recommendation",
            alert_id,
            patient_id,
            key = %key,
            bytes = size,
            "recommendation saved"
        );
        Ok(key)
    }
}

/// Fetches the recommendation for an alert, trying the patient-scoped key
/// first and the legacy key second.
pub async fn lookup_recommendation(
    blobs: &dyn BlobStore,
    alert_id: AlertId,
    patient_id: Option<PatientId>,
) -> Result<Option<String>, BlobError> {
    if let Some(patient_id) = patient_id {
        match blobs.get(&recommendation_key(alert_id, patient_id)).await {
            Ok(bytes) => return Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(BlobError::NotFound(key)) => {
                debug!(
                    target: "care_monitor::recommendation",
                    alert_id,
                    key = %key,
                    "patient-scoped recommendation missing, trying legacy key"
                );
            }
            Err(err) => return Err(err),
        }
    }

    match blobs.get(&legacy_recommendation_key(alert_id)).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(BlobError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
