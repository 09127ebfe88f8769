//! Per-patient evaluation: fetch, change detection, analysis, dedup, alert,
//! recommendation and checkpoint advance.
//!
//! The checkpoint is written once per completed path and only after the
//! writes it depends on. A failed alert insert leaves it untouched, so the
//! same records are seen as dirty again next cycle. A failed recommendation
//! does not hold it back. The patient's lease is renewed before the alert
//! insert and before the checkpoint write; losing it aborts the evaluation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisInput, Analyzer};
use crate::checkpoint;
use crate::config::MonitorConfig;
use crate::dedup;
use crate::error::{EvalError, EvalStage, StoreError};
use crate::models::{
    EvaluationOutcome, Finding, NewAlert, PatientId, Stream, StreamCounts, StreamRecords,
    StreamTimestamps,
};
use crate::recommendation::RecommendationPipeline;
use crate::store::RecordStore;

pub struct Evaluator {
    store: Arc<dyn RecordStore>,
    analyzer: Arc<dyn Analyzer>,
    recommendations: RecommendationPipeline,
    config: MonitorConfig,
    holder: Uuid,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        analyzer: Arc<dyn Analyzer>,
        recommendations: RecommendationPipeline,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            analyzer,
            recommendations,
            config,
            holder: Uuid::new_v4(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Evaluates one patient against records at or after `since`, holding
    /// the patient's lease for the duration.
    pub async fn evaluate(
        &self,
        patient_id: PatientId,
        since: DateTime<Utc>,
    ) -> Result<EvaluationOutcome, EvalError> {
        let acquired = self
            .store_step(
                EvalStage::AcquireLease,
                self.store
                    .try_acquire_lease(patient_id, self.holder, self.config.lease_ttl),
            )
            .await?;
        if !acquired {
            info!(
                target: "care_monitor::eval",
                patient_id,
                "another evaluation holds this patient's lease; skipping"
            );
            return Ok(EvaluationOutcome::LeaseBusy);
        }

        let outcome = self.evaluate_locked(patient_id, since).await;

        if let Err(err) = self.store.release_lease(patient_id, self.holder).await {
            warn!(
                target: "care_monitor::eval",
                patient_id,
                error = %err,
                "failed to release lease; it will lapse on expiry"
            );
        }
        outcome
    }

    async fn evaluate_locked(
        &self,
        patient_id: PatientId,
        since: DateTime<Utc>,
    ) -> Result<EvaluationOutcome, EvalError> {
        let records = self.fetch_records(patient_id, since).await?;
        if records.is_empty() {
            debug!(target: "care_monitor::eval", patient_id, "no records in window");
            return Ok(EvaluationOutcome::NoData);
        }

        let latest = checkpoint::latest_timestamps(&records);
        let previous = self
            .store_step(
                EvalStage::LoadCheckpoint,
                self.store.get_checkpoint(patient_id),
            )
            .await?
            .map(|c| c.last_seen);

        let changed = checkpoint::changed_streams(&latest, previous.as_ref());
        if changed.is_empty() {
            debug!(target: "care_monitor::eval", patient_id, "no new records since checkpoint");
            return Ok(EvaluationOutcome::Unchanged);
        }
        info!(
            target: "care_monitor::eval",
            patient_id,
            changed = ?changed,
            "new records detected"
        );

        let input = AnalysisInput {
            patient_id,
            window_days: self.config.window_days(),
            totals: records.counts(),
            sample: records.recent(StreamCounts::uniform(self.config.analysis_sample)),
        };
        let finding = self
            .deadline(
                EvalStage::Analyze,
                self.config.llm_deadline,
                self.analyzer.analyze(&input),
            )
            .await?;

        let next = checkpoint::next_checkpoint(
            patient_id,
            &latest,
            previous.as_ref(),
            self.config.stale_streams,
        );

        let Some(finding) = finding else {
            self.advance(patient_id, &next).await?;
            info!(target: "care_monitor::eval", patient_id, "no abnormality found");
            return Ok(EvaluationOutcome::NoFinding);
        };

        let open = self
            .store_step(
                EvalStage::LoadOpenAlert,
                self.store.latest_open_alert(patient_id),
            )
            .await?;
        if let Some(open) = open {
            if dedup::is_duplicate(&finding.label, &open.label, self.config.dedup_threshold) {
                self.advance(patient_id, &next).await?;
                info!(
                    target: "care_monitor::eval",
                    patient_id,
                    existing_alert_id = open.alert_id,
                    existing = %open.label,
                    new = %finding.label,
                    "similar open alert exists; suppressed duplicate"
                );
                return Ok(EvaluationOutcome::DuplicateSuppressed {
                    existing_alert_id: open.alert_id,
                });
            }
        }

        self.raise_alert(patient_id, finding, &records, &next).await
    }

    async fn raise_alert(
        &self,
        patient_id: PatientId,
        finding: Finding,
        records: &StreamRecords,
        next: &StreamTimestamps,
    ) -> Result<EvaluationOutcome, EvalError> {
        let facility_id = self
            .store_step(
                EvalStage::LoadFacility,
                self.store.patient_facility(patient_id),
            )
            .await?;
        let alert = NewAlert {
            patient_id,
            label: finding.label.clone(),
            detail: finding.detail.clone(),
            facility_id,
            created_at: Utc::now(),
        };
        self.confirm_lease(patient_id, EvalStage::InsertAlert).await?;
        let alert_id = self
            .store_step(EvalStage::InsertAlert, self.store.insert_alert(&alert))
            .await?;
        info!(
            target: "care_monitor::eval",
            patient_id,
            alert_id,
            facility_id = ?facility_id,
            label = %finding.label,
            "alert created"
        );

        let recommendation_saved = match self
            .recommendations
            .generate_and_store(alert_id, patient_id, &finding, records)
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    target: "care_monitor::eval",
                    patient_id,
                    alert_id,
                    error = %err,
                    "recommendation not saved; alert stands without one"
                );
                false
            }
        };

        self.advance(patient_id, next).await?;
        Ok(EvaluationOutcome::Alerted {
            alert_id,
            recommendation_saved,
        })
    }

    async fn fetch_records(
        &self,
        patient_id: PatientId,
        since: DateTime<Utc>,
    ) -> Result<StreamRecords, EvalError> {
        let mut records = StreamRecords::default();
        for stream in Stream::ALL {
            let fetched = self
                .store_step(
                    EvalStage::FetchRecords,
                    self.store.list_records(stream, patient_id, since),
                )
                .await?;
            records.set(stream, fetched);
        }
        Ok(records)
    }

    async fn advance(
        &self,
        patient_id: PatientId,
        next: &StreamTimestamps,
    ) -> Result<(), EvalError> {
        self.confirm_lease(patient_id, EvalStage::AdvanceCheckpoint).await?;
        self.store_step(
            EvalStage::AdvanceCheckpoint,
            self.store.upsert_checkpoint(patient_id, next),
        )
        .await?;
        debug!(
            target: "care_monitor::eval",
            patient_id,
            vitals = ?next.vitals,
            lab = ?next.lab,
            medication = ?next.medication,
            "checkpoint advanced"
        );
        Ok(())
    }

    /// Renews the lease before a write. Fails when the lease lapsed and was
    /// taken (or taken and released) by another evaluation meanwhile.
    async fn confirm_lease(
        &self,
        patient_id: PatientId,
        stage: EvalStage,
    ) -> Result<(), EvalError> {
        let renewed = self
            .store_step(
                stage,
                self.store
                    .renew_lease(patient_id, self.holder, self.config.lease_ttl),
            )
            .await?;
        if renewed {
            return Ok(());
        }
        warn!(
            target: "care_monitor::eval",
            patient_id,
            stage = %stage,
            "lease lost mid-evaluation; abandoning without writes"
        );
        Err(EvalError::LeaseLost { stage })
    }

    async fn store_step<T>(
        &self,
        stage: EvalStage,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, EvalError> {
        match tokio::time::timeout(self.config.store_deadline, call).await {
            Ok(result) => result.map_err(|source| EvalError::Store { stage, source }),
            Err(_) => Err(EvalError::Deadline {
                stage,
                limit: self.config.store_deadline,
            }),
        }
    }

    async fn deadline<T, E>(
        &self,
        stage: EvalStage,
        limit: Duration,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, EvalError>
    where
        EvalError: From<E>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EvalError::Deadline { stage, limit }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::error::AnalysisError;
    use crate::memory::MemoryStore;
    use crate::recommendation::{lookup_recommendation, recommendation_key, Recommender};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns queued findings in order, then "no finding".
    pub(crate) struct QueuedAnalyzer {
        findings: Mutex<VecDeque<Result<Option<Finding>, String>>>,
        pub calls: Mutex<Vec<AnalysisInput>>,
    }

    impl QueuedAnalyzer {
        pub(crate) fn new(findings: Vec<Result<Option<(&str, &str)>, &str>>) -> Self {
            Self {
                findings: Mutex::new(
                    findings
                        .into_iter()
                        .map(|f| {
                            f.map(|o| {
                                o.map(|(label, detail)| Finding {
                                    label: label.to_string(),
                                    detail: detail.to_string(),
                                })
                            })
                            .map_err(str::to_string)
                        })
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Analyzer for QueuedAnalyzer {
        async fn analyze(
            &self,
            input: &AnalysisInput,
        ) -> Result<Option<Finding>, AnalysisError> {
            self.calls.lock().unwrap().push(input.clone());
            match self.findings.lock().unwrap().pop_front() {
                Some(Ok(finding)) => Ok(finding),
                Some(Err(message)) => Err(AnalysisError::HttpClient(message)),
                None => Ok(None),
            }
        }
    }

    /// Never answers, so only a deadline ends the call.
    struct StalledAnalyzer;

    #[async_trait]
    impl Analyzer for StalledAnalyzer {
        async fn analyze(
            &self,
            _input: &AnalysisInput,
        ) -> Result<Option<Finding>, AnalysisError> {
            std::future::pending().await
        }
    }

    struct StalledRecommender;

    #[async_trait]
    impl Recommender for StalledRecommender {
        async fn recommend(
            &self,
            _patient_id: PatientId,
            _finding: &Finding,
            _recent: &StreamRecords,
        ) -> Result<String, AnalysisError> {
            std::future::pending().await
        }
    }

    /// Hands the patient's lease to another holder while analysis runs, as
    /// happens when a slow evaluation outlives its lease.
    struct TakeoverAnalyzer {
        store: Arc<MemoryStore>,
        other: Uuid,
        release_after: bool,
        finding: Option<Finding>,
    }

    #[async_trait]
    impl Analyzer for TakeoverAnalyzer {
        async fn analyze(
            &self,
            input: &AnalysisInput,
        ) -> Result<Option<Finding>, AnalysisError> {
            self.store.hold_lease(
                input.patient_id,
                self.other,
                Utc::now() + ChronoDuration::minutes(5),
            );
            if self.release_after {
                self.store
                    .release_lease(input.patient_id, self.other)
                    .await
                    .unwrap();
            }
            Ok(self.finding.clone())
        }
    }

    pub(crate) struct FixedRecommender(pub Result<String, String>);

    #[async_trait]
    impl Recommender for FixedRecommender {
        async fn recommend(
            &self,
            _patient_id: PatientId,
            _finding: &Finding,
            _recent: &StreamRecords,
        ) -> Result<String, AnalysisError> {
            self.0.clone().map_err(AnalysisError::HttpClient)
        }
    }

    pub(crate) struct Harness {
        pub store: Arc<MemoryStore>,
        pub blobs: Arc<MemoryBlobStore>,
        pub analyzer: Arc<QueuedAnalyzer>,
        pub evaluator: Evaluator,
    }

    fn build_evaluator(
        store: Arc<MemoryStore>,
        blobs: Arc<MemoryBlobStore>,
        analyzer: Arc<dyn Analyzer>,
        recommender: Arc<dyn Recommender>,
    ) -> Evaluator {
        let config = MonitorConfig::default();
        let recommendations = RecommendationPipeline::new(
            recommender,
            blobs,
            config.recommendation_context,
            config.llm_deadline,
            config.blob_deadline,
        );
        Evaluator::new(store, analyzer, recommendations, config)
    }

    pub(crate) fn harness(findings: Vec<Result<Option<(&str, &str)>, &str>>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let analyzer = Arc::new(QueuedAnalyzer::new(findings));
        let evaluator = build_evaluator(
            store.clone(),
            blobs.clone(),
            analyzer.clone(),
            Arc::new(FixedRecommender(Ok("Recheck electrolytes in 24 hours.".to_string()))),
        );
        Harness {
            store,
            blobs,
            analyzer,
            evaluator,
        }
    }

    fn since() -> DateTime<Utc> {
        Utc::now() - ChronoDuration::days(30)
    }

    const SODIUM: (&str, &str) = ("High Sodium (148 mEq/L)", "Sodium above 145 mEq/L.");

    #[tokio::test]
    async fn first_finding_creates_alert_recommendation_and_checkpoint() {
        let h = harness(vec![Ok(Some(SODIUM))]);
        let t0 = Utc::now() - ChronoDuration::hours(2);
        h.store.add_record(Stream::Lab, 7, t0, json!({"sodium": 148}));
        h.store.set_facility(7, 3);

        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();
        assert_eq!(
            outcome,
            EvaluationOutcome::Alerted {
                alert_id: 1,
                recommendation_saved: true
            }
        );

        let alerts = h.store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].label, SODIUM.0);
        assert_eq!(alerts[0].facility_id, Some(3));
        assert!(!alerts[0].archived);

        assert_eq!(h.blobs.keys(), vec![recommendation_key(1, 7)]);
        assert_eq!(
            h.store.checkpoint(7),
            Some(StreamTimestamps {
                lab: Some(t0),
                ..Default::default()
            })
        );
        assert_eq!(h.store.lease_holder(7), None);
    }

    #[tokio::test]
    async fn unchanged_patient_is_not_analyzed_again() {
        let h = harness(vec![Ok(Some(SODIUM))]);
        h.store
            .add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(2), json!({}));

        h.evaluator.evaluate(7, since()).await.unwrap();
        let writes = h.store.checkpoint_writes();
        let checkpoint = h.store.checkpoint(7);

        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();
        assert_eq!(outcome, EvaluationOutcome::Unchanged);
        assert_eq!(h.analyzer.call_count(), 1);
        assert_eq!(h.store.alerts().len(), 1);
        assert_eq!(h.store.checkpoint_writes(), writes);
        assert_eq!(h.store.checkpoint(7), checkpoint);
    }

    #[tokio::test]
    async fn no_records_skip_analysis() {
        let h = harness(vec![Ok(Some(SODIUM))]);
        h.store
            .add_record(Stream::Vitals, 7, Utc::now() - ChronoDuration::days(45), json!({}));

        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();
        assert_eq!(outcome, EvaluationOutcome::NoData);
        assert_eq!(h.analyzer.call_count(), 0);
        assert_eq!(h.store.checkpoint_writes(), 0);
    }

    #[tokio::test]
    async fn no_finding_advances_checkpoint_only() {
        let h = harness(vec![Ok(None)]);
        let t0 = Utc::now() - ChronoDuration::hours(1);
        h.store.add_record(Stream::Vitals, 7, t0, json!({"hr": 72}));

        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();
        assert_eq!(outcome, EvaluationOutcome::NoFinding);
        assert!(h.store.alerts().is_empty());
        assert_eq!(h.store.checkpoint(7).and_then(|c| c.vitals), Some(t0));
    }

    #[tokio::test]
    async fn identical_label_is_suppressed() {
        let h = harness(vec![Ok(Some(SODIUM)), Ok(Some(SODIUM))]);
        h.store
            .add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(3), json!({}));
        h.evaluator.evaluate(7, since()).await.unwrap();

        let t1 = Utc::now() - ChronoDuration::hours(1);
        h.store.add_record(Stream::Lab, 7, t1, json!({}));
        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();

        assert_eq!(
            outcome,
            EvaluationOutcome::DuplicateSuppressed {
                existing_alert_id: 1
            }
        );
        assert_eq!(h.store.alerts().len(), 1);
        assert_eq!(h.store.checkpoint(7).and_then(|c| c.lab), Some(t1));
    }

    #[tokio::test]
    async fn restated_value_with_two_shared_tokens_raises_new_alert() {
        let h = harness(vec![
            Ok(Some(SODIUM)),
            Ok(Some(("High Sodium (150 mEq/L)", "Sodium rising."))),
        ]);
        h.store
            .add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(3), json!({}));
        h.evaluator.evaluate(7, since()).await.unwrap();
        h.store
            .add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(1), json!({}));

        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Alerted { alert_id: 2, .. }));
        assert_eq!(h.store.alerts().len(), 2);
    }

    #[tokio::test]
    async fn archived_alert_does_not_suppress() {
        let h = harness(vec![Ok(Some(SODIUM)), Ok(Some(SODIUM))]);
        h.store
            .add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(3), json!({}));
        h.evaluator.evaluate(7, since()).await.unwrap();
        h.store.archive_alert(1);
        h.store
            .add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(1), json!({}));

        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Alerted { alert_id: 2, .. }));
    }

    #[tokio::test]
    async fn failed_alert_insert_leaves_checkpoint_untouched() {
        let h = harness(vec![Ok(Some(SODIUM)), Ok(Some(SODIUM))]);
        let before = StreamTimestamps {
            lab: Some(Utc::now() - ChronoDuration::days(2)),
            ..Default::default()
        };
        h.store.set_checkpoint(7, before);
        h.store
            .add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(1), json!({}));
        h.store.fail_alert_inserts(true);

        let err = h.evaluator.evaluate(7, since()).await.unwrap_err();
        assert_eq!(err.stage(), EvalStage::InsertAlert);
        assert_eq!(h.store.checkpoint(7), Some(before));
        assert_eq!(h.store.checkpoint_writes(), 0);
        assert_eq!(h.store.lease_holder(7), None);

        h.store.fail_alert_inserts(false);
        let retry = h.evaluator.evaluate(7, since()).await.unwrap();
        assert!(matches!(retry, EvaluationOutcome::Alerted { .. }));
    }

    #[tokio::test]
    async fn analysis_failure_does_not_advance() {
        let h = harness(vec![Err("endpoint down")]);
        h.store
            .add_record(Stream::Medication, 7, Utc::now() - ChronoDuration::hours(1), json!({}));

        let err = h.evaluator.evaluate(7, since()).await.unwrap_err();
        assert_eq!(err.stage(), EvalStage::Analyze);
        assert_eq!(h.store.checkpoint(7), None);
    }

    #[tokio::test]
    async fn recommendation_failure_still_advances() {
        let h = harness(vec![Ok(Some(SODIUM))]);
        h.blobs.fail_puts(true);
        let t0 = Utc::now() - ChronoDuration::hours(1);
        h.store.add_record(Stream::Lab, 7, t0, json!({}));

        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();
        assert_eq!(
            outcome,
            EvaluationOutcome::Alerted {
                alert_id: 1,
                recommendation_saved: false
            }
        );
        assert_eq!(h.store.alerts()[0].detail, SODIUM.1);
        assert_eq!(
            lookup_recommendation(h.blobs.as_ref(), 1, Some(7)).await.unwrap(),
            None
        );
        assert_eq!(h.store.checkpoint(7).and_then(|c| c.lab), Some(t0));
    }

    #[tokio::test]
    async fn missing_facility_is_recorded_as_absent() {
        let h = harness(vec![Ok(Some(SODIUM))]);
        h.store
            .add_record(Stream::Lab, 9, Utc::now() - ChronoDuration::hours(1), json!({}));
        h.evaluator.evaluate(9, since()).await.unwrap();
        assert_eq!(h.store.alerts()[0].facility_id, None);
    }

    #[tokio::test]
    async fn analysis_receives_bounded_sample_and_full_totals() {
        let h = harness(vec![Ok(None)]);
        for hours in 1..=14 {
            h.store.add_record(
                Stream::Vitals,
                7,
                Utc::now() - ChronoDuration::hours(hours),
                json!({"reading": hours}),
            );
        }
        h.evaluator.evaluate(7, since()).await.unwrap();

        let calls = h.analyzer.calls.lock().unwrap();
        assert_eq!(calls[0].totals.vitals, 14);
        assert_eq!(calls[0].sample.vitals.len(), 10);
        assert_eq!(calls[0].sample.vitals[0].payload, json!({"reading": 1}));
    }

    #[tokio::test]
    async fn busy_lease_skips_without_writes() {
        let h = harness(vec![Ok(Some(SODIUM))]);
        h.store
            .add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(1), json!({}));
        let other = Uuid::new_v4();
        h.store
            .hold_lease(7, other, Utc::now() + ChronoDuration::minutes(5));

        let outcome = h.evaluator.evaluate(7, since()).await.unwrap();
        assert_eq!(outcome, EvaluationOutcome::LeaseBusy);
        assert_eq!(h.analyzer.call_count(), 0);
        assert_eq!(h.store.lease_holder(7), Some(other));
    }

    #[tokio::test]
    async fn checkpoints_never_regress_across_forward_cycles() {
        let h = harness(vec![Ok(None), Ok(None), Ok(None)]);
        let mut previous: Option<StreamTimestamps> = None;
        for hours_ago in [30, 20, 10] {
            h.store.add_record(
                Stream::Lab,
                7,
                Utc::now() - ChronoDuration::hours(hours_ago),
                json!({}),
            );
            h.store.add_record(
                Stream::Vitals,
                7,
                Utc::now() - ChronoDuration::hours(hours_ago),
                json!({}),
            );
            h.evaluator.evaluate(7, since()).await.unwrap();
            let current = h.store.checkpoint(7).unwrap();
            if let Some(prev) = previous {
                assert!(current.lab >= prev.lab);
                assert!(current.vitals >= prev.vitals);
            }
            previous = Some(current);
        }
    }

    #[tokio::test]
    async fn lease_taken_over_during_analysis_blocks_alert_insert() {
        let store = Arc::new(MemoryStore::new());
        let other = Uuid::new_v4();
        let analyzer = Arc::new(TakeoverAnalyzer {
            store: store.clone(),
            other,
            release_after: false,
            finding: Some(Finding {
                label: SODIUM.0.to_string(),
                detail: SODIUM.1.to_string(),
            }),
        });
        let blobs = Arc::new(MemoryBlobStore::new());
        let evaluator = build_evaluator(
            store.clone(),
            blobs.clone(),
            analyzer,
            Arc::new(FixedRecommender(Ok("Recheck sodium.".to_string()))),
        );
        store.add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(1), json!({}));

        let err = evaluator.evaluate(7, since()).await.unwrap_err();
        assert!(matches!(
            err,
            EvalError::LeaseLost {
                stage: EvalStage::InsertAlert
            }
        ));
        assert!(store.alerts().is_empty());
        assert!(blobs.keys().is_empty());
        assert_eq!(store.checkpoint_writes(), 0);
        assert_eq!(store.lease_holder(7), Some(other));
    }

    #[tokio::test]
    async fn lease_released_by_another_holder_blocks_checkpoint_write() {
        let store = Arc::new(MemoryStore::new());
        let analyzer = Arc::new(TakeoverAnalyzer {
            store: store.clone(),
            other: Uuid::new_v4(),
            release_after: true,
            finding: None,
        });
        let evaluator = build_evaluator(
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
            analyzer,
            Arc::new(FixedRecommender(Ok(String::new()))),
        );
        store.add_record(Stream::Vitals, 7, Utc::now() - ChronoDuration::hours(1), json!({}));

        let err = evaluator.evaluate(7, since()).await.unwrap_err();
        assert_eq!(err.stage(), EvalStage::AdvanceCheckpoint);
        assert!(matches!(err, EvalError::LeaseLost { .. }));
        assert_eq!(store.checkpoint_writes(), 0);
        assert_eq!(store.checkpoint(7), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_analysis_hits_deadline_without_advancing() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = build_evaluator(
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(StalledAnalyzer),
            Arc::new(FixedRecommender(Ok(String::new()))),
        );
        store.add_record(Stream::Lab, 7, Utc::now() - ChronoDuration::hours(1), json!({}));

        let err = evaluator.evaluate(7, since()).await.unwrap_err();
        match err {
            EvalError::Deadline { stage, limit } => {
                assert_eq!(stage, EvalStage::Analyze);
                assert_eq!(limit, evaluator.config().llm_deadline);
            }
            other => panic!("expected deadline error, got {other:?}"),
        }
        assert_eq!(store.checkpoint(7), None);
        assert_eq!(store.lease_holder(7), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_recommendation_keeps_alert_and_advances() {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let evaluator = build_evaluator(
            store.clone(),
            blobs.clone(),
            Arc::new(QueuedAnalyzer::new(vec![Ok(Some(SODIUM))])),
            Arc::new(StalledRecommender),
        );
        let t0 = Utc::now() - ChronoDuration::hours(1);
        store.add_record(Stream::Lab, 7, t0, json!({}));

        let outcome = evaluator.evaluate(7, since()).await.unwrap();
        assert_eq!(
            outcome,
            EvaluationOutcome::Alerted {
                alert_id: 1,
                recommendation_saved: false
            }
        );
        assert_eq!(store.alerts().len(), 1);
        assert!(blobs.keys().is_empty());
        assert_eq!(store.checkpoint(7).and_then(|c| c.lab), Some(t0));
    }

    #[tokio::test]
    async fn failed_checkpoint_write_after_alert_is_retried_next_cycle() {
        let h = harness(vec![Ok(Some(SODIUM)), Ok(Some(SODIUM))]);
        let t0 = Utc::now() - ChronoDuration::hours(1);
        h.store.add_record(Stream::Lab, 7, t0, json!({}));
        h.store.fail_checkpoint_writes(true);

        let err = h.evaluator.evaluate(7, since()).await.unwrap_err();
        assert_eq!(err.stage(), EvalStage::AdvanceCheckpoint);
        assert!(matches!(err, EvalError::Store { .. }));
        assert_eq!(h.store.alerts().len(), 1);
        assert_eq!(h.store.checkpoint(7), None);
        assert_eq!(h.store.lease_holder(7), None);

        let latest = StreamTimestamps {
            lab: Some(t0),
            ..Default::default()
        };
        assert!(checkpoint::is_dirty(&latest, h.store.checkpoint(7).as_ref()));

        h.store.fail_checkpoint_writes(false);
        let retry = h.evaluator.evaluate(7, since()).await.unwrap();
        assert_eq!(h.analyzer.call_count(), 2);
        assert_eq!(
            retry,
            EvaluationOutcome::DuplicateSuppressed {
                existing_alert_id: 1
            }
        );
        assert_eq!(h.store.alerts().len(), 1);
        assert_eq!(h.store.checkpoint(7).and_then(|c| c.lab), Some(t0));
    }
}
