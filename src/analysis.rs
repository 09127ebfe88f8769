use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AnalysisError;
use crate::llm::LlmClient;
use crate::models::{Finding, PatientId, Stream, StreamCounts, StreamRecords};

pub const NO_ALERT_SENTINEL: &str = "NO_ALERT";
pub const LABEL_MARKER: &str = "ALERT:";
pub const DETAIL_MARKER: &str = "DETAIL:";

const ANALYSIS_MAX_TOKENS: u32 = 1000;

const ANALYSIS_SYSTEM_PROMPT: &str = "\
You are an expert physician specialising in geriatric care and clinical diagnostics. \
Evaluate every parameter in the data provided and flag any value outside its normal range, \
even by a single unit.

Normal ranges:
- Blood pressure 90/60 to 120/80 mmHg
- Heart rate 60-100 bpm
- Temperature 97-99 F
- SpO2 above 95%
- BMI 18.5-24.9
- Sodium 135-145 mEq/L
- Potassium 3.5-5.0 mEq/L
- BUN 7-20 mg/dL
- Creatinine 0.6-1.2 mg/dL
- Glucose 70-140 mg/dL

If you find any abnormality, respond with exactly two lines:
ALERT: <every abnormal finding with its value>
DETAIL: <explanation of every abnormality>

If nothing is abnormal, respond with:
NO_ALERT";

/// What the evaluator hands to analysis for one patient.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub patient_id: PatientId,
    pub window_days: i64,
    /// Record counts inside the whole window, before sampling.
    pub totals: StreamCounts,
    /// Most recent records of each stream.
    pub sample: StreamRecords,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// `Ok(None)` means no abnormality; transport failures are errors, never
    /// "no finding".
    async fn analyze(&self, input: &AnalysisInput) -> Result<Option<Finding>, AnalysisError>;
}

pub fn render_summary(input: &AnalysisInput) -> Result<String, AnalysisError> {
    let mut output = String::new();
    let _ = writeln!(output, "PATIENT ID: {}", input.patient_id);
    let _ = writeln!(output, "DATA PERIOD: Last {} days", input.window_days);

    for stream in Stream::ALL {
        let heading = match stream {
            Stream::Vitals => "VITAL SIGNS",
            Stream::Lab => "LABORATORY RESULTS",
            Stream::Medication => "MEDICATIONS",
        };
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "{} ({} records):",
            heading,
            input.totals.get(stream)
        );
        let _ = writeln!(
            output,
            "{}",
            serde_json::to_string(input.sample.get(stream))?
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "Analyze this data and identify any abnormalities or concerning patterns."
    );
    Ok(output)
}

/// Reads an analysis response. Anything that is not a complete
/// `ALERT:`/`DETAIL:` pair is treated as no finding.
pub fn parse_response(text: &str) -> Option<Finding> {
    if text.contains(NO_ALERT_SENTINEL) || !text.contains(LABEL_MARKER) {
        return None;
    }

    let mut label = String::new();
    let mut detail = String::new();
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix(LABEL_MARKER) {
            label = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix(DETAIL_MARKER) {
            detail = rest.trim().to_string();
        }
    }

    if label.is_empty() || detail.is_empty() {
        return None;
    }
    Some(Finding { label, detail })
}

pub struct LlmAnalyzer {
    client: Arc<dyn LlmClient>,
}

impl LlmAnalyzer {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(&self, input: &AnalysisInput) -> Result<Option<Finding>, AnalysisError> {
        let prompt = render_summary(input)?;
        let response = self
            .client
            .generate(ANALYSIS_SYSTEM_PROMPT, &prompt, ANALYSIS_MAX_TOKENS)
            .await?;
        let finding = parse_response(&response);
        if finding.is_none() && !response.contains(NO_ALERT_SENTINEL) {
            tracing::debug!(
                target: "care_monitor::analysis",
                patient_id = input.patient_id,
                "response carried no complete finding; treating as no abnormality"
            );
        }
        Ok(finding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::models::ClinicalRecord;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn input() -> AnalysisInput {
        let mut sample = StreamRecords::default();
        sample.set(
            Stream::Lab,
            vec![ClinicalRecord {
                id: Uuid::new_v4(),
                stream: Stream::Lab,
                patient_id: 42,
                recorded_at: Utc::now(),
                payload: json!({"sodium": 148}),
            }],
        );
        AnalysisInput {
            patient_id: 42,
            window_days: 30,
            totals: StreamCounts {
                vitals: 0,
                labs: 12,
                medications: 0,
            },
            sample,
        }
    }

    #[test]
    fn parses_label_and_detail() {
        let text = "Findings below.\nALERT: High Sodium (148 mEq/L)\nDETAIL: Sodium above 145.\n";
        assert_eq!(
            parse_response(text),
            Some(Finding {
                label: "High Sodium (148 mEq/L)".to_string(),
                detail: "Sodium above 145.".to_string(),
            })
        );
    }

    #[test]
    fn sentinel_means_no_finding() {
        assert_eq!(parse_response("NO_ALERT"), None);
        assert_eq!(
            parse_response("ALERT: something\nDETAIL: x\nactually NO_ALERT"),
            None
        );
    }

    #[test]
    fn incomplete_or_malformed_responses_are_no_finding() {
        assert_eq!(parse_response("ALERT: High Sodium"), None);
        assert_eq!(parse_response("DETAIL: only detail"), None);
        assert_eq!(parse_response("I could not read the data."), None);
        assert_eq!(parse_response("ALERT:   \nDETAIL: blank label"), None);
    }

    #[test]
    fn summary_reports_totals_and_sample() {
        let summary = render_summary(&input()).unwrap();
        assert!(summary.contains("PATIENT ID: 42"));
        assert!(summary.contains("DATA PERIOD: Last 30 days"));
        assert!(summary.contains("LABORATORY RESULTS (12 records):"));
        assert!(summary.contains("\"sodium\":148"));
        assert!(summary.contains("VITAL SIGNS (0 records):\n[]"));
    }

    #[tokio::test]
    async fn llm_analyzer_returns_parsed_finding() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            "ALERT: High Sodium (148 mEq/L)\nDETAIL: Hypernatremia.",
        )]));
        let analyzer = LlmAnalyzer::new(llm.clone());
        let finding = analyzer.analyze(&input()).await.unwrap();
        assert_eq!(finding.unwrap().label, "High Sodium (148 mEq/L)");
        assert!(llm.prompts.lock().unwrap()[0].contains("PATIENT ID: 42"));
    }

    #[tokio::test]
    async fn llm_failure_is_an_error_not_a_clean_result() {
        let analyzer = LlmAnalyzer::new(Arc::new(ScriptedLlm::new(vec![Err("boom")])));
        assert!(analyzer.analyze(&input()).await.is_err());
    }
}
