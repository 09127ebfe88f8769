use std::fmt::Write;

use crate::models::CycleSummary;

pub fn build_report(summary: &CycleSummary) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Care Monitoring Cycle Report");
    let _ = writeln!(
        output,
        "Cycle started {} (records since {})",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        summary.window_start.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if summary.interrupted {
        let _ = writeln!(output, "Cycle was interrupted by shutdown before finishing.");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Outcomes");
    let _ = writeln!(output, "- Candidates: {}", summary.candidates);
    let _ = writeln!(output, "- No new records: {}", summary.unchanged);
    let _ = writeln!(output, "- No data in window: {}", summary.no_data);
    let _ = writeln!(output, "- No abnormality: {}", summary.no_finding);
    let _ = writeln!(output, "- Duplicate suppressed: {}", summary.suppressed);
    let _ = writeln!(output, "- Alerts created: {}", summary.alerted.len());
    let _ = writeln!(output, "- Skipped (lease held): {}", summary.lease_busy);
    let _ = writeln!(output, "- Failed: {}", summary.failed.len());

    let _ = writeln!(output);
    let _ = writeln!(output, "## New Alerts");
    if summary.alerted.is_empty() {
        let _ = writeln!(output, "No alerts created in this cycle.");
    } else {
        for alert_id in summary.alerted.iter() {
            let note = if summary.missing_recommendations.contains(alert_id) {
                " (recommendation missing)"
            } else {
                ""
            };
            let _ = writeln!(output, "- Alert {}{}", alert_id, note);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Failures");
    if summary.failed.is_empty() {
        let _ = writeln!(output, "No failures in this cycle.");
    } else {
        for (patient_id, error) in summary.failed.iter() {
            let _ = writeln!(output, "- Patient {}: {}", patient_id, error);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EvaluationOutcome;
    use chrono::{TimeZone, Utc};

    #[test]
    fn report_lists_alerts_and_failures() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut summary = CycleSummary::new(started, started - chrono::Duration::days(30));
        summary.candidates = 3;
        summary.record(&EvaluationOutcome::Alerted {
            alert_id: 14,
            recommendation_saved: false,
        });
        summary.record(&EvaluationOutcome::Unchanged);
        summary.record_failure(9, "alert insert failed: timeout");

        let report = build_report(&summary);
        assert!(report.contains("Cycle started 2026-03-01 12:00:00 UTC"));
        assert!(report.contains("- Alerts created: 1"));
        assert!(report.contains("- Alert 14 (recommendation missing)"));
        assert!(report.contains("- Patient 9: alert insert failed: timeout"));
    }

    #[test]
    fn empty_cycle_reads_cleanly() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let report = build_report(&CycleSummary::new(started, started));
        assert!(report.contains("No alerts created in this cycle."));
        assert!(report.contains("No failures in this cycle."));
    }
}
