use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{EvalError, EvalStage};
use crate::evaluator::Evaluator;
use crate::models::CycleSummary;
use crate::scanner;

/// Drives monitoring cycles: sleep, run one full cycle, repeat. A cycle
/// never starts before the previous one has finished.
pub struct Poller {
    evaluator: Arc<Evaluator>,
}

/// Handle to a running poller task.
pub struct PollerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Interrupts the current sleep (or stops after the patient being
    /// evaluated) and waits for the loop to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            error!(target: "care_monitor::poller", error = %err, "poller task ended abnormally");
        }
    }
}

impl Poller {
    pub fn new(evaluator: Arc<Evaluator>) -> Self {
        Self { evaluator }
    }

    /// Scans for candidates and evaluates them one at a time.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, EvalError> {
        let config = self.evaluator.config();
        let started_at = Utc::now();
        let since = scanner::window_start(started_at, config.window);

        let candidates = match tokio::time::timeout(
            config.store_deadline,
            scanner::scan_candidates(self.evaluator.store().as_ref(), since),
        )
        .await
        {
            Ok(result) => result.map_err(|source| EvalError::Store {
                stage: EvalStage::Scan,
                source,
            })?,
            Err(_) => {
                return Err(EvalError::Deadline {
                    stage: EvalStage::Scan,
                    limit: config.store_deadline,
                })
            }
        };

        let mut summary = CycleSummary::new(started_at, since);
        summary.candidates = candidates.len();
        if !candidates.is_empty() {
            info!(
                target: "care_monitor::poller",
                count = candidates.len(),
                "patients with records in window"
            );
        }

        for patient_id in candidates {
            if cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            match self.evaluator.evaluate(patient_id, since).await {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    warn!(
                        target: "care_monitor::poller",
                        patient_id,
                        stage = %err.stage(),
                        error = %err,
                        "evaluation failed; will retry next cycle"
                    );
                    summary.record_failure(patient_id, &err);
                }
            }
        }

        info!(
            target: "care_monitor::poller",
            candidates = summary.candidates,
            unchanged = summary.unchanged,
            no_finding = summary.no_finding,
            suppressed = summary.suppressed,
            alerted = summary.alerted.len(),
            failed = summary.failed.len(),
            "cycle complete"
        );
        Ok(summary)
    }

    /// Spawns the loop. Each cycle runs in its own task so a panic is
    /// contained and logged like any other cycle failure.
    pub fn start(self: Arc<Self>) -> PollerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let interval = self.evaluator.config().poll_interval;
            info!(
                target: "care_monitor::poller",
                interval_secs = interval.as_secs(),
                "monitoring started"
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let poller = Arc::clone(&self);
                let cycle_token = token.clone();
                let cycle =
                    tokio::spawn(async move { poller.run_cycle(&cycle_token).await }).await;
                match cycle {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        error!(
                            target: "care_monitor::poller",
                            error = ?err,
                            "monitoring cycle failed"
                        );
                    }
                    Err(err) => {
                        error!(
                            target: "care_monitor::poller",
                            error = %err,
                            "monitoring cycle panicked"
                        );
                    }
                }
            }
            info!(target: "care_monitor::poller", "monitoring stopped");
        });
        PollerHandle { cancel, join }
    }
}
