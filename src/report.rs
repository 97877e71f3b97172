//! Operator-facing summary of a dispatch run.

use serde::{Deserialize, Serialize};

use crate::dispatch::{AttemptOutcome, DispatchJob, RunState, SkippedGroup};
use crate::progress::ProgressSnapshot;

/// A job whose final attempt did not deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub group_key: String,
    pub recipient: String,
    pub reason: String,
    pub attempts: u32,
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub state: RunState,
    pub total_jobs: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedDelivery>,
    /// Jobs never brought to a terminal attempt (run paused or aborted).
    pub pending: usize,
    pub skipped: Vec<SkippedGroup>,
}

impl DispatchReport {
    pub fn compile(
        jobs: &[DispatchJob],
        snapshot: &ProgressSnapshot,
        skipped: &[SkippedGroup],
    ) -> Self {
        let done = snapshot.next_index.min(jobs.len());
        let mut succeeded = 0;
        let mut failed = Vec::new();

        for job in &jobs[..done] {
            let Some(attempt) = snapshot.latest_attempt(&job.id) else {
                continue;
            };
            match attempt.outcome.detail() {
                None => succeeded += 1,
                Some(detail) => failed.push(FailedDelivery {
                    group_key: job.group_key.clone(),
                    recipient: job.recipient.clone(),
                    reason: detail.to_string(),
                    attempts: attempt.attempt,
                    permanent: matches!(attempt.outcome, AttemptOutcome::PermanentFailure(_)),
                }),
            }
        }

        Self {
            state: snapshot.state,
            total_jobs: jobs.len(),
            succeeded,
            failed,
            pending: jobs.len() - done,
            skipped: skipped.to_vec(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.pending == 0
    }
}
