use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::grouping::{Group, GroupAggregates};
use crate::render::{Payload, RenderError};
use crate::resolver::{ResolutionOutcome, SkipReason, is_plausible_email};

/// Result of one transport call, as classified by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Expected to succeed on retry (throttling, connection trouble).
    TransientFailure(String),
    /// Will not succeed on retry (bad address, rejected credentials).
    PermanentFailure(String),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "delivered"),
            AttemptOutcome::TransientFailure(msg) => write!(f, "transient failure: {msg}"),
            AttemptOutcome::PermanentFailure(msg) => write!(f, "permanent failure: {msg}"),
        }
    }
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Success => None,
            AttemptOutcome::TransientFailure(msg) | AttemptOutcome::PermanentFailure(msg) => {
                Some(msg)
            }
        }
    }
}

/// One delivery attempt for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub job_id: String,
    /// 1-based.
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

impl DispatchAttempt {
    pub fn new(job_id: impl Into<String>, attempt: u32, outcome: AttemptOutcome) -> Self {
        Self {
            job_id: job_id.into(),
            attempt,
            at: Utc::now(),
            outcome,
        }
    }

    /// Whether no further attempt will be made under `max_attempts`.
    pub fn is_terminal(&self, max_attempts: u32) -> bool {
        match self.outcome {
            AttemptOutcome::Success | AttemptOutcome::PermanentFailure(_) => true,
            AttemptOutcome::TransientFailure(_) => self.attempt >= max_attempts,
        }
    }
}

/// Immutable unit of work: one message to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: String,
    pub group_key: String,
    pub recipient: String,
    pub payload: Payload,
    pub aggregates: GroupAggregates,
}

impl DispatchJob {
    /// Stable id for a group key, identical across runs and machines.
    pub fn id_for(group_key: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, group_key.as_bytes()).to_string()
    }
}

/// A group that will not be dispatched, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedGroup {
    pub group_key: String,
    pub reason: SkipReason,
}

/// Jobs ready for dispatch plus everything that was left out.
#[derive(Debug, Clone, Default)]
pub struct JobPlan {
    pub jobs: Vec<DispatchJob>,
    pub skipped: Vec<SkippedGroup>,
}

/// Turn resolved groups into jobs, in group order.
///
/// `resolutions[i]` belongs to `groups[i]`. Groups that did not resolve, whose
/// recipient is not a plausible address, or whose payload fails to render are
/// recorded in [`JobPlan::skipped`]; none of these stop the batch.
pub fn build_jobs<F>(groups: &[Group], resolutions: &[ResolutionOutcome], render: F) -> JobPlan
where
    F: Fn(&Group) -> Result<Payload, RenderError>,
{
    let mut plan = JobPlan::default();

    for (group, resolution) in groups.iter().zip(resolutions) {
        let skip = |reason: SkipReason| SkippedGroup {
            group_key: group.key.clone(),
            reason,
        };

        let recipient = match resolution {
            ResolutionOutcome::Resolved(email) => email,
            other => {
                if let Some(reason) = other.skip_reason() {
                    debug!(group = %group.key, %reason, "Group not resolved");
                    plan.skipped.push(skip(reason));
                }
                continue;
            }
        };

        if !is_plausible_email(recipient) {
            warn!(group = %group.key, recipient = %recipient, "Recipient is not a valid address");
            plan.skipped.push(skip(SkipReason::InvalidRecipient {
                email: recipient.clone(),
            }));
            continue;
        }

        match render(group) {
            Ok(payload) => plan.jobs.push(DispatchJob {
                id: DispatchJob::id_for(&group.key),
                group_key: group.key.clone(),
                recipient: recipient.clone(),
                payload,
                aggregates: group.aggregates.clone(),
            }),
            Err(e) => {
                warn!(group = %group.key, error = %e, "Render failed");
                plan.skipped.push(skip(SkipReason::Render {
                    detail: e.to_string(),
                }));
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Record;

    fn group(key: &str) -> Group {
        Group {
            key: key.into(),
            records: vec![Record::default()],
            aggregates: GroupAggregates {
                row_count: 1,
                ..Default::default()
            },
        }
    }

    fn payload_for(group: &Group) -> Result<Payload, RenderError> {
        Ok(Payload {
            subject: format!("Statement {}", group.key),
            body: "body".into(),
        })
    }

    #[test]
    fn job_ids_are_deterministic() {
        assert_eq!(DispatchJob::id_for("ACME"), DispatchJob::id_for("ACME"));
        assert_ne!(DispatchJob::id_for("ACME"), DispatchJob::id_for("ACME2"));
    }

    #[test]
    fn builds_only_resolved_groups() {
        let groups = vec![group("A"), group("B"), group("C")];
        let resolutions = vec![
            ResolutionOutcome::Resolved("a@x.com".into()),
            ResolutionOutcome::Skipped(SkipReason::NoRecipient),
            ResolutionOutcome::Resolved("c@x.com".into()),
        ];
        let plan = build_jobs(&groups, &resolutions, payload_for);
        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.jobs[0].group_key, "A");
        assert_eq!(plan.jobs[0].id, DispatchJob::id_for("A"));
        assert_eq!(plan.jobs[1].recipient, "c@x.com");
        assert_eq!(plan.jobs[1].payload.subject, "Statement C");
        assert_eq!(
            plan.skipped,
            vec![SkippedGroup {
                group_key: "B".into(),
                reason: SkipReason::NoRecipient
            }]
        );
    }

    #[test]
    fn render_failure_skips_only_that_group() {
        let groups = vec![group("A"), group("B")];
        let resolutions = vec![
            ResolutionOutcome::Resolved("a@x.com".into()),
            ResolutionOutcome::Resolved("b@x.com".into()),
        ];
        let plan = build_jobs(&groups, &resolutions, |g| {
            if g.key == "A" {
                Err(RenderError::MissingVariable {
                    name: "manager".into(),
                })
            } else {
                payload_for(g)
            }
        });
        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(plan.jobs[0].group_key, "B");
        assert_eq!(plan.skipped[0].group_key, "A");
        assert_eq!(
            plan.skipped[0].reason.to_string(),
            "render failed: unknown template variable 'manager'"
        );
    }

    #[test]
    fn ambiguous_and_invalid_recipients_are_skipped() {
        let groups = vec![group("A"), group("B")];
        let resolutions = vec![
            ResolutionOutcome::Ambiguous(vec![]),
            ResolutionOutcome::Resolved("not-an-address".into()),
        ];
        let plan = build_jobs(&groups, &resolutions, payload_for);
        assert!(plan.jobs.is_empty());
        assert!(matches!(
            plan.skipped[0].reason,
            SkipReason::ConflictingRecipients { .. }
        ));
        assert_eq!(
            plan.skipped[1].reason,
            SkipReason::InvalidRecipient {
                email: "not-an-address".into()
            }
        );
    }

    #[test]
    fn attempt_terminality() {
        let ok = DispatchAttempt::new("j", 1, AttemptOutcome::Success);
        assert!(ok.is_terminal(3));
        let perm = DispatchAttempt::new("j", 1, AttemptOutcome::PermanentFailure("bad".into()));
        assert!(perm.is_terminal(3));
        let transient = DispatchAttempt::new("j", 2, AttemptOutcome::TransientFailure("busy".into()));
        assert!(!transient.is_terminal(3));
        assert!(transient.is_terminal(2));
    }

    #[test]
    fn attempt_outcome_serializes_with_detail() {
        let json = serde_json::to_string(&AttemptOutcome::TransientFailure("429".into())).unwrap();
        assert_eq!(json, r#"{"status":"transient_failure","detail":"429"}"#);
        let json = serde_json::to_string(&AttemptOutcome::Success).unwrap();
        assert_eq!(json, r#"{"status":"success"}"#);
    }
}
