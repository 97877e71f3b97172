//! Picks one recipient per group.
//!
//! Candidates are the distinct trimmed, lower-cased values of the email column
//! across a group's records. One candidate resolves unconditionally; several
//! are settled by the [`ResolutionPolicy`]. Resolution is a pure function of
//! the group and the policy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GroupMailError;
use crate::grouping::Group;
use crate::records::RecordSet;

/// How to choose between conflicting recipient values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Value from the first record (in input order) that has one.
    #[default]
    FirstSeen,
    /// Highest occurrence count; ties go to the earliest seen.
    MostFrequent,
    /// Leave the group unsent for operator review.
    SkipOnConflict,
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionPolicy::FirstSeen => write!(f, "first_seen"),
            ResolutionPolicy::MostFrequent => write!(f, "most_frequent"),
            ResolutionPolicy::SkipOnConflict => write!(f, "skip_on_conflict"),
        }
    }
}

/// A distinct recipient value seen in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientCandidate {
    pub email: String,
    pub occurrences: usize,
    /// Index of the first record in the group carrying this value.
    pub first_seen: usize,
}

/// Why a group was left out of dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    NoRecipient,
    ConflictingRecipients { candidates: Vec<RecipientCandidate> },
    InvalidRecipient { email: String },
    Render { detail: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoRecipient => write!(f, "no recipient"),
            SkipReason::ConflictingRecipients { candidates } => {
                let emails: Vec<&str> = candidates.iter().map(|c| c.email.as_str()).collect();
                write!(f, "conflicting recipients ({})", emails.join(", "))
            }
            SkipReason::InvalidRecipient { email } => write!(f, "invalid recipient '{email}'"),
            SkipReason::Render { detail } => write!(f, "render failed: {detail}"),
        }
    }
}

/// The single outcome a group maps to under a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Resolved(String),
    /// Several candidates under [`ResolutionPolicy::SkipOnConflict`]; the
    /// group is skipped with the full candidate set kept for review.
    Ambiguous(Vec<RecipientCandidate>),
    Skipped(SkipReason),
}

impl ResolutionOutcome {
    /// Skip reason for any outcome that is not `Resolved`.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            ResolutionOutcome::Resolved(_) => None,
            ResolutionOutcome::Ambiguous(candidates) => Some(SkipReason::ConflictingRecipients {
                candidates: candidates.clone(),
            }),
            ResolutionOutcome::Skipped(reason) => Some(reason.clone()),
        }
    }
}

/// Resolves groups against a declared email column.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    email_column: String,
    policy: ResolutionPolicy,
}

impl ConflictResolver {
    /// The email column must exist in the record schema.
    pub fn new(
        set: &RecordSet,
        email_column: impl Into<String>,
        policy: ResolutionPolicy,
    ) -> Result<Self, GroupMailError> {
        let email_column = email_column.into();
        set.require_column(&email_column, "email")?;
        Ok(Self {
            email_column,
            policy,
        })
    }

    pub fn resolve(&self, group: &Group) -> ResolutionOutcome {
        resolve(group, &self.email_column, self.policy)
    }
}

/// Distinct normalized recipient values in first-seen order.
pub fn candidates(group: &Group, email_column: &str) -> Vec<RecipientCandidate> {
    let mut found: Vec<RecipientCandidate> = Vec::new();
    for (position, record) in group.records.iter().enumerate() {
        let cell = record.get(email_column);
        if cell.is_blank() {
            continue;
        }
        let email = cell.to_string().trim().to_lowercase();
        if email.is_empty() {
            continue;
        }
        match found.iter_mut().find(|c| c.email == email) {
            Some(existing) => existing.occurrences += 1,
            None => found.push(RecipientCandidate {
                email,
                occurrences: 1,
                first_seen: position,
            }),
        }
    }
    found
}

pub fn resolve(group: &Group, email_column: &str, policy: ResolutionPolicy) -> ResolutionOutcome {
    let mut found = candidates(group, email_column);
    match found.len() {
        0 => ResolutionOutcome::Skipped(SkipReason::NoRecipient),
        1 => ResolutionOutcome::Resolved(found.remove(0).email),
        _ => match policy {
            // `found` is already in first-seen order.
            ResolutionPolicy::FirstSeen => ResolutionOutcome::Resolved(found.remove(0).email),
            ResolutionPolicy::MostFrequent => {
                let best = found
                    .iter()
                    .enumerate()
                    .max_by(|(ia, a), (ib, b)| {
                        a.occurrences.cmp(&b.occurrences).then(ib.cmp(ia))
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                ResolutionOutcome::Resolved(found.remove(best).email)
            }
            ResolutionPolicy::SkipOnConflict => ResolutionOutcome::Ambiguous(found),
        },
    }
}

/// Loose `local@domain.tld` shape check; delivery is the transport's problem.
pub fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty()
        && !host.starts_with('.')
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::GroupAggregates;
    use crate::records::{Record, Value};

    fn group(emails: &[Option<&str>]) -> Group {
        let records = emails
            .iter()
            .map(|e| {
                Record::new([
                    ("code", Value::Text("G".into())),
                    (
                        "email",
                        e.map(|s| Value::Text(s.into())).unwrap_or(Value::Null),
                    ),
                ])
            })
            .collect::<Vec<_>>();
        Group {
            key: "G".into(),
            aggregates: GroupAggregates {
                row_count: records.len(),
                ..Default::default()
            },
            records,
        }
    }

    #[test]
    fn no_values_is_skipped() {
        let g = group(&[None, Some("  "), Some("nan")]);
        for policy in [
            ResolutionPolicy::FirstSeen,
            ResolutionPolicy::MostFrequent,
            ResolutionPolicy::SkipOnConflict,
        ] {
            assert_eq!(
                resolve(&g, "email", policy),
                ResolutionOutcome::Skipped(SkipReason::NoRecipient)
            );
        }
    }

    #[test]
    fn single_value_resolves_under_every_policy() {
        let g = group(&[Some(" Ops@Acme.com "), None, Some("ops@acme.com")]);
        for policy in [
            ResolutionPolicy::FirstSeen,
            ResolutionPolicy::MostFrequent,
            ResolutionPolicy::SkipOnConflict,
        ] {
            assert_eq!(
                resolve(&g, "email", policy),
                ResolutionOutcome::Resolved("ops@acme.com".into())
            );
        }
    }

    #[test]
    fn first_seen_takes_earliest_value() {
        let g = group(&[None, Some("b@x.com"), Some("a@x.com"), Some("a@x.com")]);
        assert_eq!(
            resolve(&g, "email", ResolutionPolicy::FirstSeen),
            ResolutionOutcome::Resolved("b@x.com".into())
        );
    }

    #[test]
    fn most_frequent_takes_majority() {
        let g = group(&[Some("b@x.com"), Some("a@x.com"), Some("a@x.com")]);
        assert_eq!(
            resolve(&g, "email", ResolutionPolicy::MostFrequent),
            ResolutionOutcome::Resolved("a@x.com".into())
        );
    }

    #[test]
    fn most_frequent_ties_go_to_first_seen() {
        let g = group(&[
            Some("c@x.com"),
            Some("b@x.com"),
            Some("b@x.com"),
            Some("c@x.com"),
            Some("a@x.com"),
        ]);
        assert_eq!(
            resolve(&g, "email", ResolutionPolicy::MostFrequent),
            ResolutionOutcome::Resolved("c@x.com".into())
        );
    }

    #[test]
    fn skip_on_conflict_keeps_candidates() {
        let g = group(&[Some("a@x.com"), Some("b@x.com"), Some("a@x.com")]);
        let outcome = resolve(&g, "email", ResolutionPolicy::SkipOnConflict);
        let ResolutionOutcome::Ambiguous(candidates) = &outcome else {
            panic!("expected Ambiguous, got {outcome:?}");
        };
        assert_eq!(
            candidates,
            &vec![
                RecipientCandidate {
                    email: "a@x.com".into(),
                    occurrences: 2,
                    first_seen: 0
                },
                RecipientCandidate {
                    email: "b@x.com".into(),
                    occurrences: 1,
                    first_seen: 1
                },
            ]
        );
        let reason = outcome.skip_reason().unwrap();
        assert!(reason.to_string().starts_with("conflicting recipients"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let g = group(&[Some("x@a.io"), Some("y@a.io"), Some("y@a.io"), Some("x@a.io")]);
        for policy in [
            ResolutionPolicy::FirstSeen,
            ResolutionPolicy::MostFrequent,
            ResolutionPolicy::SkipOnConflict,
        ] {
            let first = resolve(&g, "email", policy);
            for _ in 0..10 {
                assert_eq!(resolve(&g, "email", policy), first);
            }
        }
    }

    #[test]
    fn resolver_requires_email_column() {
        let set = RecordSet::from_records(vec![Record::new([("code", Value::Null)])]);
        let err = ConflictResolver::new(&set, "email", ResolutionPolicy::FirstSeen).unwrap_err();
        assert!(matches!(err, GroupMailError::Config(_)));
    }

    #[test]
    fn plausible_email_shapes() {
        assert!(is_plausible_email("ops@acme.co.kr"));
        assert!(is_plausible_email("first.last+tag@example.com"));
        assert!(!is_plausible_email("no-at-sign.com"));
        assert!(!is_plausible_email("@example.com"));
        assert!(!is_plausible_email("a@b"));
        assert!(!is_plausible_email("a@b.c"));
        assert!(!is_plausible_email("a b@example.com"));
        assert!(!is_plausible_email("a@@example.com"));
    }

    #[test]
    fn policy_parses_from_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: ResolutionPolicy,
        }
        let w: Wrapper = toml::from_str(r#"policy = "most_frequent""#).unwrap();
        assert_eq!(w.policy, ResolutionPolicy::MostFrequent);
    }
}
