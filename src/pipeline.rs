//! Turns a loaded record file into a dispatch plan using the configured
//! columns, policy and templates, and builds the configured transport.

use tracing::info;

use crate::config::{EmailLookupConfig, GroupMailConfig, TransportKind, TransportSection};
use crate::dispatch::{JobPlan, build_jobs};
use crate::error::GroupMailError;
use crate::grouping::{Group, GroupAggregator};
use crate::records::{Record, RecordSet};
use crate::render::TemplateRenderer;
use crate::resolver::{ConflictResolver, ResolutionOutcome};
use crate::transport::{AnyTransport, OutboxTransport, RelayTransport};

/// Everything `plan` shows and `run` dispatches.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub groups: Vec<Group>,
    pub unkeyed: Vec<Record>,
    /// `resolutions[i]` belongs to `groups[i]`.
    pub resolutions: Vec<ResolutionOutcome>,
    pub plan: JobPlan,
}

pub fn prepare(config: &GroupMailConfig, set: &RecordSet) -> Result<Prepared, GroupMailError> {
    let columns = &config.columns;
    let joined = match &columns.email_lookup {
        Some(lookup) => Some(join_email_lookup(set, lookup, &columns.email)?),
        None => None,
    };
    let set = joined.as_ref().unwrap_or(set);

    let aggregation = GroupAggregator::new(&columns.group_key, columns.sum.clone())
        .with_total_row_suffixes(columns.total_row_suffixes.clone())
        .with_recalculated_totals(columns.recalculate_totals)
        .aggregate(set)?;
    let resolver = ConflictResolver::new(set, &columns.email, config.policy)?;

    let resolutions: Vec<ResolutionOutcome> = aggregation
        .groups
        .iter()
        .map(|g| resolver.resolve(g))
        .collect();

    let renderer = TemplateRenderer::new(
        &config.template.subject,
        &config.template.body,
        columns.display.clone(),
    );
    let plan = build_jobs(&aggregation.groups, &resolutions, |g| renderer.render(g));

    info!(
        records = set.len(),
        groups = aggregation.groups.len(),
        jobs = plan.jobs.len(),
        skipped = plan.skipped.len(),
        unkeyed = aggregation.unkeyed.len(),
        policy = %config.policy,
        "Plan prepared"
    );

    Ok(Prepared {
        groups: aggregation.groups,
        unkeyed: aggregation.unkeyed,
        resolutions,
        plan,
    })
}

fn join_email_lookup(
    set: &RecordSet,
    lookup: &EmailLookupConfig,
    email_column: &str,
) -> Result<RecordSet, GroupMailError> {
    let table = RecordSet::load_json(&lookup.file).map_err(|e| {
        GroupMailError::config(format!(
            "cannot load email lookup {}: {e}",
            lookup.file.display()
        ))
    })?;
    let joined = set.join_lookup_column(
        &lookup.data_key,
        &table,
        &lookup.lookup_key,
        &lookup.email,
        email_column,
    )?;
    info!(
        file = %lookup.file.display(),
        lookup_rows = table.len(),
        "Email lookup joined"
    );
    Ok(joined)
}

pub fn build_transport(section: &TransportSection) -> Result<AnyTransport, GroupMailError> {
    match section.kind {
        TransportKind::Relay => {
            if section.endpoint.is_empty() {
                return Err(GroupMailError::config(
                    "transport.endpoint is required for the relay transport",
                ));
            }
            if section.api_token.is_empty() {
                return Err(GroupMailError::config(
                    "relay token missing: set GROUPMAIL_RELAY_TOKEN or transport.api_token",
                ));
            }
            if section.sender.is_empty() {
                return Err(GroupMailError::config(
                    "transport.sender is required for the relay transport",
                ));
            }
            let relay = RelayTransport::new(
                section.endpoint.clone(),
                section.api_token.clone(),
                section.sender.clone(),
            )
            .map_err(|e| GroupMailError::config(format!("cannot build relay client: {e}")))?;
            info!(endpoint = %section.endpoint, sender = relay.sender(), "Using relay transport");
            Ok(AnyTransport::Relay(relay))
        }
        TransportKind::Outbox => {
            let outbox = OutboxTransport::new(&section.outbox_dir, section.sender.clone());
            info!(dir = %outbox.dir().display(), "Using outbox transport");
            Ok(AnyTransport::Outbox(outbox))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Value;
    use crate::resolver::{ResolutionPolicy, SkipReason};

    fn row(key: &str, email: &str, amount: f64) -> Record {
        Record::new([
            ("company", Value::Text(key.into())),
            ("email", Value::Text(email.into())),
            ("amount", Value::Number(amount)),
        ])
    }

    fn config() -> GroupMailConfig {
        let mut config = GroupMailConfig::default();
        config.columns.group_key = "company".into();
        config.columns.sum = vec!["amount".into()];
        config.template.subject = "Statement {{ group_key }}: {{ total.amount }}".into();
        config.template.body = "{{ row_count }} rows".into();
        config
    }

    #[test]
    fn prepares_jobs_in_group_order() {
        let set = RecordSet::from_records(vec![
            row("Beta", "ap@beta.com", 1500.0),
            row("Alpha", "ops@alpha.com", 10.0),
            row("Beta", "ap@beta.com", 500.0),
            row("Gamma", "", 1.0),
        ]);

        let prepared = prepare(&config(), &set).unwrap();

        assert_eq!(prepared.groups.len(), 3);
        let keys: Vec<&str> = prepared.plan.jobs.iter().map(|j| j.group_key.as_str()).collect();
        assert_eq!(keys, vec!["Beta", "Alpha"]);
        assert_eq!(prepared.plan.jobs[0].payload.subject, "Statement Beta: 2,000");
        assert_eq!(prepared.plan.jobs[0].payload.body, "2 rows");
        assert_eq!(prepared.plan.skipped.len(), 1);
        assert_eq!(prepared.plan.skipped[0].group_key, "Gamma");
        assert_eq!(prepared.plan.skipped[0].reason, SkipReason::NoRecipient);
    }

    #[test]
    fn skip_on_conflict_leaves_group_out() {
        let set = RecordSet::from_records(vec![
            row("Alpha", "a@alpha.com", 1.0),
            row("Alpha", "b@alpha.com", 1.0),
        ]);
        let mut config = config();
        config.policy = ResolutionPolicy::SkipOnConflict;

        let prepared = prepare(&config, &set).unwrap();

        assert!(prepared.plan.jobs.is_empty());
        assert!(matches!(
            prepared.plan.skipped[0].reason,
            SkipReason::ConflictingRecipients { .. }
        ));
    }

    #[test]
    fn missing_email_column_is_config_error() {
        let set = RecordSet::from_records(vec![Record::new([(
            "company",
            Value::Text("Alpha".into()),
        )])]);
        let err = prepare(&config(), &set).unwrap_err();
        assert!(matches!(err, GroupMailError::Config(_)));
    }

    #[test]
    fn email_lookup_fills_recipients_before_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let lookup_path = dir.path().join("contacts.json");
        std::fs::write(
            &lookup_path,
            r#"[
                {"code": "A1 ", "address": "ops@alpha.com"},
                {"code": "B2", "address": "ap@beta.com"},
                {"code": "B2", "address": "other@beta.com"}
            ]"#,
        )
        .unwrap();

        let set = RecordSet::from_records(vec![
            Record::new([
                ("company", Value::Text("Alpha".into())),
                ("code", Value::Text("A1".into())),
                ("amount", Value::Number(10.0)),
            ]),
            Record::new([
                ("company", Value::Text("Beta".into())),
                ("code", Value::Text(" B2".into())),
                ("amount", Value::Number(5.0)),
            ]),
            Record::new([
                ("company", Value::Text("Gamma".into())),
                ("code", Value::Text("C3".into())),
                ("amount", Value::Number(1.0)),
            ]),
        ]);
        let mut config = config();
        config.columns.email_lookup = Some(EmailLookupConfig {
            file: lookup_path,
            data_key: "code".into(),
            lookup_key: "code".into(),
            email: "address".into(),
        });

        let prepared = prepare(&config, &set).unwrap();

        let recipients: Vec<(&str, &str)> = prepared
            .plan
            .jobs
            .iter()
            .map(|j| (j.group_key.as_str(), j.recipient.as_str()))
            .collect();
        assert_eq!(
            recipients,
            vec![("Alpha", "ops@alpha.com"), ("Beta", "ap@beta.com")]
        );
        assert_eq!(prepared.plan.skipped[0].group_key, "Gamma");
        assert_eq!(prepared.plan.skipped[0].reason, SkipReason::NoRecipient);
    }

    #[test]
    fn missing_lookup_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let set = RecordSet::from_records(vec![row("Alpha", "a@alpha.com", 1.0)]);
        let mut config = config();
        config.columns.email_lookup = Some(EmailLookupConfig {
            file: dir.path().join("missing.json"),
            data_key: "company".into(),
            lookup_key: "company".into(),
            email: "email".into(),
        });

        let err = prepare(&config, &set).unwrap_err();
        assert!(matches!(err, GroupMailError::Config(_)));
        assert!(err.to_string().contains("email lookup"));
    }

    #[test]
    fn relay_requires_token() {
        let section = TransportSection {
            kind: TransportKind::Relay,
            endpoint: "http://127.0.0.1:8025/send".into(),
            sender: "billing@acme.com".into(),
            ..TransportSection::default()
        };
        let Err(err) = build_transport(&section) else {
            panic!("expected config error");
        };
        assert!(err.to_string().contains("GROUPMAIL_RELAY_TOKEN"));
    }

    #[test]
    fn outbox_is_default_transport() {
        let transport = build_transport(&TransportSection::default()).unwrap();
        assert!(matches!(transport, AnyTransport::Outbox(_)));
    }
}
