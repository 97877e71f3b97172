//! Partitioning of a [`RecordSet`] into [`Group`]s by a key column.
//!
//! Groups come out in first-seen order of their key so that dispatch order is
//! reproducible across runs on the same input. Summed columns are computed per
//! group; unparseable cells count as zero.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GroupMailError;
use crate::records::{Record, RecordSet};

/// Per-group totals carried through to the dispatch job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupAggregates {
    pub row_count: usize,
    pub sums: BTreeMap<String, f64>,
}

/// Records sharing one group key value. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: String,
    pub records: Vec<Record>,
    pub aggregates: GroupAggregates,
}

/// Output of [`GroupAggregator::aggregate`].
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub groups: Vec<Group>,
    /// Rows whose key cell was blank. Kept so nothing is dropped silently.
    pub unkeyed: Vec<Record>,
}

/// Groups records by `key_column` and sums `sum_columns`.
#[derive(Debug, Clone)]
pub struct GroupAggregator {
    key_column: String,
    sum_columns: Vec<String>,
    total_row_suffixes: Vec<String>,
    recalculate_totals: bool,
}

impl GroupAggregator {
    pub fn new(key_column: impl Into<String>, sum_columns: Vec<String>) -> Self {
        Self {
            key_column: key_column.into(),
            sum_columns,
            total_row_suffixes: Vec::new(),
            recalculate_totals: true,
        }
    }

    /// Key suffixes that mark spreadsheet subtotal rows (e.g. `" 합계"`).
    ///
    /// A row keyed `"ACME 합계"` joins group `"ACME"`, is ordered after the
    /// group's regular rows, and is left out of the sums.
    pub fn with_total_row_suffixes(mut self, suffixes: Vec<String>) -> Self {
        self.total_row_suffixes = suffixes.into_iter().filter(|s| !s.is_empty()).collect();
        self
    }

    /// With `false`, a group that carries subtotal rows takes its sums from
    /// those rows as exported instead of adding up its regular rows.
    pub fn with_recalculated_totals(mut self, recalculate: bool) -> Self {
        self.recalculate_totals = recalculate;
        self
    }

    pub fn aggregate(&self, set: &RecordSet) -> Result<Aggregation, GroupMailError> {
        set.require_column(&self.key_column, "group key")?;
        for column in &self.sum_columns {
            set.require_column(column, "sum")?;
        }

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut buckets: Vec<(String, Vec<(Record, bool)>)> = Vec::new();
        let mut unkeyed = Vec::new();

        for record in set.records() {
            let cell = record.get(&self.key_column);
            if cell.is_blank() {
                unkeyed.push(record.clone());
                continue;
            }
            let (key, is_total) = self.base_key(&cell.to_string());
            if key.is_empty() {
                unkeyed.push(record.clone());
                continue;
            }
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                buckets.push((key, Vec::new()));
                buckets.len() - 1
            });
            buckets[slot].1.push((record.clone(), is_total));
        }

        let groups: Vec<Group> = buckets
            .into_iter()
            .map(|(key, mut rows)| {
                // Stable: regular rows keep input order, subtotal rows go last.
                rows.sort_by_key(|(_, is_total)| *is_total);
                let aggregates = self.sums_for(&rows);
                Group {
                    key,
                    records: rows.into_iter().map(|(r, _)| r).collect(),
                    aggregates,
                }
            })
            .collect();

        debug!(
            groups = groups.len(),
            unkeyed = unkeyed.len(),
            key_column = %self.key_column,
            "Aggregated records"
        );

        Ok(Aggregation { groups, unkeyed })
    }

    fn base_key(&self, raw: &str) -> (String, bool) {
        let raw = raw.trim();
        for suffix in &self.total_row_suffixes {
            if let Some(base) = raw.strip_suffix(suffix.as_str()) {
                return (base.trim().to_string(), true);
            }
        }
        (raw.to_string(), false)
    }

    fn sums_for(&self, rows: &[(Record, bool)]) -> GroupAggregates {
        let from_total_rows = !self.recalculate_totals && rows.iter().any(|(_, t)| *t);
        let sums = self
            .sum_columns
            .iter()
            .map(|column| {
                let total: f64 = rows
                    .iter()
                    .filter(|(_, is_total)| *is_total == from_total_rows)
                    .map(|(r, _)| r.get(column).as_amount())
                    .sum();
                (column.clone(), total)
            })
            .collect();
        GroupAggregates {
            row_count: rows.len(),
            sums,
        }
    }
}
