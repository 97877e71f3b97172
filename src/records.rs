//! Normalized tabular input: a [`RecordSet`] of [`Record`]s whose cells are
//! typed [`Value`]s.
//!
//! Records are immutable once loaded. The CLI reads them from a JSON file
//! holding an array of flat objects; other front ends can build a set with
//! [`RecordSet::from_records`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::GroupMailError;

/// A single scalar cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl Value {
    /// True for null, empty/whitespace text and the placeholder strings
    /// spreadsheet exports leave behind for missing cells.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => {
                let t = s.trim();
                t.is_empty() || t.eq_ignore_ascii_case("nan") || t.eq_ignore_ascii_case("none")
            }
            Value::Number(n) => n.is_nan(),
            Value::Date(_) => false,
        }
    }

    /// Numeric reading used for summing. Text is accepted after stripping
    /// thousands separators, currency symbols and whitespace; anything else
    /// counts as zero.
    pub fn as_amount(&self) -> f64 {
        match self {
            Value::Number(n) if n.is_finite() => *n,
            Value::Text(s) => {
                let cleaned: String = s
                    .chars()
                    .filter(|c| !matches!(c, ',' | '₩' | '$') && !c.is_whitespace())
                    .collect();
                cleaned
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .unwrap_or(0.0)
            }
            _ => 0.0,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "-"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Text(s) => write!(f, "{}", s.trim()),
        }
    }
}

/// One input row: column name → value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    cells: BTreeMap<String, Value>,
}

static NULL: Value = Value::Null;

impl Record {
    #[cfg(test)]
    pub fn new<K: Into<String>>(cells: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self {
            cells: cells.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Cell value, or `Null` when the column is absent from this row.
    pub fn get(&self, column: &str) -> &Value {
        self.cells.get(column).unwrap_or(&NULL)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }
}

/// Ordered collection of records plus the union of their column names.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    columns: Vec<String>,
    records: Vec<Record>,
}

impl RecordSet {
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for column in record.columns() {
                if !columns.iter().any(|c| c == column) {
                    columns.push(column.to_string());
                }
            }
        }
        Self { columns, records }
    }

    /// Load a JSON array of flat objects.
    pub fn load_json(path: &Path) -> Result<Self, GroupMailError> {
        let contents = std::fs::read_to_string(path)?;
        let records: Vec<Record> = serde_json::from_str(&contents)?;
        Ok(Self::from_records(records))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Left join filling `target_column` from a separate `lookup` table.
    ///
    /// Keys match as trimmed text and the first lookup row per key wins. A
    /// row without a match, or matched to a blank value, keeps its own
    /// `target_column` cell.
    pub fn join_lookup_column(
        &self,
        data_key: &str,
        lookup: &RecordSet,
        lookup_key: &str,
        lookup_column: &str,
        target_column: &str,
    ) -> Result<RecordSet, GroupMailError> {
        self.require_column(data_key, "join key")?;
        lookup.require_column(lookup_key, "lookup key")?;
        lookup.require_column(lookup_column, "lookup")?;

        let mut table: HashMap<String, &Value> = HashMap::new();
        for row in lookup.records() {
            let key = row.get(lookup_key);
            if !key.is_blank() {
                table
                    .entry(key.to_string().trim().to_string())
                    .or_insert(row.get(lookup_column));
            }
        }

        let records = self
            .records
            .iter()
            .map(|record| {
                let key = record.get(data_key);
                let found = if key.is_blank() {
                    None
                } else {
                    table.get(key.to_string().trim())
                };
                let mut joined = record.clone();
                if let Some(value) = found.filter(|v| !v.is_blank()) {
                    joined.cells.insert(target_column.to_string(), (*value).clone());
                }
                joined
            })
            .collect();

        let mut set = Self::from_records(records);
        if !set.has_column(target_column) {
            set.columns.push(target_column.to_string());
        }
        Ok(set)
    }

    /// Fails with a config error naming `role` when `column` is not in the schema.
    pub fn require_column(&self, column: &str, role: &str) -> Result<(), GroupMailError> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(GroupMailError::config(format!(
                "{role} column '{column}' not found (available: {})",
                self.columns.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_typed_cells() {
        let json = r#"[
            {"code": "A1", "amount": 1200.5, "due": "2024-03-31", "note": null}
        ]"#;
        let records: Vec<Record> = serde_json::from_str(json).unwrap();
        let r = &records[0];
        assert_eq!(r.get("code"), &Value::Text("A1".into()));
        assert_eq!(r.get("amount"), &Value::Number(1200.5));
        assert_eq!(
            r.get("due"),
            &Value::Date(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap())
        );
        assert_eq!(r.get("note"), &Value::Null);
        assert_eq!(r.get("missing"), &Value::Null);
    }

    #[test]
    fn amount_coercion_strips_formatting() {
        assert_eq!(Value::Text("1,234,000".into()).as_amount(), 1_234_000.0);
        assert_eq!(Value::Text("₩ 5,000".into()).as_amount(), 5000.0);
        assert_eq!(Value::Text("n/a".into()).as_amount(), 0.0);
        assert_eq!(Value::Null.as_amount(), 0.0);
        assert_eq!(Value::Number(f64::NAN).as_amount(), 0.0);
    }

    #[test]
    fn blank_detection() {
        assert!(Value::Null.is_blank());
        assert!(Value::Text("   ".into()).is_blank());
        assert!(Value::Text("NaN".into()).is_blank());
        assert!(!Value::Text("x".into()).is_blank());
        assert!(!Value::Number(0.0).is_blank());
    }

    #[test]
    fn columns_are_the_union_in_first_seen_order() {
        let set = RecordSet::from_records(vec![
            Record::new([("b", Value::Null), ("a", Value::Null)]),
            Record::new([("c", Value::Null)]),
        ]);
        assert_eq!(set.columns(), &["a", "b", "c"]);
        assert!(set.require_column("c", "email").is_ok());
        let err = set.require_column("d", "email").unwrap_err();
        assert!(err.to_string().contains("email column 'd' not found"));
    }

    #[test]
    fn load_json_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, r#"[{"k": "x"}, {"k": "y"}]"#).unwrap();
        let set = RecordSet::load_json(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.has_column("k"));
    }

    #[test]
    fn lookup_join_fills_column_by_trimmed_key() {
        let data = RecordSet::from_records(vec![
            Record::new([("code", Value::Number(1001.0)), ("amount", Value::Number(5.0))]),
            Record::new([("code", Value::Text("B7 ".into())), ("amount", Value::Number(1.0))]),
            Record::new([("code", Value::Text("Z9".into())), ("amount", Value::Number(2.0))]),
        ]);
        let lookup = RecordSet::from_records(vec![
            Record::new([
                ("id", Value::Text(" 1001".into())),
                ("mail", Value::Text("a@x.com".into())),
            ]),
            Record::new([
                ("id", Value::Text("1001".into())),
                ("mail", Value::Text("second@x.com".into())),
            ]),
            Record::new([
                ("id", Value::Text("B7".into())),
                ("mail", Value::Text("b@x.com".into())),
            ]),
        ]);

        let joined = data
            .join_lookup_column("code", &lookup, "id", "mail", "email")
            .unwrap();

        assert_eq!(joined.len(), 3);
        assert!(joined.has_column("email"));
        let emails: Vec<&Value> = joined.records().iter().map(|r| r.get("email")).collect();
        assert_eq!(
            emails,
            vec![
                &Value::Text("a@x.com".into()),
                &Value::Text("b@x.com".into()),
                &Value::Null,
            ]
        );
        assert_eq!(joined.records()[0].get("amount"), &Value::Number(5.0));
    }

    #[test]
    fn lookup_join_keeps_own_value_without_match() {
        let data = RecordSet::from_records(vec![Record::new([
            ("code", Value::Text("A".into())),
            ("email", Value::Text("own@x.com".into())),
        ])]);
        let lookup = RecordSet::from_records(vec![Record::new([
            ("id", Value::Text("A".into())),
            ("mail", Value::Null),
        ])]);
        let joined = data
            .join_lookup_column("code", &lookup, "id", "mail", "email")
            .unwrap();
        assert_eq!(joined.records()[0].get("email"), &Value::Text("own@x.com".into()));

        let err = data
            .join_lookup_column("code", &lookup, "id", "address", "email")
            .unwrap_err();
        assert!(err.to_string().contains("lookup column 'address' not found"));
    }

    #[test]
    fn display_formats_whole_numbers_without_fraction() {
        assert_eq!(Value::Number(42.0).to_string(), "42");
        assert_eq!(Value::Number(1.5).to_string(), "1.5");
        assert_eq!(Value::Null.to_string(), "-");
    }
}
