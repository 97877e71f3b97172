//! Per-group message rendering from `{{ placeholder }}` templates.
//!
//! Available placeholders: `group_key`, `row_count`, `period` (YYYY-MM),
//! `date` (YYYY-MM-DD), `total.<column>` for every summed column, and `rows`,
//! an HTML table of the configured display columns. Referencing anything else
//! fails the group with [`RenderError::MissingVariable`].

use std::collections::HashMap;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grouping::Group;

/// Rendered message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("unknown template variable '{name}'")]
    MissingVariable { name: String },

    #[error("unclosed placeholder starting at byte {offset}")]
    UnclosedPlaceholder { offset: usize },
}

/// Renders subject and body templates against a group.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    subject: String,
    body: String,
    display_columns: Vec<String>,
    today: NaiveDate,
}

impl TemplateRenderer {
    pub fn new(
        subject: impl Into<String>,
        body: impl Into<String>,
        display_columns: Vec<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            display_columns,
            today: Local::now().date_naive(),
        }
    }

    /// Pin the date used for `period` and `date`.
    #[cfg(test)]
    pub fn with_date(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn render(&self, group: &Group) -> Result<Payload, RenderError> {
        let vars = self.variables(group);
        Ok(Payload {
            subject: fill(&self.subject, &vars)?,
            body: fill(&self.body, &vars)?,
        })
    }

    fn variables(&self, group: &Group) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("group_key".to_string(), group.key.clone());
        vars.insert(
            "row_count".to_string(),
            group.aggregates.row_count.to_string(),
        );
        vars.insert("period".to_string(), self.today.format("%Y-%m").to_string());
        vars.insert("date".to_string(), self.today.format("%Y-%m-%d").to_string());
        for (column, total) in &group.aggregates.sums {
            vars.insert(format!("total.{column}"), format_amount(*total));
        }
        vars.insert("rows".to_string(), self.rows_table(group));
        vars
    }

    fn rows_table(&self, group: &Group) -> String {
        let mut html = String::from("<table>\n<thead><tr>");
        for column in &self.display_columns {
            html.push_str(&format!("<th>{}</th>", escape_html(column)));
        }
        html.push_str("</tr></thead>\n<tbody>\n");
        for record in &group.records {
            html.push_str("<tr>");
            for column in &self.display_columns {
                let cell = record.get(column);
                let text = if group.aggregates.sums.contains_key(column) && !cell.is_blank() {
                    format_amount(cell.as_amount())
                } else {
                    cell.to_string()
                };
                html.push_str(&format!("<td>{}</td>", escape_html(&text)));
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</tbody>\n</table>");
        html
    }
}

fn fill(template: &str, vars: &HashMap<String, String>) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut consumed = 0;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(RenderError::UnclosedPlaceholder {
                offset: consumed + start,
            });
        };
        let name = after[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| RenderError::MissingVariable {
                name: name.to_string(),
            })?;
        out.push_str(value);
        let advance = start + 2 + end + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Whole-unit amount with thousands separators, e.g. `-1,234,568`.
pub fn format_amount(value: f64) -> String {
    let rounded = value.round() as i64;
    let digits = rounded.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
