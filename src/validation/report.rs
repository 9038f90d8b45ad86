//! Validation report values.
//!
//! Immutable value objects: building a new report never edits a prior one,
//! which is what makes re-validation idempotent and reports safe to keep in
//! the orchestrator's explanation trail.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a single finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    UnresolvedAlias,
    UnknownTable,
    MissingField,
    RelationshipMismatch,
    TimeDimensionViolation,
    Unparseable,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IssueKind::UnresolvedAlias => "unresolved_alias",
            IssueKind::UnknownTable => "unknown_table",
            IssueKind::MissingField => "missing_field",
            IssueKind::RelationshipMismatch => "relationship_mismatch",
            IssueKind::TimeDimensionViolation => "time_dimension_violation",
            IssueKind::Unparseable => "unparseable",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
    /// The alias/field/table the issue is about, when attributable.
    pub location: Option<String>,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, message: impl Into<String>, location: Option<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location,
        }
    }
}

/// Outcome of one full local validation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    /// Field references confirmed against the schema, `table.field` form.
    pub valid_fields: Vec<String>,
    /// `table.field` (or bare field) references the schema cannot vouch for.
    pub missing_fields: Vec<String>,
    pub relationship_issues: Vec<ValidationIssue>,
    pub time_issues: Vec<ValidationIssue>,
    /// Parse degradation, unresolved aliases, unknown tables.
    pub structural_issues: Vec<ValidationIssue>,
    /// Non-blocking context for the fixer, e.g. nearest-column suggestions.
    pub hints: Vec<String>,
    pub all_valid: bool,
}

impl ValidationReport {
    /// Every recorded issue, in report order.
    pub fn issues(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.structural_issues
            .iter()
            .chain(self.relationship_issues.iter())
            .chain(self.time_issues.iter())
    }

    /// Human-readable issue list, suitable as fixer context.
    pub fn summary(&self) -> String {
        if self.all_valid {
            return "all checks passed".to_string();
        }
        let mut lines = Vec::new();
        for field in &self.missing_fields {
            lines.push(format!("missing_field: '{}' is not a known column", field));
        }
        for issue in self.issues() {
            lines.push(format!("{}: {}", issue.kind, issue.message));
        }
        let mut summary = lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{}. {}", i + 1, line))
            .join("\n");
        for hint in &self.hints {
            summary.push_str("\nhint: ");
            summary.push_str(hint);
        }
        summary
    }
}

/// Merges the checkers' findings into one report. Pure aggregation: issues
/// are partitioned by kind and `all_valid` is set only when every list is
/// empty.
pub struct ValidationReportBuilder;

impl ValidationReportBuilder {
    pub fn build(
        valid_fields: Vec<String>,
        missing_fields: Vec<String>,
        issues: Vec<ValidationIssue>,
        hints: Vec<String>,
    ) -> ValidationReport {
        let mut relationship_issues = Vec::new();
        let mut time_issues = Vec::new();
        let mut structural_issues = Vec::new();

        for issue in issues {
            match issue.kind {
                IssueKind::RelationshipMismatch => relationship_issues.push(issue),
                IssueKind::TimeDimensionViolation => time_issues.push(issue),
                IssueKind::UnresolvedAlias
                | IssueKind::UnknownTable
                | IssueKind::Unparseable => structural_issues.push(issue),
                // Missing fields arrive through `missing_fields`; a stray
                // issue of that kind still lands somewhere visible.
                IssueKind::MissingField => structural_issues.push(issue),
            }
        }

        let all_valid = missing_fields.is_empty()
            && relationship_issues.is_empty()
            && time_issues.is_empty()
            && structural_issues.is_empty();

        ValidationReport {
            valid_fields,
            missing_fields,
            relationship_issues,
            time_issues,
            structural_issues,
            hints,
            all_valid,
        }
    }
}
