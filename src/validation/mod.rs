//! Field and relationship validation.
//!
//! Resolves the parser's aliases against the knowledge base, checks that
//! every referenced field exists, and checks that every JOIN follows a
//! declared relationship. Semantic problems never become errors here; they
//! are recorded as issues and merged into one `ValidationReport`.

pub mod report;
pub mod synonyms;

pub use report::{IssueKind, ValidationIssue, ValidationReport, ValidationReportBuilder};
pub use synonyms::BusinessSynonyms;

use crate::knowledge::{normalize_identifier, SchemaKnowledgeBase, TableSchema};
use crate::parser::{FieldRef, ParsedStatement, SqlStructureParser};
use crate::time_guard::TimeDimensionGuard;
use std::collections::HashSet;
use strsim::jaro_winkler;
use tracing::debug;

/// Similarity floor for "did you mean" column suggestions.
const SUGGESTION_THRESHOLD: f64 = 0.86;

/// Findings of the field/relationship pass, before report assembly.
#[derive(Debug, Clone, Default)]
pub struct FieldValidationOutcome {
    pub valid_fields: Vec<String>,
    pub missing_fields: Vec<String>,
    pub issues: Vec<ValidationIssue>,
    pub hints: Vec<String>,
}

/// Checks field existence and JOIN legitimacy. Pure function of its inputs;
/// holds only the configured synonym allow-list.
#[derive(Debug, Clone, Default)]
pub struct FieldRelationshipValidator {
    synonyms: BusinessSynonyms,
}

impl FieldRelationshipValidator {
    pub fn new(synonyms: BusinessSynonyms) -> Self {
        Self { synonyms }
    }

    pub fn validate(
        &self,
        stmt: &ParsedStatement,
        schema: &SchemaKnowledgeBase,
    ) -> FieldValidationOutcome {
        let mut outcome = FieldValidationOutcome::default();
        let mut reported_aliases: HashSet<String> = HashSet::new();
        let mut reported_tables: HashSet<String> = HashSet::new();
        let mut seen_refs: HashSet<FieldRef> = HashSet::new();

        for field_ref in stmt
            .select_field_refs
            .iter()
            .chain(stmt.where_field_refs.iter())
        {
            if field_ref.field == "*" || !seen_refs.insert(field_ref.clone()) {
                continue;
            }
            self.check_field_ref(
                field_ref,
                stmt,
                schema,
                &mut outcome,
                &mut reported_aliases,
                &mut reported_tables,
            );
        }

        for predicate in &stmt.join_predicates {
            self.check_join_predicate(
                predicate,
                stmt,
                schema,
                &mut outcome,
                &mut reported_aliases,
                &mut reported_tables,
            );
        }

        outcome
    }

    fn check_field_ref(
        &self,
        field_ref: &FieldRef,
        stmt: &ParsedStatement,
        schema: &SchemaKnowledgeBase,
        outcome: &mut FieldValidationOutcome,
        reported_aliases: &mut HashSet<String>,
        reported_tables: &mut HashSet<String>,
    ) {
        match &field_ref.alias {
            Some(alias) => {
                let Some(table) = stmt.alias_to_table.get(alias) else {
                    if reported_aliases.insert(alias.clone()) {
                        outcome.issues.push(ValidationIssue::new(
                            IssueKind::UnresolvedAlias,
                            format!("alias '{}' is not bound to any table", alias),
                            Some(alias.clone()),
                        ));
                    }
                    return;
                };
                if stmt.cte_tables.contains(table) {
                    // Derived tables cannot be checked against the schema.
                    return;
                }
                let Some(table_schema) = schema.lookup(table) else {
                    if reported_tables.insert(table.clone()) {
                        outcome.issues.push(ValidationIssue::new(
                            IssueKind::UnknownTable,
                            format!("table '{}' is not in the knowledge base", table),
                            Some(table.clone()),
                        ));
                    }
                    return;
                };
                self.check_column(table_schema, &field_ref.field, outcome);
            }
            None => {
                // Un-aliased reference: resolve against the sole statement
                // table when unambiguous, else fall back to the allow-list.
                if let Some(sole) = stmt.sole_table() {
                    match schema.lookup(sole) {
                        Some(table_schema) => {
                            self.check_column(table_schema, &field_ref.field, outcome)
                        }
                        None => {
                            if reported_tables.insert(sole.to_string()) {
                                outcome.issues.push(ValidationIssue::new(
                                    IssueKind::UnknownTable,
                                    format!("table '{}' is not in the knowledge base", sole),
                                    Some(sole.to_string()),
                                ));
                            }
                        }
                    }
                } else if stmt.referenced_tables().is_empty() && !stmt.alias_to_table.is_empty() {
                    // Statement only touches derived tables; nothing to check.
                } else if self.synonyms.contains(&field_ref.field) {
                    outcome.valid_fields.push(field_ref.field.clone());
                } else {
                    debug!(field = %field_ref.field, "bare field not attributable to a table");
                    outcome.missing_fields.push(field_ref.field.clone());
                }
            }
        }
    }

    fn check_column(
        &self,
        table: &TableSchema,
        field: &str,
        outcome: &mut FieldValidationOutcome,
    ) {
        let qualified = format!("{}.{}", table.name, field);
        if table.has_column(field) {
            outcome.valid_fields.push(qualified);
        } else if self.synonyms.contains(field) {
            // Recognized business vocabulary, not a literal column.
            outcome.valid_fields.push(qualified);
        } else {
            if let Some(candidate) = nearest_column(table, field) {
                outcome
                    .hints
                    .push(format!("'{}': did you mean '{}.{}'?", qualified, table.name, candidate));
            }
            outcome.missing_fields.push(qualified);
        }
    }

    fn check_join_predicate(
        &self,
        predicate: &crate::parser::JoinPredicate,
        stmt: &ParsedStatement,
        schema: &SchemaKnowledgeBase,
        outcome: &mut FieldValidationOutcome,
        reported_aliases: &mut HashSet<String>,
        reported_tables: &mut HashSet<String>,
    ) {
        let mut resolve = |alias: &str, outcome: &mut FieldValidationOutcome| -> Option<String> {
            match stmt.alias_to_table.get(alias) {
                Some(table) => Some(table.clone()),
                None => {
                    if reported_aliases.insert(alias.to_string()) {
                        outcome.issues.push(ValidationIssue::new(
                            IssueKind::UnresolvedAlias,
                            format!("alias '{}' in JOIN is not bound to any table", alias),
                            Some(alias.to_string()),
                        ));
                    }
                    None
                }
            }
        };

        let (Some(left_table), Some(right_table)) = (
            resolve(&predicate.left_alias, outcome),
            resolve(&predicate.right_alias, outcome),
        ) else {
            return;
        };
        if stmt.cte_tables.contains(&left_table) || stmt.cte_tables.contains(&right_table) {
            return;
        }

        for table in [&left_table, &right_table] {
            if schema.lookup(table).is_none() && reported_tables.insert(table.clone()) {
                outcome.issues.push(ValidationIssue::new(
                    IssueKind::UnknownTable,
                    format!("table '{}' is not in the knowledge base", table),
                    Some(table.clone()),
                ));
            }
        }
        if schema.lookup(&left_table).is_none() || schema.lookup(&right_table).is_none() {
            return;
        }

        if schema
            .relationship_between(
                &left_table,
                &predicate.left_field,
                &right_table,
                &predicate.right_field,
            )
            .is_none()
        {
            let declared = schema.relationships_linking(&left_table, &right_table);
            let mut message = format!(
                "join {}.{} = {}.{} does not follow any declared relationship",
                left_table, predicate.left_field, right_table, predicate.right_field
            );
            if let Some(rel) = declared.first() {
                message.push_str(&format!(
                    " (declared: {}.{} = {}.{})",
                    rel.table1, rel.field1, rel.table2, rel.field2
                ));
            }
            outcome.issues.push(ValidationIssue::new(
                IssueKind::RelationshipMismatch,
                message,
                Some(format!("{}-{}", left_table, right_table)),
            ));
        }
    }
}

/// Closest existing column by Jaro-Winkler, above the suggestion floor.
fn nearest_column(table: &TableSchema, field: &str) -> Option<String> {
    let needle = normalize_identifier(field);
    table
        .column_names()
        .map(|name| (name, jaro_winkler(&needle, name)))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(name, _)| name.to_string())
}

/// The full local validation pass: parse → field/relationship check → time
/// dimension check → report. Pure and idempotent; safe to run concurrently
/// against a shared knowledge-base snapshot.
#[derive(Debug, Clone, Default)]
pub struct ValidationPipeline {
    validator: FieldRelationshipValidator,
    guard: TimeDimensionGuard,
}

impl ValidationPipeline {
    pub fn new(synonyms: BusinessSynonyms) -> Self {
        Self {
            validator: FieldRelationshipValidator::new(synonyms),
            guard: TimeDimensionGuard::new(),
        }
    }

    pub fn validate(&self, sql: &str, schema: &SchemaKnowledgeBase) -> ValidationReport {
        let stmt = SqlStructureParser::parse(sql);
        self.validate_statement(&stmt, schema)
    }

    pub fn validate_statement(
        &self,
        stmt: &ParsedStatement,
        schema: &SchemaKnowledgeBase,
    ) -> ValidationReport {
        let mut issues = Vec::new();
        if stmt.degraded {
            issues.push(ValidationIssue::new(
                IssueKind::Unparseable,
                "statement could not be fully parsed; validation ran on a partial structure",
                None,
            ));
        }

        let outcome = self.validator.validate(stmt, schema);
        issues.extend(outcome.issues);
        issues.extend(self.guard.check_dimension(stmt, schema));

        ValidationReportBuilder::build(
            outcome.valid_fields,
            outcome.missing_fields,
            issues,
            outcome.hints,
        )
    }
}
