//! Time Dimension Guard
//!
//! Two jobs. First, check time-predicate use against each table's
//! time-dimension tag: filtering a table that has no calendar columns is a
//! modeling error worth flagging, while leaving a time-dimensioned table
//! unfiltered is a valid business choice. Second, carry time predicates
//! across an external rewrite step: the LLM fixer is observed to truncate or
//! garble these substrings, so they are extracted verbatim before the fix and
//! restored bit-for-bit afterwards.

use crate::knowledge::SchemaKnowledgeBase;
use crate::parser::ParsedStatement;
use crate::validation::report::{IssueKind, ValidationIssue};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static! {
    /// Comparison operator splitting a predicate into field side and value side.
    static ref COMPARISON_OP: Regex =
        Regex::new(r"(?i)>=|<=|<>|!=|=|>|<|\blike\b|\bnot\s+in\b|\bin\b|\bbetween\b").unwrap();
    /// Temporal vocabulary in a field name: English keywords need a
    /// boundary-ish neighbor so `update` does not match `date`; CJK calendar
    /// words match directly.
    static ref TEMPORAL_NAME: Regex = Regex::new(
        r#"(?i)(?:^|[\s\[\.\(_"`])(?:datetime|timestamp|year|month|week|day|date|time|quarter|fiscal\w*)(?:[\s\]\.\)_"`]|$)|年|月|周|日期|季度|财年"#
    )
    .unwrap();
    /// Calendar function calls ("current year"/"current month" computations).
    static ref CALENDAR_FN: Regex = Regex::new(
        r"(?i)\b(getdate|now|curdate|current_date|current_timestamp|sysdatetime|datepart|dateadd|datediff|date_sub|date_add|year|month|day|quarter)\s*\("
    )
    .unwrap();
}

/// Byte span of the outermost WHERE clause.
struct WhereSpan {
    /// Start of the `WHERE` keyword itself.
    keyword_start: usize,
    /// First byte of the clause body.
    body_start: usize,
    /// One past the last byte of the body (start of ORDER BY/GROUP BY/HAVING
    /// or end of statement).
    body_end: usize,
}

/// Find a top-level SQL keyword (outside parentheses, strings, and bracketed
/// identifiers), starting the scan at `from`. Multi-word keywords tolerate
/// arbitrary whitespace between words.
fn find_top_level_keyword(sql: &str, from: usize, keywords: &[&[&str]]) -> Option<(usize, usize)> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut in_bracket = false;
    let mut prev: Option<char> = if from == 0 {
        None
    } else {
        sql[..from].chars().next_back()
    };

    for (offset, c) in sql[from..].char_indices() {
        let i = from + offset;
        match c {
            '\'' if !in_bracket => in_string = !in_string,
            '[' if !in_string => in_bracket = true,
            ']' if !in_string => in_bracket = false,
            '(' if !in_string && !in_bracket => depth += 1,
            ')' if !in_string && !in_bracket => depth = depth.saturating_sub(1),
            _ => {}
        }

        if !in_string && !in_bracket && depth == 0 && c.is_ascii_alphabetic() {
            let boundary_before = prev.map_or(true, |p| !p.is_alphanumeric() && p != '_');
            if boundary_before {
                for words in keywords {
                    if let Some(end) = match_keyword(sql, i, words) {
                        return Some((i, end));
                    }
                }
            }
        }
        prev = Some(c);
    }
    None
}

/// Case-insensitive match of a (possibly multi-word) keyword at `start`,
/// returning the byte index just past it. Requires a word boundary after.
fn match_keyword(sql: &str, start: usize, words: &[&str]) -> Option<usize> {
    let mut pos = start;
    for (wi, word) in words.iter().enumerate() {
        if wi > 0 {
            let skipped = sql[pos..].len() - sql[pos..].trim_start().len();
            if skipped == 0 {
                return None;
            }
            pos += skipped;
        }
        let end = pos + word.len();
        if end > sql.len() || !sql.is_char_boundary(end) {
            return None;
        }
        if !sql[pos..end].eq_ignore_ascii_case(word) {
            return None;
        }
        pos = end;
    }
    match sql[pos..].chars().next() {
        Some(c) if c.is_alphanumeric() || c == '_' => None,
        _ => Some(pos),
    }
}

fn outer_where_span(sql: &str) -> Option<WhereSpan> {
    let (keyword_start, keyword_end) = find_top_level_keyword(sql, 0, &[&["where"]])?;
    let body_end = find_top_level_keyword(
        sql,
        keyword_end,
        &[&["order", "by"], &["group", "by"], &["having"]],
    )
    .map(|(start, _)| start)
    .unwrap_or(sql.len());
    Some(WhereSpan {
        keyword_start,
        body_start: keyword_end,
        body_end,
    })
}

pub(crate) fn outer_where_start(sql: &str) -> Option<usize> {
    outer_where_span(sql).map(|span| span.keyword_start)
}

pub(crate) fn outer_where_body(sql: &str) -> Option<&str> {
    outer_where_span(sql).map(|span| &sql[span.body_start..span.body_end])
}

/// Split a WHERE body on top-level `AND`, keeping `BETWEEN x AND y` intact.
fn split_top_level_conjuncts(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut cursor = 0;
    let mut piece_start = 0;
    let mut pending_between = false;

    while let Some((start, end)) = find_top_level_keyword(body, cursor, &[&["and"], &["between"]]) {
        let keyword = &body[start..end];
        if keyword.eq_ignore_ascii_case("between") {
            pending_between = true;
        } else if pending_between {
            // This AND belongs to the BETWEEN; consume it.
            pending_between = false;
        } else {
            let piece = body[piece_start..start].trim();
            if !piece.is_empty() {
                parts.push(piece);
            }
            piece_start = end;
        }
        cursor = end;
    }
    let tail = body[piece_start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

/// Is this conjunct a time predicate? Either its field side carries temporal
/// vocabulary, or it computes against the calendar.
fn is_time_predicate(conjunct: &str) -> bool {
    let field_side = COMPARISON_OP
        .find(conjunct)
        .map(|m| &conjunct[..m.start()])
        .unwrap_or(conjunct);
    TEMPORAL_NAME.is_match(field_side) || CALENDAR_FN.is_match(conjunct)
}

/// The field side of a predicate, used to recognize garbled remnants.
fn field_head(predicate: &str) -> &str {
    COMPARISON_OP
        .find(predicate)
        .map(|m| predicate[..m.start()].trim())
        .unwrap_or(predicate.trim())
}

/// Extract time predicates from the statement's WHERE clause, verbatim.
pub fn extract_time_predicates(sql: &str) -> Vec<String> {
    let Some(body) = outer_where_body(sql) else {
        return Vec::new();
    };
    split_top_level_conjuncts(body)
        .into_iter()
        .filter(|c| is_time_predicate(c))
        .map(|c| c.to_string())
        .collect()
}

/// Drop all time predicates from the statement (the inverse of restore,
/// useful when handing the statement to a rewriter that should not touch
/// calendar logic). Removes the WHERE clause entirely when nothing remains.
pub fn remove_time_predicates(sql: &str) -> String {
    let Some(span) = outer_where_span(sql) else {
        return sql.to_string();
    };
    let body = &sql[span.body_start..span.body_end];
    let kept: Vec<&str> = split_top_level_conjuncts(body)
        .into_iter()
        .filter(|c| !is_time_predicate(c))
        .collect();

    let prefix = sql[..span.keyword_start].trim_end();
    let tail = sql[span.body_end..].trim_start();
    let mut out = String::from(prefix);
    if !kept.is_empty() {
        out.push_str(" WHERE ");
        out.push_str(&kept.join(" AND "));
    }
    if !tail.is_empty() {
        out.push(' ');
        out.push_str(tail);
    }
    out
}

/// Checks time-predicate use against each table's time-dimension tag and
/// restores verbatim predicates across an external rewrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeDimensionGuard;

impl TimeDimensionGuard {
    pub fn new() -> Self {
        Self
    }

    /// A statement that filters by time while referencing a table with no
    /// time dimension gets one violation per offending table. No predicate,
    /// no issue: absence of a time filter is a valid business choice.
    pub fn check_dimension(
        &self,
        stmt: &ParsedStatement,
        schema: &SchemaKnowledgeBase,
    ) -> Vec<ValidationIssue> {
        if stmt.time_predicates.is_empty() {
            return Vec::new();
        }
        let mut issues = Vec::new();
        for table in stmt.referenced_tables() {
            // Unknown tables are the field validator's problem.
            let Some(schema_table) = schema.lookup(table) else {
                continue;
            };
            if !schema_table.has_time_dimension {
                issues.push(ValidationIssue::new(
                    IssueKind::TimeDimensionViolation,
                    format!(
                        "table '{}' has no time dimension but the statement filters by time: {}",
                        table,
                        stmt.time_predicates.join("; ")
                    ),
                    Some(table.to_string()),
                ));
            }
        }
        issues
    }

    /// See [`extract_time_predicates`].
    pub fn extract_time_predicates(&self, sql: &str) -> Vec<String> {
        extract_time_predicates(sql)
    }

    /// Re-attach the verbatim `predicates` to a rewritten statement.
    ///
    /// Mangled partial remnants of the originals (a conjunct that is a
    /// truncation prefix of a predicate, or that shares its field head) are
    /// removed before the originals are appended, so restoring twice yields
    /// the same statement as restoring once. When the rewrite dropped the
    /// WHERE clause entirely, one is synthesized after the FROM/JOIN section.
    pub fn restore_time_predicates(&self, sql: &str, predicates: &[String]) -> String {
        if predicates.is_empty() {
            return sql.to_string();
        }

        match outer_where_span(sql) {
            Some(span) => {
                let body = &sql[span.body_start..span.body_end];
                let kept: Vec<&str> = split_top_level_conjuncts(body)
                    .into_iter()
                    .filter(|c| !is_remnant_of_any(c, predicates))
                    .collect();

                let mut parts: Vec<&str> = kept;
                parts.extend(predicates.iter().map(|p| p.trim()));

                let prefix = sql[..span.keyword_start].trim_end();
                let tail = sql[span.body_end..].trim_start();
                let mut out = format!("{} WHERE {}", prefix, parts.join(" AND "));
                if !tail.is_empty() {
                    out.push(' ');
                    out.push_str(tail);
                }
                out
            }
            None => {
                debug!("rewritten statement lost its WHERE clause, synthesizing one");
                let insert_at = find_top_level_keyword(
                    sql,
                    0,
                    &[&["order", "by"], &["group", "by"], &["having"]],
                )
                .map(|(start, _)| start)
                .unwrap_or(sql.len());

                let prefix = sql[..insert_at].trim_end();
                let prefix = prefix.strip_suffix(';').unwrap_or(prefix).trim_end();
                let tail = sql[insert_at..].trim_start();
                let joined = predicates
                    .iter()
                    .map(|p| p.trim())
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let mut out = format!("{} WHERE {}", prefix, joined);
                if !tail.is_empty() {
                    out.push(' ');
                    out.push_str(tail);
                }
                out
            }
        }
    }
}

/// A conjunct is a remnant of an original predicate when the predicate starts
/// with it (truncated copy, exact copy included) or when it starts with the
/// predicate's field head (same field, garbled value).
fn is_remnant_of_any(conjunct: &str, predicates: &[String]) -> bool {
    let c = conjunct.trim();
    predicates.iter().any(|p| {
        let p = p.trim();
        let head = field_head(p);
        p.starts_with(c) || (!head.is_empty() && c.starts_with(head))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SqlStructureParser;

    fn kb() -> SchemaKnowledgeBase {
        let tables = r#"{
            "sales": {"columns": ["id", "amount", "order_date"]},
            "region_dim": {"columns": ["region_id", "region_name"]}
        }"#;
        SchemaKnowledgeBase::load(tables, None).unwrap()
    }

    #[test]
    fn extracts_cjk_and_function_predicates() {
        let sql = "SELECT * FROM sales WHERE [年] = YEAR(GETDATE()) AND [月] = MONTH(GETDATE()) AND amount > 5";
        let predicates = extract_time_predicates(sql);
        assert_eq!(
            predicates,
            vec![
                "[年] = YEAR(GETDATE())".to_string(),
                "[月] = MONTH(GETDATE())".to_string()
            ]
        );
    }

    #[test]
    fn between_and_is_one_conjunct() {
        let sql = "SELECT * FROM sales WHERE order_date BETWEEN '2024-01-01' AND '2024-06-30' AND amount > 5";
        let predicates = extract_time_predicates(sql);
        assert_eq!(
            predicates,
            vec!["order_date BETWEEN '2024-01-01' AND '2024-06-30'".to_string()]
        );
    }

    #[test]
    fn subquery_where_is_not_the_outer_where() {
        let sql = "SELECT * FROM sales WHERE id IN (SELECT id FROM other WHERE x = 1) AND [年] = 2024";
        let predicates = extract_time_predicates(sql);
        assert_eq!(predicates, vec!["[年] = 2024".to_string()]);
    }

    #[test]
    fn violation_only_for_tables_without_time_dimension() {
        let guard = TimeDimensionGuard::new();
        let schema = kb();

        let bad = SqlStructureParser::parse(
            "SELECT r.region_name FROM region_dim r WHERE [年] = YEAR(GETDATE())",
        );
        let issues = guard.check_dimension(&bad, &schema);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::TimeDimensionViolation);
        assert_eq!(issues[0].location.as_deref(), Some("region_dim"));

        let fine = SqlStructureParser::parse(
            "SELECT s.amount FROM sales s WHERE s.order_date >= '2024-01-01'",
        );
        assert!(guard.check_dimension(&fine, &schema).is_empty());

        // No time predicate at all: never an issue, even without a dimension.
        let unfiltered = SqlStructureParser::parse("SELECT r.region_name FROM region_dim r");
        assert!(guard.check_dimension(&unfiltered, &schema).is_empty());
    }

    #[test]
    fn time_suffixed_column_counts_as_a_dimension() {
        // The predicate classifier and the load-time table tag must agree:
        // filtering a table on its own `*_time` column is not a violation.
        let guard = TimeDimensionGuard::new();
        let schema = SchemaKnowledgeBase::load(
            r#"{"audit_log": {"columns": ["id", "create_time", "actor"]}}"#,
            None,
        )
        .unwrap();

        let sql = "SELECT a.actor FROM audit_log a WHERE a.create_time >= '2024-01-01'";
        assert_eq!(
            extract_time_predicates(sql),
            vec!["a.create_time >= '2024-01-01'".to_string()]
        );
        let stmt = SqlStructureParser::parse(sql);
        assert!(guard.check_dimension(&stmt, &schema).is_empty());
    }

    #[test]
    fn restore_appends_verbatim_and_removes_remnants() {
        let guard = TimeDimensionGuard::new();
        let predicates = vec!["[年] = YEAR(GETDATE())".to_string()];
        // The rewriter truncated the predicate.
        let rewritten = "SELECT * FROM sales WHERE amount > 5 AND [年] = YEAR ORDER BY amount";
        let restored = guard.restore_time_predicates(rewritten, &predicates);
        assert_eq!(
            restored,
            "SELECT * FROM sales WHERE amount > 5 AND [年] = YEAR(GETDATE()) ORDER BY amount"
        );
    }

    #[test]
    fn restore_is_idempotent() {
        let guard = TimeDimensionGuard::new();
        let predicates = vec![
            "[年] = YEAR(GETDATE())".to_string(),
            "[月] = MONTH(GETDATE())".to_string(),
        ];
        let rewritten = "SELECT * FROM sales WHERE amount > 5";
        let once = guard.restore_time_predicates(rewritten, &predicates);
        let twice = guard.restore_time_predicates(&once, &predicates);
        assert_eq!(once, twice);
    }

    #[test]
    fn restore_synthesizes_missing_where() {
        let guard = TimeDimensionGuard::new();
        let predicates = vec!["[月] = MONTH(GETDATE())".to_string()];
        let restored =
            guard.restore_time_predicates("SELECT * FROM sales GROUP BY region", &predicates);
        assert_eq!(
            restored,
            "SELECT * FROM sales WHERE [月] = MONTH(GETDATE()) GROUP BY region"
        );

        let no_tail = guard.restore_time_predicates("SELECT * FROM sales", &predicates);
        assert_eq!(no_tail, "SELECT * FROM sales WHERE [月] = MONTH(GETDATE())");
    }

    #[test]
    fn round_trip_is_set_equivalent() {
        let sql = "SELECT * FROM sales WHERE [年] = YEAR(GETDATE()) AND amount > 5 AND [月] = MONTH(GETDATE())";
        let originals = extract_time_predicates(sql);
        let stripped = remove_time_predicates(sql);
        assert_eq!(stripped, "SELECT * FROM sales WHERE amount > 5");

        let guard = TimeDimensionGuard::new();
        let restored = guard.restore_time_predicates(&stripped, &originals);
        let mut recovered = extract_time_predicates(&restored);
        let mut expected = originals.clone();
        recovered.sort();
        expected.sort();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn remove_drops_where_entirely_when_empty() {
        let sql = "SELECT * FROM sales WHERE [年] = 2024 ORDER BY id";
        assert_eq!(remove_time_predicates(sql), "SELECT * FROM sales ORDER BY id");
    }
}
