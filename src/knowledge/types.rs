use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A column as the validator sees it: normalized name, optional declared type.
///
/// Source JSON encodes columns either as bare strings or `{name, type}`
/// objects; the loader collapses both into this shape, so nothing downstream
/// ever branches on the input encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: normalize_identifier(&name.into()),
            data_type: None,
        }
    }

    pub fn typed(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: normalize_identifier(&name.into()),
            data_type: Some(data_type.into()),
        }
    }
}

/// Where a relationship record came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipOrigin {
    Manual,
    Auto,
}

/// A declared valid join path between two tables on two fields.
///
/// Lookups must be direction-agnostic: `matches` accepts either orientation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub table1: String,
    pub field1: String,
    pub table2: String,
    pub field2: String,
    pub origin: RelationshipOrigin,
    pub confidence: f64,
}

impl Relationship {
    pub fn new(
        table1: &str,
        field1: &str,
        table2: &str,
        field2: &str,
        origin: RelationshipOrigin,
        confidence: f64,
    ) -> Self {
        Self {
            table1: normalize_table_name(table1),
            field1: normalize_identifier(field1),
            table2: normalize_table_name(table2),
            field2: normalize_identifier(field2),
            origin,
            confidence,
        }
    }

    /// True when this relationship links `(t1, f1)` and `(t2, f2)` in either
    /// direction. Inputs must already be normalized.
    pub fn matches(&self, t1: &str, f1: &str, t2: &str, f2: &str) -> bool {
        (self.table1 == t1 && self.field1 == f1 && self.table2 == t2 && self.field2 == f2)
            || (self.table1 == t2 && self.field1 == f2 && self.table2 == t1 && self.field2 == f1)
    }

    /// True when this relationship touches the given pair of tables at all.
    pub fn links_tables(&self, t1: &str, t2: &str) -> bool {
        (self.table1 == t1 && self.table2 == t2) || (self.table1 == t2 && self.table2 == t1)
    }
}

/// One table of the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: BTreeSet<ColumnSchema>,
    pub relationships: Vec<Relationship>,
    /// Whether this table can be filtered by calendar/fiscal period fields.
    /// Derived once at load time from column names.
    pub has_time_dimension: bool,
}

impl TableSchema {
    pub fn has_column(&self, name: &str) -> bool {
        let normalized = normalize_identifier(name);
        self.columns.iter().any(|c| c.name == normalized)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Temporal keywords used to tag a table as time-dimensioned. Substring match
/// against normalized column names, English plus CJK calendar vocabulary.
/// Must accept every column name the predicate classifier treats as temporal,
/// or a filter on that column gets flagged against its own table; "time"
/// covers datetime and timestamp via the substring match.
pub const TIME_DIMENSION_KEYWORDS: &[&str] = &[
    "year", "month", "week", "day", "date", "time", "quarter", "fiscal", "年", "月", "周", "日期",
    "季度", "财年",
];

/// Strip bracket/quote wrapping and lower-case a bare identifier.
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '[' || c == ']' || c == '"' || c == '`')
        .trim()
        .to_lowercase()
}

/// Normalize a possibly qualified table name: drop `db.schema.` qualifiers,
/// strip bracket quoting, lower-case.
pub fn normalize_table_name(raw: &str) -> String {
    let last = raw.trim().rsplit('.').next().unwrap_or(raw);
    normalize_identifier(last)
}

/// Does a normalized column name look temporal?
pub fn is_temporal_column(name: &str) -> bool {
    TIME_DIMENSION_KEYWORDS
        .iter()
        .any(|kw| name.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_qualified_bracketed_names() {
        assert_eq!(normalize_table_name("[db].[dbo].[Orders]"), "orders");
        assert_eq!(normalize_table_name("dbo.Orders"), "orders");
        assert_eq!(normalize_table_name("  Orders  "), "orders");
        assert_eq!(normalize_identifier("[订单金额]"), "订单金额");
    }

    #[test]
    fn relationship_is_symmetric() {
        let rel = Relationship::new("A", "id", "B", "a_id", RelationshipOrigin::Manual, 1.0);
        assert!(rel.matches("a", "id", "b", "a_id"));
        assert!(rel.matches("b", "a_id", "a", "id"));
        assert!(!rel.matches("a", "id", "b", "other"));
    }

    #[test]
    fn temporal_column_detection() {
        assert!(is_temporal_column("order_date"));
        assert!(is_temporal_column("fiscal_year"));
        assert!(is_temporal_column("create_time"));
        assert!(is_temporal_column("event_timestamp"));
        assert!(is_temporal_column("年"));
        assert!(is_temporal_column("统计月份"));
        assert!(!is_temporal_column("customer_name"));
    }
}
