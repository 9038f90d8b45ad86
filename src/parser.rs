//! SQL Structure Parser
//!
//! Extracts tables/aliases, JOIN predicates, WHERE and SELECT field
//! references, and verbatim time predicates from a raw SQL string. Purely
//! syntactic: no schema lookups, deterministic, and safe to run on arbitrary
//! text; malformed input degrades to a partial result flagged `degraded`
//! instead of an error.
//!
//! The primary pass parses the statement with `sqlparser` (MsSql dialect
//! first so `[bracketed]` identifiers work, then Generic) and walks the AST.
//! When both dialects reject the input, a bounded regex heuristic recovers
//! whatever structure it can.

use crate::knowledge::{normalize_identifier, normalize_table_name};
use crate::time_guard;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Cte, Expr, FunctionArg, FunctionArgExpr, Join, JoinConstraint, JoinOperator, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::{GenericDialect, MsSqlDialect};
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// A field reference `(alias?, field)`, names normalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub alias: Option<String>,
    pub field: String,
}

impl FieldRef {
    pub fn qualified(alias: &str, field: &str) -> Self {
        Self {
            alias: Some(normalize_identifier(alias)),
            field: normalize_identifier(field),
        }
    }

    pub fn bare(field: &str) -> Self {
        Self {
            alias: None,
            field: normalize_identifier(field),
        }
    }
}

/// One `ON` equality `(leftAlias.leftField = rightAlias.rightField)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JoinPredicate {
    pub left_alias: String,
    pub left_field: String,
    pub right_alias: String,
    pub right_field: String,
}

/// Structural summary of one SQL statement. Owned by the validation pipeline
/// for the duration of a single validation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedStatement {
    /// alias (or table's own normalized name when un-aliased) → table name.
    pub alias_to_table: HashMap<String, String>,
    pub join_predicates: Vec<JoinPredicate>,
    pub where_field_refs: Vec<FieldRef>,
    pub select_field_refs: Vec<FieldRef>,
    /// Verbatim text spans, restorable bit-for-bit.
    pub time_predicates: Vec<String>,
    /// Tables named directly in a FROM clause (not via JOIN).
    pub from_tables: Vec<String>,
    /// CTE names defined by the statement; not checkable against the schema.
    pub cte_tables: HashSet<String>,
    /// True when the AST pass failed and only the regex heuristic ran. The
    /// caller records this as an `unparseable` issue.
    pub degraded: bool,
}

impl ParsedStatement {
    /// Distinct tables referenced by the statement, CTEs excluded.
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for table in self.alias_to_table.values() {
            if !self.cte_tables.contains(table.as_str()) && seen.insert(table.as_str()) {
                out.push(table.as_str());
            }
        }
        out.sort_unstable();
        out
    }

    /// The statement's sole table, when it references exactly one.
    pub fn sole_table(&self) -> Option<&str> {
        let tables = self.referenced_tables();
        match tables.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }
}

pub struct SqlStructureParser;

impl SqlStructureParser {
    /// Parse a statement into its structural summary. Never fails; arbitrary
    /// text yields an empty, degraded summary.
    pub fn parse(sql: &str) -> ParsedStatement {
        let mut stmt = ParsedStatement {
            time_predicates: time_guard::extract_time_predicates(sql),
            ..Default::default()
        };

        let parsed = Parser::parse_sql(&MsSqlDialect {}, sql)
            .or_else(|_| Parser::parse_sql(&GenericDialect {}, sql));

        match parsed {
            Ok(ast) => {
                for statement in &ast {
                    if let Statement::Query(query) = statement {
                        Self::collect_query(query, &mut stmt);
                    }
                }
                if stmt.alias_to_table.is_empty() && !ast.is_empty() {
                    // Parsed, but not a SELECT/WITH we understand.
                    debug!("statement parsed but produced no table references");
                }
            }
            Err(e) => {
                warn!("SQL parsing failed: {}, using heuristic fallback", e);
                stmt.degraded = true;
                Self::collect_heuristic(sql, &mut stmt);
            }
        }

        stmt
    }

    fn collect_query(query: &Query, stmt: &mut ParsedStatement) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                Self::collect_cte(cte, stmt);
            }
        }
        Self::collect_set_expr(&query.body, stmt);
    }

    fn collect_cte(cte: &Cte, stmt: &mut ParsedStatement) {
        let name = normalize_identifier(&cte.alias.name.value);
        stmt.cte_tables.insert(name.clone());
        stmt.alias_to_table.insert(name.clone(), name);
        // The CTE body references real tables; fold it into the same summary.
        Self::collect_query(&cte.query, stmt);
    }

    fn collect_set_expr(body: &SetExpr, stmt: &mut ParsedStatement) {
        match body {
            SetExpr::Select(select) => Self::collect_select(select, stmt),
            SetExpr::Query(query) => Self::collect_query(query, stmt),
            SetExpr::SetOperation { left, right, .. } => {
                Self::collect_set_expr(left, stmt);
                Self::collect_set_expr(right, stmt);
            }
            _ => {}
        }
    }

    fn collect_select(select: &Select, stmt: &mut ParsedStatement) {
        for table_with_joins in &select.from {
            Self::collect_table_with_joins(table_with_joins, stmt);
        }

        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    let mut refs = Vec::new();
                    Self::collect_expr_refs(expr, &mut refs, stmt);
                    stmt.select_field_refs.extend(refs);
                }
                SelectItem::QualifiedWildcard(..) | SelectItem::Wildcard(..) => {}
            }
        }

        if let Some(selection) = &select.selection {
            let mut refs = Vec::new();
            Self::collect_expr_refs(selection, &mut refs, stmt);
            stmt.where_field_refs.extend(refs);
        }
    }

    fn collect_table_with_joins(twj: &TableWithJoins, stmt: &mut ParsedStatement) {
        if let Some(table) = Self::register_table_factor(&twj.relation, stmt) {
            stmt.from_tables.push(table);
        }
        for join in &twj.joins {
            Self::collect_join(join, stmt);
        }
    }

    fn collect_join(join: &Join, stmt: &mut ParsedStatement) {
        Self::register_table_factor(&join.relation, stmt);
        let constraint = match &join.join_operator {
            JoinOperator::Inner(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c) => Some(c),
            _ => None,
        };
        if let Some(JoinConstraint::On(expr)) = constraint {
            Self::collect_on_equalities(expr, stmt);
        }
    }

    /// Register a table factor under its alias (or its own name) and return
    /// the normalized table name.
    fn register_table_factor(factor: &TableFactor, stmt: &mut ParsedStatement) -> Option<String> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let raw = name
                    .0
                    .iter()
                    .map(|ident| ident.value.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                let table = normalize_table_name(&raw);
                let key = match alias {
                    Some(a) => normalize_identifier(&a.name.value),
                    None => table.clone(),
                };
                stmt.alias_to_table.insert(key, table.clone());
                Some(table)
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                if let Some(a) = alias {
                    let name = normalize_identifier(&a.name.value);
                    stmt.cte_tables.insert(name.clone());
                    stmt.alias_to_table.insert(name.clone(), name);
                }
                Self::collect_query(subquery, stmt);
                None
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                Self::collect_table_with_joins(table_with_joins, stmt);
                None
            }
            _ => None,
        }
    }

    /// Walk an `ON` expression collecting AND-chained `a.x = b.y` equalities.
    fn collect_on_equalities(expr: &Expr, stmt: &mut ParsedStatement) {
        use sqlparser::ast::BinaryOperator;
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And => {
                    Self::collect_on_equalities(left, stmt);
                    Self::collect_on_equalities(right, stmt);
                }
                BinaryOperator::Eq => {
                    if let (Some((la, lf)), Some((ra, rf))) =
                        (Self::qualified_ref(left), Self::qualified_ref(right))
                    {
                        stmt.join_predicates.push(JoinPredicate {
                            left_alias: la,
                            left_field: lf,
                            right_alias: ra,
                            right_field: rf,
                        });
                    }
                }
                _ => {}
            },
            Expr::Nested(inner) => Self::collect_on_equalities(inner, stmt),
            _ => {}
        }
    }

    /// `alias.field` when the expression is a two-part identifier.
    fn qualified_ref(expr: &Expr) -> Option<(String, String)> {
        match expr {
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let field = normalize_identifier(&parts[parts.len() - 1].value);
                let alias = normalize_identifier(&parts[parts.len() - 2].value);
                Some((alias, field))
            }
            Expr::Nested(inner) => Self::qualified_ref(inner),
            _ => None,
        }
    }

    /// Collect every column reference appearing in an expression.
    fn collect_expr_refs(expr: &Expr, refs: &mut Vec<FieldRef>, stmt: &mut ParsedStatement) {
        match expr {
            Expr::Identifier(ident) => {
                refs.push(FieldRef::bare(&ident.value));
            }
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                refs.push(FieldRef::qualified(
                    &parts[parts.len() - 2].value,
                    &parts[parts.len() - 1].value,
                ));
            }
            Expr::CompoundIdentifier(parts) => {
                if let Some(ident) = parts.first() {
                    refs.push(FieldRef::bare(&ident.value));
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                Self::collect_expr_refs(left, refs, stmt);
                Self::collect_expr_refs(right, refs, stmt);
            }
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::Cast { expr, .. } => {
                Self::collect_expr_refs(expr, refs, stmt);
            }
            Expr::InList { expr, list, .. } => {
                Self::collect_expr_refs(expr, refs, stmt);
                for item in list {
                    Self::collect_expr_refs(item, refs, stmt);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                Self::collect_expr_refs(expr, refs, stmt);
                Self::collect_expr_refs(low, refs, stmt);
                Self::collect_expr_refs(high, refs, stmt);
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                Self::collect_expr_refs(expr, refs, stmt);
                Self::collect_expr_refs(pattern, refs, stmt);
            }
            Expr::Function(function) => {
                for arg in &function.args {
                    let arg_expr = match arg {
                        FunctionArg::Named { arg, .. } => arg,
                        FunctionArg::Unnamed(arg) => arg,
                    };
                    if let FunctionArgExpr::Expr(inner) = arg_expr {
                        Self::collect_expr_refs(inner, refs, stmt);
                    }
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                Self::collect_expr_refs(expr, refs, stmt);
                Self::collect_query(subquery, stmt);
            }
            Expr::Subquery(subquery) | Expr::Exists { subquery, .. } => {
                Self::collect_query(subquery, stmt);
            }
            _ => {}
        }
    }

    /// Regex fallback for statements `sqlparser` rejects. Recovers
    /// FROM/JOIN tables with aliases, ON equalities, and WHERE field
    /// references; everything it misses stays missing.
    fn collect_heuristic(sql: &str, stmt: &mut ParsedStatement) {
        lazy_static! {
            static ref TABLE_REF: Regex = Regex::new(
                r#"(?i)\b(from|join)\s+([A-Za-z0-9_\.\[\]"`一-鿿]+)(?:\s+(?:as\s+)?([A-Za-z_][A-Za-z0-9_]*))?"#
            )
            .unwrap();
            static ref ON_EQUALITY: Regex = Regex::new(
                r#"(?i)\b([A-Za-z_][A-Za-z0-9_]*)\s*\.\s*(\[[^\]]+\]|[A-Za-z0-9_一-鿿]+)\s*=\s*([A-Za-z_][A-Za-z0-9_]*)\s*\.\s*(\[[^\]]+\]|[A-Za-z0-9_一-鿿]+)"#
            )
            .unwrap();
            static ref QUALIFIED_FIELD: Regex = Regex::new(
                r#"([A-Za-z_][A-Za-z0-9_]*)\s*\.\s*(\[[^\]]+\]|[A-Za-z0-9_一-鿿]+)"#
            )
            .unwrap();
            static ref BARE_BRACKET_FIELD: Regex = Regex::new(r#"(^|[^.\]\w])\[([^\]]+)\]"#).unwrap();
            static ref ON_KEYWORD: Regex = Regex::new(r"(?i)\bon\b").unwrap();
        }
        const RESERVED_ALIAS: &[&str] = &[
            "on", "where", "join", "inner", "left", "right", "full", "cross", "group", "order",
            "having", "as", "union", "set",
        ];

        for caps in TABLE_REF.captures_iter(sql) {
            let table = normalize_table_name(&caps[2]);
            if table.is_empty() {
                continue;
            }
            let alias = caps
                .get(3)
                .map(|m| normalize_identifier(m.as_str()))
                .filter(|a| !RESERVED_ALIAS.contains(&a.as_str()));
            let key = alias.unwrap_or_else(|| table.clone());
            stmt.alias_to_table.insert(key, table.clone());
            if caps[1].eq_ignore_ascii_case("from") {
                stmt.from_tables.push(table);
            }
        }

        // ON equalities between the first ON keyword and the WHERE clause.
        if let Some(on_match) = ON_KEYWORD.find(sql) {
            let scope_end = time_guard::outer_where_start(sql).unwrap_or(sql.len());
            if on_match.start() < scope_end {
                for caps in ON_EQUALITY.captures_iter(&sql[on_match.end()..scope_end]) {
                    stmt.join_predicates.push(JoinPredicate {
                        left_alias: normalize_identifier(&caps[1]),
                        left_field: normalize_identifier(&caps[2]),
                        right_alias: normalize_identifier(&caps[3]),
                        right_field: normalize_identifier(&caps[4]),
                    });
                }
            }
        }

        if let Some(body) = time_guard::outer_where_body(sql) {
            for caps in QUALIFIED_FIELD.captures_iter(body) {
                stmt.where_field_refs
                    .push(FieldRef::qualified(&caps[1], &caps[2]));
            }
            for caps in BARE_BRACKET_FIELD.captures_iter(body) {
                stmt.where_field_refs.push(FieldRef::bare(&caps[2]));
            }
        }
    }
}
