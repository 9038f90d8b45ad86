//! Knowledge-base document loading.
//!
//! Two JSON documents feed the knowledge base: a table document (table name →
//! columns, optionally with inline relationships) and an optional standalone
//! relationships document. Both tolerate unknown extra keys; only missing
//! required keys are a `SchemaFormat` error.

use crate::error::{Result, SentinelError};
use crate::knowledge::types::{
    is_temporal_column, normalize_table_name, ColumnSchema, Relationship, RelationshipOrigin,
    TableSchema,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// A column entry as it appears in the table document. Bare strings and
/// `{name, type}` objects are both accepted and normalized at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ColumnDoc {
    Bare(String),
    Typed {
        name: String,
        #[serde(rename = "type")]
        #[serde(default)]
        data_type: Option<String>,
    },
}

impl ColumnDoc {
    fn into_column(self) -> ColumnSchema {
        match self {
            ColumnDoc::Bare(name) => ColumnSchema::new(name),
            ColumnDoc::Typed { name, data_type } => match data_type {
                Some(t) => ColumnSchema::typed(name, t),
                None => ColumnSchema::new(name),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableDoc {
    pub columns: Vec<ColumnDoc>,
    #[serde(default)]
    pub relationships: Vec<RelationshipRecord>,
}

/// One relationship record: either explicit fields or a free-text
/// description of the form `<table1>.<field1> <op> <table2>.<field2>`.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationshipRecord {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub table1: Option<String>,
    #[serde(default)]
    pub field1: Option<String>,
    #[serde(default)]
    pub table2: Option<String>,
    #[serde(default)]
    pub field2: Option<String>,
    #[serde(default)]
    pub origin: Option<RelationshipOrigin>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// The standalone relationships document: a bare list or `{relationships: [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RelationshipsDoc {
    Bare(Vec<RelationshipRecord>),
    Wrapped {
        relationships: Vec<RelationshipRecord>,
    },
}

impl RelationshipsDoc {
    pub fn into_records(self) -> Vec<RelationshipRecord> {
        match self {
            RelationshipsDoc::Bare(records) => records,
            RelationshipsDoc::Wrapped { relationships } => relationships,
        }
    }
}

lazy_static! {
    // Operator alternation: `==` must come before `=`.
    static ref RELATIONSHIP_OP: Regex = Regex::new(r"==|<->|等于|=").unwrap();
}

/// Parse a `<table1>.<field1> <op> <table2>.<field2>` description.
/// Returns `None` when the text does not match the pattern.
pub fn parse_relationship_description(description: &str) -> Option<(String, String, String, String)> {
    let m = RELATIONSHIP_OP.find(description)?;
    let left = description[..m.start()].trim();
    let right = description[m.end()..].trim();
    let (t1, f1) = split_qualified(left)?;
    let (t2, f2) = split_qualified(right)?;
    Some((t1, f1, t2, f2))
}

/// Split `db.schema.table.field` at the last dot, normalizing both halves.
fn split_qualified(text: &str) -> Option<(String, String)> {
    let (table_part, field_part) = text.rsplit_once('.')?;
    if table_part.is_empty() || field_part.is_empty() {
        return None;
    }
    let table = normalize_table_name(table_part);
    let field = crate::knowledge::types::normalize_identifier(field_part);
    if table.is_empty() || field.is_empty() {
        return None;
    }
    Some((table, field))
}

impl RelationshipRecord {
    /// Resolve this record to a `Relationship`: the description pattern is
    /// tried first, explicit fields are the fallback.
    pub fn resolve(&self) -> Result<Relationship> {
        let origin = self.origin.unwrap_or(RelationshipOrigin::Manual);
        let confidence = self.confidence.unwrap_or(1.0);

        if let Some(ref description) = self.description {
            if let Some((t1, f1, t2, f2)) = parse_relationship_description(description) {
                return Ok(Relationship::new(&t1, &f1, &t2, &f2, origin, confidence));
            }
            debug!(%description, "relationship description did not match pattern, trying explicit fields");
        }

        match (&self.table1, &self.field1, &self.table2, &self.field2) {
            (Some(t1), Some(f1), Some(t2), Some(f2)) => {
                Ok(Relationship::new(t1, f1, t2, f2, origin, confidence))
            }
            _ => Err(SentinelError::SchemaFormat(format!(
                "relationship record has neither a parseable description nor explicit fields: {:?}",
                self.description
            ))),
        }
    }
}

/// Parse the table document and build the table map plus collected inline
/// relationship records.
pub fn load_tables(
    tables_json: &str,
) -> Result<(HashMap<String, TableSchema>, Vec<RelationshipRecord>)> {
    let docs: HashMap<String, TableDoc> = serde_json::from_str(tables_json)
        .map_err(|e| SentinelError::SchemaFormat(format!("invalid table document: {}", e)))?;

    let mut tables = HashMap::with_capacity(docs.len());
    let mut inline_records = Vec::new();

    for (raw_name, doc) in docs {
        let name = normalize_table_name(&raw_name);
        if name.is_empty() {
            return Err(SentinelError::SchemaFormat(format!(
                "table name normalizes to empty: {:?}",
                raw_name
            )));
        }
        let columns: BTreeSet<ColumnSchema> =
            doc.columns.into_iter().map(ColumnDoc::into_column).collect();
        let has_time_dimension = columns.iter().any(|c| is_temporal_column(&c.name));
        inline_records.extend(doc.relationships);

        if tables
            .insert(
                name.clone(),
                TableSchema {
                    name: name.clone(),
                    columns,
                    relationships: Vec::new(),
                    has_time_dimension,
                },
            )
            .is_some()
        {
            warn!(table = %name, "duplicate table after normalization, keeping the last definition");
        }
    }

    Ok((tables, inline_records))
}

/// Parse the standalone relationships document.
pub fn load_relationship_records(relationships_json: &str) -> Result<Vec<RelationshipRecord>> {
    let doc: RelationshipsDoc = serde_json::from_str(relationships_json).map_err(|e| {
        SentinelError::SchemaFormat(format!("invalid relationships document: {}", e))
    })?;
    Ok(doc.into_records())
}
