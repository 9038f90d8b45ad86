//! Schema Knowledge Base
//!
//! The curated, load-once description of tables, columns, and relationships
//! used to check drafted SQL. Built from JSON documents at startup and
//! immutable afterwards; readers share it by reference, so any number of
//! validations can run concurrently without locking.

pub mod loader;
pub mod types;

pub use types::{
    normalize_identifier, normalize_table_name, ColumnSchema, Relationship, RelationshipOrigin,
    TableSchema,
};

use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Immutable, read-only view of tables, columns, relationships, and
/// time-dimension tags.
#[derive(Debug, Clone)]
pub struct SchemaKnowledgeBase {
    tables: HashMap<String, TableSchema>,
    relationships: Vec<Relationship>,
}

impl SchemaKnowledgeBase {
    /// Build a knowledge base from the table document and an optional
    /// standalone relationships document. Fails only on structurally invalid
    /// JSON; unknown extra keys are ignored.
    pub fn load(tables_json: &str, relationships_json: Option<&str>) -> Result<Self> {
        let (mut tables, inline_records) = loader::load_tables(tables_json)?;

        let mut records = inline_records;
        if let Some(json) = relationships_json {
            records.extend(loader::load_relationship_records(json)?);
        }

        let mut relationships = Vec::with_capacity(records.len());
        for record in records {
            relationships.push(record.resolve()?);
        }

        for rel in &relationships {
            for table_name in [&rel.table1, &rel.table2] {
                if let Some(table) = tables.get_mut(table_name) {
                    table.relationships.push(rel.clone());
                }
            }
        }

        info!(
            tables = tables.len(),
            relationships = relationships.len(),
            "schema knowledge base loaded"
        );

        Ok(Self {
            tables,
            relationships,
        })
    }

    /// Look up a table by any spelling: qualified, bracketed, or mixed-case.
    pub fn lookup(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&normalize_table_name(name))
    }

    /// Find the declared relationship between `(t1, f1)` and `(t2, f2)`,
    /// matching regardless of which side is queried first.
    pub fn relationship_between(
        &self,
        t1: &str,
        f1: &str,
        t2: &str,
        f2: &str,
    ) -> Option<&Relationship> {
        let (t1, f1) = (normalize_table_name(t1), normalize_identifier(f1));
        let (t2, f2) = (normalize_table_name(t2), normalize_identifier(f2));
        self.relationships
            .iter()
            .find(|rel| rel.matches(&t1, &f1, &t2, &f2))
    }

    /// Any declared relationship touching this pair of tables, either way.
    pub fn relationships_linking(&self, t1: &str, t2: &str) -> Vec<&Relationship> {
        let t1 = normalize_table_name(t1);
        let t2 = normalize_table_name(t2);
        self.relationships
            .iter()
            .filter(|rel| rel.links_tables(&t1, &t2))
            .collect()
    }

    pub fn has_time_dimension(&self, table: &str) -> bool {
        self.lookup(table)
            .map(|t| t.has_time_dimension)
            .unwrap_or(false)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| k.as_str())
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }
}

/// Hot-reloadable handle over the knowledge base.
///
/// Readers take a snapshot `Arc` and validate against it for the whole call;
/// `reload` swaps in a fully-built replacement atomically, so a reader sees
/// either the old snapshot or the new one, never a partial build.
pub struct SharedKnowledgeBase {
    inner: RwLock<Arc<SchemaKnowledgeBase>>,
}

impl SharedKnowledgeBase {
    pub fn new(kb: SchemaKnowledgeBase) -> Self {
        Self {
            inner: RwLock::new(Arc::new(kb)),
        }
    }

    pub fn snapshot(&self) -> Arc<SchemaKnowledgeBase> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn reload(&self, kb: SchemaKnowledgeBase) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(kb);
        info!("schema knowledge base snapshot swapped");
    }
}
