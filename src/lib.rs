//! Local validation core for LLM-generated SQL.
//!
//! A draft query goes through three checks before anything executes it:
//! structural parsing (aliases, fields, joins), schema validation against a
//! JSON-loaded knowledge base, and a time-dimension guard that also keeps the
//! user's literal time filters intact across external rewrites. When a draft
//! fails, the correction orchestrator runs bounded fix-and-revalidate rounds
//! against an LLM collaborator.

pub mod config;
pub mod error;
pub mod fixer;
pub mod knowledge;
pub mod orchestrator;
pub mod parser;
pub mod time_guard;
pub mod validation;

pub use config::{LlmConfig, RetryPolicy, SentinelConfig};
pub use error::{FixerError, Result, SentinelError};
pub use fixer::{FixRequest, FixedSql, LlmFixer, SqlFixer};
pub use knowledge::{SchemaKnowledgeBase, SharedKnowledgeBase};
pub use orchestrator::{AttemptRecord, CorrectionOrchestrator, CorrectionOutcome, CorrectionState};
pub use parser::{ParsedStatement, SqlStructureParser};
pub use time_guard::TimeDimensionGuard;
pub use validation::{
    BusinessSynonyms, IssueKind, ValidationIssue, ValidationPipeline, ValidationReport,
};
