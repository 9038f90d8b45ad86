//! Fix-and-revalidate correction loop.
//!
//! Bounded rounds: validate the draft, and while it fails, hand it to the
//! fixer together with the issue summary, restore the verbatim time
//! predicates the rewrite may have touched, and validate again. Transient
//! fixer failures are retried with backoff inside a round; a malformed
//! response ends the loop with the last local report.

use crate::config::{RetryPolicy, SentinelConfig};
use crate::error::FixerError;
use crate::fixer::{schema_context, FixRequest, FixedSql, SqlFixer};
use crate::knowledge::SchemaKnowledgeBase;
use crate::time_guard::TimeDimensionGuard;
use crate::validation::{BusinessSynonyms, ValidationPipeline, ValidationReport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Where a draft sits in the correction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionState {
    Draft,
    LocallyValidated,
    NeedsFix,
    FixRequested,
    Refixed,
    Revalidated,
    Valid,
    Final,
}

/// One entry in the audit trail of a correction.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub round: u8,
    pub state: CorrectionState,
    pub at: DateTime<Utc>,
    /// The fixer's explanation, when this entry records a fix.
    pub explanation: Option<String>,
    /// Issue summary of the validation pass, when this entry records one.
    pub report_summary: Option<String>,
}

impl AttemptRecord {
    fn new(round: u8, state: CorrectionState) -> Self {
        Self {
            round,
            state,
            at: Utc::now(),
            explanation: None,
            report_summary: None,
        }
    }

    fn with_summary(mut self, summary: String) -> Self {
        self.report_summary = Some(summary);
        self
    }

    fn with_explanation(mut self, explanation: String) -> Self {
        self.explanation = Some(explanation);
        self
    }
}

/// Final result of a correction run. The report always describes `final_sql`.
#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    pub correction_id: Uuid,
    pub final_sql: String,
    pub report: ValidationReport,
    pub trail: Vec<AttemptRecord>,
}

impl CorrectionOutcome {
    /// The fixer explanations, oldest first, for surfacing to the user.
    pub fn explanation_trail(&self) -> Vec<&str> {
        self.trail
            .iter()
            .filter_map(|record| record.explanation.as_deref())
            .collect()
    }
}

pub struct CorrectionOrchestrator {
    pipeline: ValidationPipeline,
    guard: TimeDimensionGuard,
    fixer: Arc<dyn SqlFixer>,
    retry: RetryPolicy,
    max_fix_rounds: u8,
}

impl CorrectionOrchestrator {
    pub fn new(config: &SentinelConfig, fixer: Arc<dyn SqlFixer>) -> Self {
        let synonyms = BusinessSynonyms::from_entries(
            config
                .business_synonyms
                .iter()
                .map(|(term, note)| (term.clone(), note.clone())),
        );
        Self {
            pipeline: ValidationPipeline::new(synonyms),
            guard: TimeDimensionGuard::new(),
            fixer,
            retry: config.retry.clone(),
            max_fix_rounds: config.max_fix_rounds,
        }
    }

    /// Validate a draft and, if it fails, run bounded fix-and-revalidate
    /// rounds. Never errors: the outcome carries the last report whether or
    /// not the draft ended up valid.
    pub async fn run(
        &self,
        sql: &str,
        question: &str,
        schema: &SchemaKnowledgeBase,
    ) -> CorrectionOutcome {
        let correction_id = Uuid::new_v4();
        let mut trail = vec![AttemptRecord::new(0, CorrectionState::Draft)];
        let mut current_sql = sql.to_string();

        let mut report = self.pipeline.validate(&current_sql, schema);
        trail.push(
            AttemptRecord::new(0, CorrectionState::LocallyValidated)
                .with_summary(report.summary()),
        );

        if report.all_valid {
            info!(%correction_id, "draft valid on first pass");
            trail.push(AttemptRecord::new(0, CorrectionState::Valid));
            trail.push(AttemptRecord::new(0, CorrectionState::Final));
            return CorrectionOutcome {
                correction_id,
                final_sql: current_sql,
                report,
                trail,
            };
        }

        let context = schema_context(schema);
        let mut rounds_used = 0;
        for round in 1..=self.max_fix_rounds {
            rounds_used = round;
            trail.push(AttemptRecord::new(round, CorrectionState::NeedsFix));

            // Preserve the user's literal time filters across the rewrite.
            let time_predicates = self.guard.extract_time_predicates(&current_sql);
            let request = FixRequest {
                question: question.to_string(),
                sql: current_sql.clone(),
                report_summary: report.summary(),
                schema_context: context.clone(),
            };

            trail.push(AttemptRecord::new(round, CorrectionState::FixRequested));
            let fixed = match self.call_fixer(&request).await {
                Ok(fixed) => fixed,
                Err(err) => {
                    warn!(%correction_id, round, error = %err, "fixer unavailable, keeping last draft");
                    break;
                }
            };

            current_sql = self
                .guard
                .restore_time_predicates(&fixed.sql, &time_predicates);
            trail.push(
                AttemptRecord::new(round, CorrectionState::Refixed)
                    .with_explanation(fixed.explanation),
            );

            report = self.pipeline.validate(&current_sql, schema);
            trail.push(
                AttemptRecord::new(round, CorrectionState::Revalidated)
                    .with_summary(report.summary()),
            );

            if report.all_valid {
                info!(%correction_id, round, "draft valid after fix");
                trail.push(AttemptRecord::new(round, CorrectionState::Valid));
                break;
            }
        }

        trail.push(AttemptRecord::new(rounds_used, CorrectionState::Final));
        CorrectionOutcome {
            correction_id,
            final_sql: current_sql,
            report,
            trail,
        }
    }

    /// One fixer call with backoff on transient failures.
    async fn call_fixer(&self, request: &FixRequest) -> Result<FixedSql, FixerError> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.fixer.fix(request).await {
                Ok(fixed) => return Ok(fixed),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying fixer");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fixer that replays a script of responses and counts calls.
    struct ScriptedFixer {
        responses: Mutex<Vec<Result<FixedSql, FixerError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFixer {
        fn new(responses: Vec<Result<FixedSql, FixerError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SqlFixer for ScriptedFixer {
        async fn fix(&self, _request: &FixRequest) -> Result<FixedSql, FixerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(FixerError::Malformed("script exhausted".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    fn fast_config() -> SentinelConfig {
        SentinelConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                multiplier: 1.0,
                jitter: false,
            },
            max_fix_rounds: 2,
            llm: LlmConfig::default(),
            business_synonyms: Vec::new(),
        }
    }

    fn kb() -> SchemaKnowledgeBase {
        let tables = r#"{
            "orders": {"columns": ["id", "amount", "order_date"]},
            "customers": {"columns": ["id", "name"]}
        }"#;
        let rels = r#"[{"description": "orders.id == customers.id"}]"#;
        SchemaKnowledgeBase::load(tables, Some(rels)).unwrap()
    }

    fn fixed(sql: &str, explanation: &str) -> Result<FixedSql, FixerError> {
        Ok(FixedSql {
            sql: sql.to_string(),
            explanation: explanation.to_string(),
        })
    }

    #[tokio::test]
    async fn valid_draft_never_calls_fixer() {
        let fixer = Arc::new(ScriptedFixer::new(vec![]));
        let orchestrator = CorrectionOrchestrator::new(&fast_config(), fixer.clone());
        let outcome = orchestrator
            .run("SELECT o.amount FROM orders o", "total amount", &kb())
            .await;
        assert!(outcome.report.all_valid);
        assert_eq!(fixer.call_count(), 0);
        assert_eq!(
            outcome.trail.last().map(|r| r.state),
            Some(CorrectionState::Final)
        );
    }

    #[tokio::test]
    async fn invalid_draft_is_fixed_and_revalidated() {
        let fixer = Arc::new(ScriptedFixer::new(vec![fixed(
            "SELECT o.amount FROM orders o",
            "replaced unknown column 'amt' with 'amount'",
        )]));
        let orchestrator = CorrectionOrchestrator::new(&fast_config(), fixer.clone());
        let outcome = orchestrator
            .run("SELECT o.amt FROM orders o", "total amount", &kb())
            .await;
        assert!(outcome.report.all_valid);
        assert_eq!(outcome.final_sql, "SELECT o.amount FROM orders o");
        assert_eq!(fixer.call_count(), 1);
        assert_eq!(
            outcome.explanation_trail(),
            vec!["replaced unknown column 'amt' with 'amount'"]
        );
    }

    #[tokio::test]
    async fn transient_failure_is_retried_within_a_round() {
        let fixer = Arc::new(ScriptedFixer::new(vec![
            Err(FixerError::Timeout),
            Err(FixerError::RateLimited),
            fixed("SELECT o.amount FROM orders o", "fixed"),
        ]));
        let orchestrator = CorrectionOrchestrator::new(&fast_config(), fixer.clone());
        let outcome = orchestrator
            .run("SELECT o.amt FROM orders o", "total amount", &kb())
            .await;
        assert!(outcome.report.all_valid);
        assert_eq!(fixer.call_count(), 3);
    }

    #[tokio::test]
    async fn malformed_response_ends_the_loop() {
        let fixer = Arc::new(ScriptedFixer::new(vec![Err(FixerError::Malformed(
            "not json".to_string(),
        ))]));
        let orchestrator = CorrectionOrchestrator::new(&fast_config(), fixer.clone());
        let outcome = orchestrator
            .run("SELECT o.amt FROM orders o", "total amount", &kb())
            .await;
        assert!(!outcome.report.all_valid);
        assert_eq!(outcome.final_sql, "SELECT o.amt FROM orders o");
        assert_eq!(fixer.call_count(), 1);
    }

    #[tokio::test]
    async fn rounds_are_bounded() {
        // Every fix still references a bad column, so every round fails.
        let fixer = Arc::new(ScriptedFixer::new(vec![
            fixed("SELECT o.still_bad FROM orders o", "try 1"),
            fixed("SELECT o.still_bad2 FROM orders o", "try 2"),
            fixed("SELECT o.still_bad3 FROM orders o", "try 3"),
        ]));
        let orchestrator = CorrectionOrchestrator::new(&fast_config(), fixer.clone());
        let outcome = orchestrator
            .run("SELECT o.amt FROM orders o", "total amount", &kb())
            .await;
        assert!(!outcome.report.all_valid);
        assert_eq!(fixer.call_count(), 2);
        assert_eq!(outcome.final_sql, "SELECT o.still_bad2 FROM orders o");
    }

    #[tokio::test]
    async fn time_predicates_survive_the_rewrite() {
        // The scripted fix drops the user's date filter; restore puts it back.
        let fixer = Arc::new(ScriptedFixer::new(vec![fixed(
            "SELECT o.amount FROM orders o",
            "fixed column, lost the filter",
        )]));
        let orchestrator = CorrectionOrchestrator::new(&fast_config(), fixer);
        let outcome = orchestrator
            .run(
                "SELECT o.amt FROM orders o WHERE o.order_date >= '2024-01-01'",
                "amount this year",
                &kb(),
            )
            .await;
        assert!(outcome
            .final_sql
            .contains("o.order_date >= '2024-01-01'"));
        assert!(outcome.report.all_valid, "{}", outcome.report.summary());
    }
}
