//! End-to-end correction flow.
//!
//! Exercises the public API the way an assistant backend would: load a
//! knowledge base from JSON, validate drafts, and run the fix-and-revalidate
//! loop with a scripted collaborator.

use async_trait::async_trait;
use sql_sentinel::fixer::{FixRequest, FixedSql};
use sql_sentinel::{
    CorrectionOrchestrator, FixerError, IssueKind, SchemaKnowledgeBase, SentinelConfig,
    SharedKnowledgeBase, SqlFixer, ValidationPipeline,
};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

const TABLES_JSON: &str = r#"{
    "sales_orders": {
        "columns": ["order_id", "customer_id", "amount", "order_date"],
        "relationships": [
            {"description": "sales_orders.customer_id == customers.customer_id"}
        ]
    },
    "customers": {
        "columns": ["customer_id", "name", "region", "signup_date"]
    },
    "库存快照": {
        "columns": ["产品编号", "数量"]
    }
}"#;

fn knowledge_base() -> SchemaKnowledgeBase {
    SchemaKnowledgeBase::load(TABLES_JSON, None).unwrap()
}

struct ScriptedFixer {
    responses: Mutex<Vec<Result<FixedSql, FixerError>>>,
}

impl ScriptedFixer {
    fn new(responses: Vec<Result<FixedSql, FixerError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
        }
    }
}

#[async_trait]
impl SqlFixer for ScriptedFixer {
    async fn fix(&self, _request: &FixRequest) -> Result<FixedSql, FixerError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Err(FixerError::Malformed("script exhausted".to_string()))
        } else {
            responses.remove(0)
        }
    }
}

fn fast_config() -> SentinelConfig {
    let mut config = SentinelConfig::new();
    config.retry.initial_backoff = Duration::from_millis(1);
    config.retry.jitter = false;
    config
}

#[test]
fn valid_join_passes_all_checks() {
    init_tracing();
    let pipeline = ValidationPipeline::default();
    let report = pipeline.validate(
        "SELECT c.name, o.amount FROM sales_orders o \
         JOIN customers c ON o.customer_id = c.customer_id \
         WHERE o.order_date >= '2024-01-01'",
        &knowledge_base(),
    );
    assert!(report.all_valid, "{}", report.summary());
    assert!(report.valid_fields.contains(&"customers.name".to_string()));
    assert!(report
        .valid_fields
        .contains(&"sales_orders.amount".to_string()));
}

#[test]
fn undeclared_join_and_bad_column_are_both_reported() {
    let pipeline = ValidationPipeline::default();
    let report = pipeline.validate(
        "SELECT c.nmae FROM sales_orders o JOIN customers c ON o.order_id = c.customer_id",
        &knowledge_base(),
    );
    assert!(!report.all_valid);
    assert_eq!(report.missing_fields, vec!["customers.nmae".to_string()]);
    assert_eq!(report.relationship_issues.len(), 1);
    assert!(report.hints.iter().any(|h| h.contains("customers.name")));
}

#[test]
fn time_filter_on_dateless_table_is_flagged() {
    // 库存快照 has no time-dimension column, so a date filter on it cannot
    // mean what the user thinks it means.
    let pipeline = ValidationPipeline::default();
    let report = pipeline.validate(
        "SELECT s.[数量] FROM [库存快照] s WHERE YEAR(s.[产品编号]) = 2024",
        &knowledge_base(),
    );
    assert!(report
        .time_issues
        .iter()
        .any(|i| i.kind == IssueKind::TimeDimensionViolation));
}

#[test]
fn bracketed_cjk_identifiers_resolve() {
    let pipeline = ValidationPipeline::default();
    let report = pipeline.validate(
        "SELECT s.[产品编号], s.[数量] FROM [库存快照] s",
        &knowledge_base(),
    );
    assert!(report.all_valid, "{}", report.summary());
}

#[tokio::test]
async fn correction_loop_repairs_a_bad_draft() {
    init_tracing();
    let fixer = Arc::new(ScriptedFixer::new(vec![Ok(FixedSql {
        sql: "SELECT o.amount FROM sales_orders o".to_string(),
        explanation: "replaced 'total' with the real column 'amount'".to_string(),
    })]));
    let orchestrator = CorrectionOrchestrator::new(&fast_config(), fixer);

    let outcome = orchestrator
        .run(
            "SELECT o.total FROM sales_orders o WHERE o.order_date >= '2024-06-01'",
            "sales since June",
            &knowledge_base(),
        )
        .await;

    assert!(outcome.report.all_valid, "{}", outcome.report.summary());
    // The scripted fix dropped the date filter; the guard restores it verbatim.
    assert!(outcome.final_sql.contains("o.order_date >= '2024-06-01'"));
    assert_eq!(
        outcome.explanation_trail(),
        vec!["replaced 'total' with the real column 'amount'"]
    );
}

#[tokio::test]
async fn correction_loop_gives_up_after_bounded_rounds() {
    init_tracing();
    let fixer = Arc::new(ScriptedFixer::new(vec![
        Ok(FixedSql {
            sql: "SELECT o.nope FROM sales_orders o".to_string(),
            explanation: "first try".to_string(),
        }),
        Ok(FixedSql {
            sql: "SELECT o.still_nope FROM sales_orders o".to_string(),
            explanation: "second try".to_string(),
        }),
    ]));
    let orchestrator = CorrectionOrchestrator::new(&fast_config(), fixer);

    let outcome = orchestrator
        .run("SELECT o.total FROM sales_orders o", "sales", &knowledge_base())
        .await;

    assert!(!outcome.report.all_valid);
    assert_eq!(outcome.explanation_trail(), vec!["first try", "second try"]);
    assert_eq!(
        outcome.report.missing_fields,
        vec!["sales_orders.still_nope".to_string()]
    );
}

#[test]
fn shared_knowledge_base_reload_swaps_the_snapshot() {
    let shared = SharedKnowledgeBase::new(knowledge_base());
    let before = shared.snapshot();
    assert!(before.lookup("sales_orders").is_some());
    assert!(before.lookup("refunds").is_none());

    let updated = SchemaKnowledgeBase::load(
        r#"{"refunds": {"columns": ["refund_id", "refund_date"]}}"#,
        None,
    )
    .unwrap();
    shared.reload(updated);

    // Old snapshot is unchanged; new snapshots see the new schema.
    assert!(before.lookup("refunds").is_none());
    assert!(shared.snapshot().lookup("refunds").is_some());
}
