//! Rule evaluation: run the query, coerce the result, apply the predicate

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connector::{ConnectorError, ConnectorRegistry};
use crate::model::{AlertRule, Predicate, QueryOutput, RuleId};

/// Outcome of one evaluation. Consumed by the tracker, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub rule_id: RuleId,
    /// Rule revision the evaluation ran against
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
    pub observed_value: Option<f64>,
    pub predicate_met: bool,
    pub evaluation_error: Option<EvaluationError>,
    pub duration_ms: u64,
}

impl EvaluationResult {
    pub fn is_error(&self) -> bool {
        self.evaluation_error.is_some()
    }
}

/// Why an evaluation produced no usable value
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EvaluationError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("Unsupported result type: {0}")]
    UnsupportedResultType(String),

    #[error("Query returned no rows")]
    EmptyResult,

    #[error("Result has no column named {0}")]
    ColumnNotFound(String),
}

/// Share of the rule interval a single query may use
const INTERVAL_TIMEOUT_SHARE: f64 = 0.9;

/// Executes rules through the connector registry
pub struct Evaluator {
    registry: Arc<ConnectorRegistry>,
    connector_timeout: Duration,
}

impl Evaluator {
    pub fn new(registry: Arc<ConnectorRegistry>, connector_timeout: Duration) -> Self {
        Self {
            registry,
            connector_timeout,
        }
    }

    /// Hard timeout for one query: the configured timeout, capped below the interval
    pub fn timeout_for(&self, rule: &AlertRule) -> Duration {
        let cap = rule.interval().mul_f64(INTERVAL_TIMEOUT_SHARE);
        self.connector_timeout.min(cap).max(Duration::from_millis(1))
    }

    pub async fn evaluate(&self, rule: &AlertRule) -> EvaluationResult {
        let started = Instant::now();
        let timeout = self.timeout_for(rule);

        let outcome = match self.registry.execute(&rule.target, &rule.query, timeout).await {
            Ok(output) => observe(&rule.predicate, &output),
            Err(e) => {
                tracing::warn!(
                    rule_id = %rule.id,
                    target = %rule.target.pool_key(),
                    kind = %e.kind,
                    error = %e.message,
                    "Connector error during evaluation"
                );
                Err(EvaluationError::Connector(e))
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok((value, met)) => {
                tracing::debug!(rule_id = %rule.id, value, met, duration_ms, "Rule evaluated");
                EvaluationResult {
                    rule_id: rule.id.clone(),
                    revision: rule.revision,
                    timestamp: Utc::now(),
                    observed_value: Some(value),
                    predicate_met: met,
                    evaluation_error: None,
                    duration_ms,
                }
            }
            Err(error) => EvaluationResult {
                rule_id: rule.id.clone(),
                revision: rule.revision,
                timestamp: Utc::now(),
                observed_value: None,
                predicate_met: false,
                evaluation_error: Some(error),
                duration_ms,
            },
        }
    }
}

/// Pick the compared value out of a query result and apply the predicate
pub fn observe(predicate: &Predicate, output: &QueryOutput) -> Result<(f64, bool), EvaluationError> {
    if output.is_empty() {
        return Err(EvaluationError::EmptyResult);
    }

    let value = output
        .value(predicate.column.as_deref())
        .ok_or_else(|| EvaluationError::ColumnNotFound(predicate.column.clone().unwrap_or_default()))?;

    let numeric = value
        .as_f64()
        .ok_or_else(|| EvaluationError::UnsupportedResultType(value.type_name().to_string()))?;

    Ok((numeric, predicate.matches(numeric)))
}
