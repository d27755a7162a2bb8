//! Test doubles shared across module tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::alerts::dispatcher::{NotificationSink, SinkError};
use crate::connector::{Connector, ConnectorError, Credentials};
use crate::model::{
    AlertEvent, AlertRule, CompareOp, ConnectionTarget, DatabaseType, Predicate, QueryOutput,
    ScalarValue, TransitionKind,
};

/// Connector that replays queued results in order
pub struct ScriptedConnector {
    database_type: DatabaseType,
    script: Mutex<VecDeque<Result<QueryOutput, ConnectorError>>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn push_value(&self, value: ScalarValue) {
        self.script.lock().push_back(Ok(QueryOutput::Scalar(value)));
    }

    pub fn push_output(&self, output: QueryOutput) {
        self.script.lock().push_back(Ok(output));
    }

    pub fn push_error(&self, error: ConnectorError) {
        self.script.lock().push_back(Err(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `execute` calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn execute(
        &self,
        _target: &ConnectionTarget,
        _credentials: Option<&Credentials>,
        _query: &str,
    ) -> Result<QueryOutput, ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next.unwrap_or_else(|| Err(ConnectorError::unreachable("script exhausted")))
    }
}

/// Sink that records delivered events, optionally failing first
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AlertEvent>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` deliveries
    pub fn failing(n: usize) -> Self {
        let sink = Self::new();
        sink.failures_left.store(n, Ordering::SeqCst);
        sink
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: TransitionKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SinkError::Unavailable("scripted failure".to_string()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Enabled ClickHouse rule with a `> 10` predicate
pub fn rule(id: &str, owner: &str) -> AlertRule {
    AlertRule::new(
        id,
        owner,
        ConnectionTarget::new(DatabaseType::ClickHouse, "ch-1", 8123, "metrics"),
        "SELECT count() FROM errors",
        Predicate::new(CompareOp::GreaterThan, 10.0),
    )
    .with_interval_secs(1)
}
