//! Wires the rule store, connectors, scheduler, tracker and dispatcher together

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::alerts::{
    AlertStateTracker, DispatchStatsSnapshot, Dispatcher, Evaluator, NotificationSink,
    RuleStatusView, Scheduler, SchedulerStatsSnapshot,
};
use crate::access::AccessDenied;
use crate::config::EngineConfig;
use crate::connector::{ConnectorRegistry, SecretResolver};
use crate::model::{Alert, AlertRule, AlertStatus, Identity};
use crate::rules::{RuleStore, RuleStoreError};

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub rules: usize,
    pub open_alerts: usize,
    pub uptime_secs: u64,
    pub scheduler: SchedulerStatsSnapshot,
    pub dispatch: DispatchStatsSnapshot,
    pub sinks: Vec<String>,
}

/// The alert engine. Every rule and alert entry point is access-guarded.
pub struct AlertEngine {
    store: Arc<RuleStore>,
    tracker: Arc<AlertStateTracker>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    started_at: Instant,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AlertEngine {
    pub fn new(
        config: EngineConfig,
        secrets: Arc<dyn SecretResolver>,
        sinks: Vec<Arc<dyn NotificationSink>>,
    ) -> Self {
        let registry = ConnectorRegistry::new(config.pool.clone(), secrets);
        Self::with_registry(config, registry, sinks)
    }

    /// Build around a prepared registry (custom connectors)
    pub fn with_registry(
        config: EngineConfig,
        registry: ConnectorRegistry,
        sinks: Vec<Arc<dyn NotificationSink>>,
    ) -> Self {
        let store = Arc::new(RuleStore::new());
        let tracker = Arc::new(AlertStateTracker::new(config.history_limit));
        let dispatcher = Arc::new(Dispatcher::new(
            sinks,
            config.retry.clone(),
            config.dispatch_queue_capacity,
        ));
        let evaluator = Arc::new(Evaluator::new(Arc::new(registry), config.connector_timeout));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            evaluator,
            Arc::clone(&tracker),
            Arc::clone(&dispatcher),
            config.scheduler.clone(),
        ));

        Self {
            store,
            tracker,
            dispatcher,
            scheduler,
            started_at: Instant::now(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the dispatcher and scheduler background tasks
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            tracing::warn!("Alert engine already started");
            return;
        }
        handles.push(Arc::clone(&self.dispatcher).start());
        handles.push(Arc::clone(&self.scheduler).start());
        tracing::info!(rules = self.store.len(), "Alert engine started");
    }

    /// Stop scheduling and notification delivery
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.dispatcher.stop().await;
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            join_task(handle).await;
        }
        tracing::info!("Alert engine stopped");
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<AlertStateTracker> {
        &self.tracker
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // ========================================================================
    // Rules
    // ========================================================================

    pub fn get_rule(&self, identity: &Identity, id: &str) -> Result<AlertRule, RuleStoreError> {
        self.store.get(identity, id)
    }

    pub fn list_rules(
        &self,
        identity: &Identity,
        owner: Option<&str>,
    ) -> Result<Vec<AlertRule>, RuleStoreError> {
        self.store.list(identity, owner)
    }

    pub fn create_rule(&self, identity: &Identity, rule: AlertRule) -> Result<AlertRule, RuleStoreError> {
        self.store.create(identity, rule)
    }

    pub fn update_rule(&self, identity: &Identity, rule: AlertRule) -> Result<AlertRule, RuleStoreError> {
        self.store.update(identity, rule)
    }

    pub fn set_rule_enabled(
        &self,
        identity: &Identity,
        id: &str,
        enabled: bool,
    ) -> Result<AlertRule, RuleStoreError> {
        self.store.set_enabled(identity, id, enabled)
    }

    /// Delete a rule. An open alert for it is cleared and the clear dispatched.
    pub fn delete_rule(&self, identity: &Identity, id: &str) -> Result<AlertRule, RuleStoreError> {
        let removed = self.store.delete(identity, id)?;
        if let Some(event) = self.tracker.retire(&removed) {
            self.dispatcher.notify(event);
        }
        Ok(removed)
    }

    pub fn load_rules_file(
        &self,
        identity: &Identity,
        path: impl AsRef<Path>,
    ) -> Result<usize, RuleStoreError> {
        self.store.load_file(identity, path)
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    pub fn list_alerts(
        &self,
        identity: &Identity,
        owner: Option<&str>,
        status: Option<AlertStatus>,
    ) -> Result<Vec<Alert>, AccessDenied> {
        self.tracker.list_alerts(identity, owner, status)
    }

    pub fn rule_status(&self, identity: &Identity, rule_id: &str) -> Result<RuleStatusView, RuleStoreError> {
        let owner = self
            .store
            .owner_of(rule_id)
            .ok_or_else(|| RuleStoreError::NotFound(rule_id.to_string()))?;
        Ok(self.tracker.rule_status(identity, rule_id, &owner)?)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            rules: self.store.len(),
            open_alerts: self.tracker.open_alert_count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            scheduler: self.scheduler.stats(),
            dispatch: self.dispatcher.stats(),
            sinks: self.dispatcher.sink_names(),
        }
    }
}

/// Wait for a background task. Returns false if it panicked or was cancelled.
async fn join_task(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, panicked = e.is_panic(), "Alert engine task terminated abnormally");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, PoolSettings, StaticSecretResolver};
    use crate::model::{DatabaseType, ScalarValue, TransitionKind};
    use crate::testing::{rule, RecordingSink, ScriptedConnector};
    use std::time::Duration;

    fn engine() -> (AlertEngine, Arc<ScriptedConnector>, Arc<RecordingSink>) {
        let connector = Arc::new(ScriptedConnector::new(DatabaseType::ClickHouse));
        let registry =
            ConnectorRegistry::new(PoolSettings::default(), Arc::new(StaticSecretResolver::new()))
                .with_connector(Arc::clone(&connector) as Arc<dyn Connector>);
        let sink = Arc::new(RecordingSink::new());
        let engine = AlertEngine::with_registry(
            EngineConfig::default(),
            registry,
            vec![Arc::clone(&sink) as Arc<dyn NotificationSink>],
        );
        (engine, connector, sink)
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_delete_clears_open_alert() {
        let (engine, connector, sink) = engine();
        let alice = Identity::user("alice");
        engine.create_rule(&alice, rule("r1", "alice")).unwrap();
        connector.push_value(ScalarValue::Int(99));

        for handle in engine.scheduler().tick(tokio::time::Instant::now()) {
            handle.await.unwrap();
        }
        assert_eq!(engine.stats().open_alerts, 1);

        // Queued fire event is delivered once the dispatcher runs
        engine.start();

        engine.delete_rule(&alice, "r1").unwrap();
        wait_for(|| sink.events().len() == 2).await;

        assert_eq!(sink.count(TransitionKind::Fired), 1);
        assert_eq!(sink.count(TransitionKind::Cleared), 1);
        assert_eq!(engine.stats().open_alerts, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_rule_status_access() {
        let (engine, connector, _sink) = engine();
        let root = Identity::admin("root");
        engine.create_rule(&root, rule("r1", "alice")).unwrap();
        connector.push_error(crate::connector::ConnectorError::auth("password rejected"));

        for handle in engine.scheduler().tick(tokio::time::Instant::now()) {
            handle.await.unwrap();
        }

        let admin_view = engine.rule_status(&root, "r1").unwrap();
        assert_eq!(admin_view.errors.unwrap().total_errors, 1);

        let owner_view = engine.rule_status(&Identity::user("alice"), "r1").unwrap();
        assert!(owner_view.errors.is_none());

        assert!(matches!(
            engine.rule_status(&Identity::user("mallory"), "r1"),
            Err(RuleStoreError::AccessDenied(_))
        ));
        assert!(matches!(
            engine.rule_status(&root, "missing"),
            Err(RuleStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_join_task_reports_panic() {
        assert!(join_task(tokio::spawn(async {})).await);
        assert!(!join_task(tokio::spawn(async { panic!("scheduler loop died") })).await);
    }

    #[test]
    fn test_user_cannot_delete_others_rule() {
        let (engine, _connector, _sink) = engine();
        engine.create_rule(&Identity::admin("root"), rule("r1", "bob")).unwrap();

        assert!(matches!(
            engine.delete_rule(&Identity::user("alice"), "r1"),
            Err(RuleStoreError::AccessDenied(_))
        ));
        tokio_test::assert_ok!(engine.delete_rule(&Identity::admin("root"), "r1"));
    }
}
