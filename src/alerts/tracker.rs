//! Per-rule alert state machine and deduplication
//!
//! Each rule is in one of three phases: no alert yet, an OPEN alert, or its
//! last alert CLEARED. Repeated true evaluations collapse into the open alert;
//! only edges produce events. The DashMap entry for a rule is held for the
//! whole read-modify-write, which is what keeps at most one OPEN alert per rule.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::evaluator::{EvaluationError, EvaluationResult};
use crate::access::{AccessDenied, AccessGuard, Action, Resource};
use crate::model::{
    Alert, AlertEvent, AlertRule, AlertStatus, Identity, RuleId, TransitionKind, TransitionRecord,
};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertPhase {
    None,
    Open,
    Cleared,
}

#[derive(Debug, Clone, Default)]
struct RuleAlertState {
    owner: String,
    /// Latest alert for the rule, open or cleared
    current: Option<Alert>,
    history: VecDeque<TransitionRecord>,
    last_evaluated_at: Option<DateTime<Utc>>,
    last_value: Option<f64>,
    last_duration_ms: u64,
    total_evaluations: u64,
    last_error: Option<EvaluationError>,
    last_error_at: Option<DateTime<Utc>>,
    consecutive_errors: u64,
    total_errors: u64,
}

impl RuleAlertState {
    fn phase(&self) -> AlertPhase {
        match &self.current {
            None => AlertPhase::None,
            Some(alert) if alert.is_open() => AlertPhase::Open,
            Some(_) => AlertPhase::Cleared,
        }
    }

    fn record(&mut self, record: TransitionRecord, limit: usize) {
        if self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

/// Connector diagnostics, shown to admins only
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationErrorSummary {
    pub last_error: Option<EvaluationError>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatusView {
    pub rule_id: RuleId,
    pub phase: AlertPhase,
    pub alert: Option<Alert>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_value: Option<f64>,
    pub last_duration_ms: u64,
    pub total_evaluations: u64,
    pub history: Vec<TransitionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<EvaluationErrorSummary>,
}

/// Sole writer of alert state
pub struct AlertStateTracker {
    states: DashMap<RuleId, RuleAlertState>,
    guard: AccessGuard,
    history_limit: usize,
}

impl AlertStateTracker {
    pub fn new(history_limit: usize) -> Self {
        Self {
            states: DashMap::new(),
            guard: AccessGuard::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Apply an evaluation result. Returns the transition to dispatch, if any.
    ///
    /// Evaluation errors are recorded but never move the state machine.
    pub fn apply(&self, rule: &AlertRule, result: &EvaluationResult) -> Option<AlertEvent> {
        let mut entry = self.states.entry(rule.id.clone()).or_default();
        let state = entry.value_mut();

        state.owner = rule.owner.clone();
        state.total_evaluations += 1;
        state.last_evaluated_at = Some(result.timestamp);
        state.last_duration_ms = result.duration_ms;

        if let Some(error) = &result.evaluation_error {
            state.last_error = Some(error.clone());
            state.last_error_at = Some(result.timestamp);
            state.consecutive_errors += 1;
            state.total_errors += 1;
            return None;
        }
        state.consecutive_errors = 0;
        state.last_value = result.observed_value;

        let at = result.timestamp;
        match (state.phase(), result.predicate_met) {
            (AlertPhase::None | AlertPhase::Cleared, true) => {
                let alert = Alert::open(&rule.id, rule.severity, at, result.observed_value);
                state.record(
                    TransitionRecord {
                        alert_id: alert.id.clone(),
                        kind: TransitionKind::Fired,
                        at,
                        observed_value: result.observed_value,
                    },
                    self.history_limit,
                );
                state.current = Some(alert.clone());

                tracing::info!(
                    rule_id = %rule.id,
                    alert_id = %alert.id,
                    severity = %rule.severity,
                    value = ?result.observed_value,
                    "Alert fired"
                );
                Some(event(rule, alert, TransitionKind::Fired))
            }
            (AlertPhase::Open, true) => {
                if let Some(alert) = state.current.as_mut() {
                    alert.last_seen_at = at;
                    alert.last_value = result.observed_value;
                }
                None
            }
            (AlertPhase::Open, false) => {
                let alert = state.current.as_mut().map(|alert| {
                    alert.state = AlertStatus::Cleared;
                    alert.cleared_at = Some(at);
                    alert.clone()
                })?;
                state.record(
                    TransitionRecord {
                        alert_id: alert.id.clone(),
                        kind: TransitionKind::Cleared,
                        at,
                        observed_value: result.observed_value,
                    },
                    self.history_limit,
                );

                tracing::info!(rule_id = %rule.id, alert_id = %alert.id, "Alert cleared");
                Some(event(rule, alert, TransitionKind::Cleared))
            }
            (AlertPhase::None | AlertPhase::Cleared, false) => None,
        }
    }

    /// Drop all state for a deleted rule, clearing its open alert if any
    pub fn retire(&self, rule: &AlertRule) -> Option<AlertEvent> {
        let (_, state) = self.states.remove(&rule.id)?;
        let mut alert = state.current.filter(Alert::is_open)?;
        alert.state = AlertStatus::Cleared;
        alert.cleared_at = Some(Utc::now());

        tracing::info!(rule_id = %rule.id, alert_id = %alert.id, "Alert cleared by rule deletion");
        Some(event(rule, alert, TransitionKind::Cleared))
    }

    /// Open alert for a rule, bypassing access control
    #[cfg(test)]
    pub(crate) fn open_alert(&self, rule_id: &str) -> Option<Alert> {
        self.states
            .get(rule_id)
            .and_then(|s| s.current.clone())
            .filter(Alert::is_open)
    }

    pub fn open_alert_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| s.phase() == AlertPhase::Open)
            .count()
    }

    /// Latest alert per rule visible to the caller, newest first.
    ///
    /// Same scoping as rule listing: without a filter users see their own,
    /// and naming another owner is denied.
    pub fn list_alerts(
        &self,
        identity: &Identity,
        owner_filter: Option<&str>,
        status: Option<AlertStatus>,
    ) -> Result<Vec<Alert>, AccessDenied> {
        let owner = match owner_filter {
            Some(owner) => {
                self.guard
                    .require(identity, Action::ReadAlert, Resource::owned_by(owner))?;
                Some(owner)
            }
            None if self.guard.has_any_scope(identity, Action::ReadAlert) => None,
            None => {
                self.guard
                    .require(identity, Action::ReadAlert, Resource::owned_by(&identity.id))?;
                Some(identity.id.as_str())
            }
        };

        let mut alerts: Vec<Alert> = self
            .states
            .iter()
            .filter(|s| owner.map(|o| s.owner == o).unwrap_or(true))
            .filter_map(|s| s.current.clone())
            .filter(|a| status.map(|st| a.state == st).unwrap_or(true))
            .collect();
        alerts.sort_by(|a, b| b.first_fired_at.cmp(&a.first_fired_at));
        Ok(alerts)
    }

    /// Alert state and history for one rule owned by `owner`.
    /// Evaluation error details are included only for callers allowed to see them.
    pub fn rule_status(
        &self,
        identity: &Identity,
        rule_id: &str,
        owner: &str,
    ) -> Result<RuleStatusView, AccessDenied> {
        self.guard
            .require(identity, Action::ReadAlert, Resource::owned_by(owner))?;
        let show_errors =
            self.guard
                .authorize(identity, Action::ReadEvaluationErrors, Resource::owned_by(owner));

        let state = self
            .states
            .get(rule_id)
            .map(|s| s.value().clone())
            .unwrap_or_default();

        Ok(RuleStatusView {
            rule_id: rule_id.to_string(),
            phase: state.phase(),
            last_evaluated_at: state.last_evaluated_at,
            last_value: state.last_value,
            last_duration_ms: state.last_duration_ms,
            total_evaluations: state.total_evaluations,
            history: state.history.iter().cloned().collect(),
            errors: show_errors.then(|| EvaluationErrorSummary {
                last_error: state.last_error.clone(),
                last_error_at: state.last_error_at,
                consecutive_errors: state.consecutive_errors,
                total_errors: state.total_errors,
            }),
            alert: state.current,
        })
    }
}

impl Default for AlertStateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

fn event(rule: &AlertRule, alert: Alert, kind: TransitionKind) -> AlertEvent {
    AlertEvent {
        alert,
        kind,
        rule_name: rule.name.clone(),
        condition: rule.predicate.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorError;
    use crate::testing::rule;
    use std::sync::Arc;

    fn result(rule: &AlertRule, value: f64) -> EvaluationResult {
        EvaluationResult {
            rule_id: rule.id.clone(),
            revision: rule.revision,
            timestamp: Utc::now(),
            observed_value: Some(value),
            predicate_met: rule.predicate.matches(value),
            evaluation_error: None,
            duration_ms: 3,
        }
    }

    fn failed(rule: &AlertRule, error: ConnectorError) -> EvaluationResult {
        EvaluationResult {
            rule_id: rule.id.clone(),
            revision: rule.revision,
            timestamp: Utc::now(),
            observed_value: None,
            predicate_met: false,
            evaluation_error: Some(EvaluationError::Connector(error)),
            duration_ms: 3,
        }
    }

    #[test]
    fn test_repeated_true_fires_once() {
        let tracker = AlertStateTracker::default();
        let rule = rule("r1", "alice");

        let events: Vec<_> = (0..3)
            .filter_map(|_| tracker.apply(&rule, &result(&rule, 50.0)))
            .collect();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TransitionKind::Fired);
        assert_eq!(tracker.open_alert_count(), 1);
    }

    #[test]
    fn test_refire_gets_new_alert_id() {
        let tracker = AlertStateTracker::default();
        let rule = rule("r1", "alice");

        let fired = tracker.apply(&rule, &result(&rule, 50.0)).unwrap();
        let cleared = tracker.apply(&rule, &result(&rule, 1.0)).unwrap();
        let refired = tracker.apply(&rule, &result(&rule, 60.0)).unwrap();

        assert_eq!(fired.kind, TransitionKind::Fired);
        assert_eq!(cleared.kind, TransitionKind::Cleared);
        assert_eq!(cleared.alert.id, fired.alert.id);
        assert!(cleared.alert.cleared_at.is_some());
        assert_eq!(refired.kind, TransitionKind::Fired);
        assert_ne!(refired.alert.id, fired.alert.id);
    }

    #[test]
    fn test_false_without_alert_is_noop() {
        let tracker = AlertStateTracker::default();
        let rule = rule("r1", "alice");

        assert!(tracker.apply(&rule, &result(&rule, 1.0)).is_none());
        assert!(tracker.apply(&rule, &result(&rule, 1.0)).is_none());
        assert_eq!(tracker.open_alert_count(), 0);
    }

    #[test]
    fn test_open_alert_tracks_last_seen() {
        let tracker = AlertStateTracker::default();
        let rule = rule("r1", "alice");

        tracker.apply(&rule, &result(&rule, 50.0));
        let first = tracker.open_alert("r1").unwrap();
        tracker.apply(&rule, &result(&rule, 70.0));
        let second = tracker.open_alert("r1").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.last_value, Some(70.0));
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[test]
    fn test_error_keeps_open_alert() {
        let tracker = AlertStateTracker::default();
        let rule = rule("r1", "alice");

        tracker.apply(&rule, &result(&rule, 50.0));
        let event = tracker.apply(&rule, &failed(&rule, ConnectorError::timeout("slow")));

        assert!(event.is_none());
        assert!(tracker.open_alert("r1").is_some());

        let status = tracker
            .rule_status(&Identity::admin("root"), "r1", "alice")
            .unwrap();
        let errors = status.errors.unwrap();
        assert_eq!(errors.consecutive_errors, 1);
        assert_eq!(errors.total_errors, 1);
    }

    #[test]
    fn test_error_does_not_fire() {
        let tracker = AlertStateTracker::default();
        let rule = rule("r1", "alice");

        let event = tracker.apply(&rule, &failed(&rule, ConnectorError::unreachable("down")));
        assert!(event.is_none());
        assert_eq!(tracker.open_alert_count(), 0);
    }

    #[test]
    fn test_history_bounded() {
        let tracker = AlertStateTracker::new(3);
        let rule = rule("r1", "alice");

        for i in 0..10 {
            let value = if i % 2 == 0 { 50.0 } else { 1.0 };
            tracker.apply(&rule, &result(&rule, value));
        }

        let status = tracker
            .rule_status(&Identity::user("alice"), "r1", "alice")
            .unwrap();
        assert_eq!(status.history.len(), 3);
        assert_eq!(status.history.last().unwrap().kind, TransitionKind::Cleared);
    }

    #[test]
    fn test_retire_clears_open_alert() {
        let tracker = AlertStateTracker::default();
        let rule = rule("r1", "alice");

        tracker.apply(&rule, &result(&rule, 50.0));
        let event = tracker.retire(&rule).unwrap();
        assert_eq!(event.kind, TransitionKind::Cleared);
        assert_eq!(tracker.open_alert_count(), 0);
        assert!(tracker.retire(&rule).is_none());
    }

    #[test]
    fn test_user_view_hides_errors() {
        let tracker = AlertStateTracker::default();
        let rule = rule("r1", "alice");
        tracker.apply(&rule, &failed(&rule, ConnectorError::auth("denied")));

        let status = tracker
            .rule_status(&Identity::user("alice"), "r1", "alice")
            .unwrap();
        assert!(status.errors.is_none());
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("errors").is_none());

        assert!(tracker
            .rule_status(&Identity::user("bob"), "r1", "alice")
            .is_err());
    }

    #[test]
    fn test_list_alerts_scoping() {
        let tracker = AlertStateTracker::default();
        let alices = rule("a1", "alice");
        let bobs = rule("b1", "bob");
        tracker.apply(&alices, &result(&alices, 50.0));
        tracker.apply(&bobs, &result(&bobs, 50.0));

        let alice = Identity::user("alice");
        let own = tracker.list_alerts(&alice, None, None).unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].rule_id, "a1");
        assert!(tracker.list_alerts(&alice, Some("bob"), None).is_err());

        let root = Identity::admin("root");
        assert_eq!(tracker.list_alerts(&root, None, None).unwrap().len(), 2);
        assert_eq!(
            tracker
                .list_alerts(&root, None, Some(AlertStatus::Cleared))
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn test_concurrent_rules_one_open_each() {
        let tracker = Arc::new(AlertStateTracker::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let rule = rule(&format!("r{}", (t + i) % 4), "alice");
                        tracker.apply(&rule, &result(&rule, 50.0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.open_alert_count(), 4);
        let root = Identity::admin("root");
        let open = tracker
            .list_alerts(&root, None, Some(AlertStatus::Open))
            .unwrap();
        assert_eq!(open.len(), 4);
    }
}
