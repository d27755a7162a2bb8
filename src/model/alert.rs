use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::rule::{RuleId, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Open,
    Cleared,
}

/// One firing episode of a rule, from first fire to clear
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: RuleId,
    pub state: AlertStatus,
    pub first_fired_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub severity: Severity,
    /// Value that last satisfied the predicate
    pub last_value: Option<f64>,
}

impl Alert {
    pub fn open(rule_id: impl Into<String>, severity: Severity, at: DateTime<Utc>, value: Option<f64>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule_id.into(),
            state: AlertStatus::Open,
            first_fired_at: at,
            last_seen_at: at,
            cleared_at: None,
            severity,
            last_value: value,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == AlertStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Fired,
    Cleared,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::Fired => write!(f, "fired"),
            TransitionKind::Cleared => write!(f, "cleared"),
        }
    }
}

/// Notification payload handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert: Alert,
    pub kind: TransitionKind,
    pub rule_name: String,
    /// Human-readable description of the predicate, e.g. `value > 10`
    pub condition: String,
}

/// Entry in a rule's transition history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub alert_id: String,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
    pub observed_value: Option<f64>,
}
