//! Core data model shared by every component

pub mod alert;
pub mod database;
pub mod role;
pub mod rule;
pub mod value;

pub use alert::{Alert, AlertEvent, AlertStatus, TransitionKind, TransitionRecord};
pub use database::{DatabaseType, QueryLanguage, SqlDialect, UnknownDatabaseType};
pub use role::{Identity, InvalidRole, UserRole};
pub use rule::{
    check_read_only, validate_query, AlertRule, CompareOp, ConnectionTarget, PoolKey, Predicate, RuleId, Severity,
    ValidationError,
};
pub use value::{QueryOutput, ScalarValue};
