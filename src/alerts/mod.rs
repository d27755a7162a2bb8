//! Alert evaluation pipeline
//!
//! Scheduler → Evaluator → Alert State Tracker → Dispatcher. The scheduler
//! decides when a rule runs, the evaluator turns a query result into a
//! predicate outcome, the tracker turns outcomes into fire/clear transitions,
//! and the dispatcher delivers transitions to notification sinks.

pub mod dispatcher;
pub mod evaluator;
pub mod scheduler;
pub mod tracker;

pub use dispatcher::{
    DispatchStatsSnapshot, Dispatcher, LogSink, NotificationSink, RetryPolicy, SinkError,
    WebhookSink,
};
pub use evaluator::{EvaluationError, EvaluationResult, Evaluator};
pub use scheduler::{ScheduleTable, Scheduler, SchedulerConfig, SchedulerStatsSnapshot};
pub use tracker::{AlertPhase, AlertStateTracker, EvaluationErrorSummary, RuleStatusView};
