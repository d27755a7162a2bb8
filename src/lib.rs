//! Beacon: Multi-Backend Alert Rule Evaluation Engine
//!
//! Evaluates owner-scoped alert rules against ClickHouse, Elasticsearch,
//! MongoDB, PostgreSQL and MySQL on a fixed schedule, tracks per-rule alert
//! state and delivers FIRED / CLEARED transitions to notification sinks.
//!
//! # Features
//!
//! - **Role-Based Access**: ADMIN sees every rule, USER only their own
//! - **Connector Registry**: One pooled connector per database type
//! - **Scheduler**: Interval-driven evaluation with global and per-target limits
//! - **Alert State**: Edge-triggered transitions with bounded history
//! - **Dispatch**: Queued delivery with exponential backoff retry
//!
//! # Example
//!
//! ```no_run
//! use beacon::config::EngineConfig;
//! use beacon::connector::EnvSecretResolver;
//! use beacon::alerts::{LogSink, NotificationSink};
//! use beacon::AlertEngine;
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let engine = AlertEngine::new(
//!     EngineConfig::from_env(),
//!     Arc::new(EnvSecretResolver::new()),
//!     vec![Arc::new(LogSink) as Arc<dyn NotificationSink>],
//! );
//! engine.start();
//! // ...
//! engine.shutdown().await;
//! # }
//! ```

pub mod access;
pub mod alerts;
pub mod api;
pub mod config;
pub mod connector;
pub mod engine;
pub mod model;
pub mod rules;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use engine::{AlertEngine, EngineStats};
pub use model::{Alert, AlertEvent, AlertRule, AlertStatus, DatabaseType, Identity, UserRole};
pub use rules::{RuleStore, RuleStoreError};
