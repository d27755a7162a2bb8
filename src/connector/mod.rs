//! Uniform query execution over heterogeneous backends
//!
//! Each [`DatabaseType`] has exactly one [`Connector`] implementation. Callers
//! go through [`ConnectorRegistry::execute`] and never branch on the backend.

pub mod clickhouse;
pub mod elastic;
pub mod mongo;
pub mod pool;
pub mod secrets;
pub mod sql;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::model::{ConnectionTarget, DatabaseType, QueryOutput};

pub use clickhouse::ClickHouseConnector;
pub use elastic::ElasticsearchConnector;
pub use mongo::MongoConnector;
pub use pool::{AdmissionControl, ClientCache, ClientKey, PoolSettings};
pub use secrets::{Credentials, EnvSecretResolver, SecretResolver, StaticSecretResolver};
pub use sql::{MySqlConnector, PostgresConnector};

/// Backend-specific query execution capability
#[async_trait]
pub trait Connector: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Run `query` against `target` and return its first row or scalar
    async fn execute(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
        query: &str,
    ) -> Result<QueryOutput, ConnectorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorErrorKind {
    Timeout,
    AuthFailure,
    QuerySyntax,
    Unreachable,
}

impl fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorErrorKind::Timeout => write!(f, "Timeout"),
            ConnectorErrorKind::AuthFailure => write!(f, "Authentication failure"),
            ConnectorErrorKind::QuerySyntax => write!(f, "Query error"),
            ConnectorErrorKind::Unreachable => write!(f, "Backend unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ConnectorError {
    pub kind: ConnectorErrorKind,
    pub message: String,
}

impl ConnectorError {
    pub fn new(kind: ConnectorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Timeout, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::AuthFailure, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::QuerySyntax, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Unreachable, message)
    }

    /// Classify a reqwest failure (ClickHouse and Elasticsearch transports)
    pub(crate) fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else {
            Self::unreachable(err.to_string())
        }
    }
}

/// Built-in connector for each backend. The match is exhaustive so a new
/// `DatabaseType` variant cannot compile without a connector.
fn default_connector(database_type: DatabaseType, settings: &PoolSettings) -> Arc<dyn Connector> {
    match database_type {
        DatabaseType::PostgreSql => Arc::new(PostgresConnector::new(settings.clone())),
        DatabaseType::MySql => Arc::new(MySqlConnector::new(settings.clone())),
        DatabaseType::ClickHouse => Arc::new(ClickHouseConnector::new(settings.clone())),
        DatabaseType::MongoDb => Arc::new(MongoConnector::new(settings.clone())),
        DatabaseType::Elasticsearch => Arc::new(ElasticsearchConnector::new(settings.clone())),
    }
}

/// Routes queries to the connector for the target's backend, applying
/// credential lookup, pool admission, and the hard per-call timeout.
pub struct ConnectorRegistry {
    connectors: HashMap<DatabaseType, Arc<dyn Connector>>,
    secrets: Arc<dyn SecretResolver>,
    admission: AdmissionControl,
    settings: PoolSettings,
}

impl ConnectorRegistry {
    pub fn new(settings: PoolSettings, secrets: Arc<dyn SecretResolver>) -> Self {
        let connectors = DatabaseType::ALL
            .into_iter()
            .map(|db| (db, default_connector(db, &settings)))
            .collect();

        Self {
            connectors,
            secrets,
            admission: AdmissionControl::new(settings.max_connections),
            settings,
        }
    }

    /// Replace the connector for its backend type
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(connector.database_type(), connector);
        self
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// Execute `query` against `target`, failing after `timeout`
    pub async fn execute(
        &self,
        target: &ConnectionTarget,
        query: &str,
        timeout: Duration,
    ) -> Result<QueryOutput, ConnectorError> {
        let connector = self.connectors.get(&target.database_type).ok_or_else(|| {
            ConnectorError::unreachable(format!("no connector for {}", target.database_type))
        })?;

        let credentials = match &target.credentials_ref {
            Some(reference) => Some(self.secrets.resolve(reference).ok_or_else(|| {
                ConnectorError::auth(format!("credentials reference '{}' not found", reference))
            })?),
            None => None,
        };

        let pool_key = target.pool_key();
        let wait = self.settings.acquire_timeout.min(timeout);
        let _permit = self.admission.acquire(&pool_key, wait).await?;

        match tokio::time::timeout(timeout, connector.execute(target, credentials.as_ref(), query)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::timeout(format!(
                "query against {} exceeded {:?}",
                pool_key, timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScalarValue;
    use crate::testing::ScriptedConnector;

    fn target() -> ConnectionTarget {
        ConnectionTarget::new(DatabaseType::ClickHouse, "ch", 8123, "default")
    }

    fn registry(connector: Arc<ScriptedConnector>) -> ConnectorRegistry {
        ConnectorRegistry::new(PoolSettings::default(), Arc::new(StaticSecretResolver::new()))
            .with_connector(connector)
    }

    #[tokio::test]
    async fn test_routes_to_connector() {
        let connector = Arc::new(ScriptedConnector::new(DatabaseType::ClickHouse));
        connector.push_value(ScalarValue::Int(5));
        let registry = registry(Arc::clone(&connector));

        let output = registry
            .execute(&target(), "SELECT 5", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(output, QueryOutput::Scalar(ScalarValue::Int(5)));
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_hard_timeout() {
        let connector = Arc::new(ScriptedConnector::new(DatabaseType::ClickHouse));
        connector.set_delay(Duration::from_millis(500));
        connector.push_value(ScalarValue::Int(1));
        let registry = registry(connector);

        let err = registry
            .execute(&target(), "SELECT 1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_credentials_ref() {
        let connector = Arc::new(ScriptedConnector::new(DatabaseType::ClickHouse));
        let registry = registry(Arc::clone(&connector));

        let err = registry
            .execute(&target().with_credentials("missing"), "SELECT 1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::AuthFailure);
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_unreachable() {
        let connector = Arc::new(ScriptedConnector::new(DatabaseType::ClickHouse));
        connector.set_delay(Duration::from_millis(300));
        connector.push_value(ScalarValue::Int(1));
        connector.push_value(ScalarValue::Int(2));

        let settings = PoolSettings {
            max_connections: 1,
            acquire_timeout: Duration::from_millis(20),
            ..PoolSettings::default()
        };
        let registry = Arc::new(
            ConnectorRegistry::new(settings, Arc::new(StaticSecretResolver::new()))
                .with_connector(connector),
        );

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .execute(&target(), "SELECT 1", Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = registry
            .execute(&target(), "SELECT 2", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Unreachable);
        assert!(first.await.unwrap().is_ok());
    }

    #[test]
    fn test_every_backend_has_a_connector() {
        let registry =
            ConnectorRegistry::new(PoolSettings::default(), Arc::new(StaticSecretResolver::new()));
        for db in DatabaseType::ALL {
            assert_eq!(registry.connectors[&db].database_type(), db);
        }
    }
}
