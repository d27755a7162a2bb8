//! PostgreSQL and MySQL connectors backed by sqlx pools

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Row, TypeInfo};

use super::pool::{ClientCache, PoolSettings};
use super::secrets::Credentials;
use super::{Connector, ConnectorError, ConnectorErrorKind};
use crate::model::{ConnectionTarget, DatabaseType, QueryOutput, ScalarValue};

/// Map a SQLSTATE code onto the connector error taxonomy
pub(crate) fn classify_sqlstate(code: &str) -> ConnectorErrorKind {
    match code {
        // statement_timeout / lock timeout
        "57014" | "55P03" => ConnectorErrorKind::Timeout,
        c if c.starts_with("28") => ConnectorErrorKind::AuthFailure,
        // insufficient_privilege
        "42501" => ConnectorErrorKind::AuthFailure,
        c if c.starts_with("42") => ConnectorErrorKind::QuerySyntax,
        c if c.starts_with("22") => ConnectorErrorKind::QuerySyntax,
        _ => ConnectorErrorKind::Unreachable,
    }
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> ConnectorError {
    match err {
        sqlx::Error::PoolTimedOut => {
            ConnectorError::unreachable("timed out waiting for a pooled connection")
        }
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            ConnectorError::new(classify_sqlstate(&code), format!("[{}] {}", code, db.message()))
        }
        sqlx::Error::RowNotFound => ConnectorError::syntax("query returned no rows"),
        sqlx::Error::ColumnNotFound(name) => {
            ConnectorError::syntax(format!("column not found: {}", name))
        }
        other => ConnectorError::unreachable(other.to_string()),
    }
}

fn columns_of<R: Row>(row: &R) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// NUMERIC / DECIMAL columns (AVG, SUM over integers) coerced to a double
fn decimal_scalar(value: Option<Decimal>) -> ScalarValue {
    match value {
        Some(d) => d
            .to_f64()
            .map(ScalarValue::Float)
            .unwrap_or_else(|| ScalarValue::Unsupported(format!("decimal {}", d))),
        None => ScalarValue::Null,
    }
}

fn decode_pg_value(row: &PgRow, idx: usize) -> ScalarValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(ScalarValue::Int).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| ScalarValue::Int(i as i64)).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| ScalarValue::Int(i as i64)).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(ScalarValue::Float).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| ScalarValue::Float(f as f64)).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
        return decimal_scalar(v);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(ScalarValue::Bool).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(ScalarValue::Text).unwrap_or(ScalarValue::Null);
    }
    ScalarValue::Unsupported(row.columns()[idx].type_info().name().to_string())
}

fn decode_mysql_value(row: &MySqlRow, idx: usize) -> ScalarValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(ScalarValue::Int).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return match v {
            Some(u) => i64::try_from(u)
                .map(ScalarValue::Int)
                .unwrap_or(ScalarValue::Float(u as f64)),
            None => ScalarValue::Null,
        };
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| ScalarValue::Int(i as i64)).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(ScalarValue::Float).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| ScalarValue::Float(f as f64)).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
        return decimal_scalar(v);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(ScalarValue::Bool).unwrap_or(ScalarValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(ScalarValue::Text).unwrap_or(ScalarValue::Null);
    }
    ScalarValue::Unsupported(row.columns()[idx].type_info().name().to_string())
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresConnector {
    pools: ClientCache<PgPool>,
    settings: PoolSettings,
}

impl PostgresConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            pools: ClientCache::new(settings.idle_timeout),
            settings,
        }
    }

    fn connect_options(
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
    ) -> Result<PgConnectOptions, ConnectorError> {
        let mut options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.database);

        if let Some(creds) = credentials {
            options = options.username(&creds.username).password(&creds.password);
        }

        for (key, value) in &target.options {
            options = match key.as_str() {
                "sslmode" => options.ssl_mode(PgSslMode::from_str(value).map_err(|e| {
                    ConnectorError::unreachable(format!("invalid sslmode '{}': {}", value, e))
                })?),
                "application_name" => options.application_name(value),
                other => {
                    tracing::debug!(option = %other, "Ignoring unknown PostgreSQL option");
                    options
                }
            };
        }
        Ok(options)
    }

    fn pool(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
    ) -> Result<PgPool, ConnectorError> {
        self.pools.get_or_try_build(target, || {
            let options = Self::connect_options(target, credentials)?;
            Ok(PgPoolOptions::new()
                .max_connections(self.settings.max_connections)
                .acquire_timeout(self.settings.acquire_timeout)
                .idle_timeout(self.settings.idle_timeout)
                .connect_lazy_with(options))
        })
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSql
    }

    async fn execute(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
        query: &str,
    ) -> Result<QueryOutput, ConnectorError> {
        let pool = self.pool(target, credentials)?;
        let row = sqlx::query(query)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(match row {
            Some(row) => {
                let values = (0..row.len()).map(|i| decode_pg_value(&row, i)).collect();
                QueryOutput::row(columns_of(&row), values)
            }
            None => QueryOutput::row(vec![], vec![]),
        })
    }
}

// ============================================================================
// MySQL
// ============================================================================

pub struct MySqlConnector {
    pools: ClientCache<MySqlPool>,
    settings: PoolSettings,
}

impl MySqlConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            pools: ClientCache::new(settings.idle_timeout),
            settings,
        }
    }

    fn connect_options(
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
    ) -> Result<MySqlConnectOptions, ConnectorError> {
        let mut options = MySqlConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.database);

        if let Some(creds) = credentials {
            options = options.username(&creds.username).password(&creds.password);
        }

        for (key, value) in &target.options {
            options = match key.as_str() {
                "ssl-mode" | "sslmode" => options.ssl_mode(MySqlSslMode::from_str(value).map_err(|e| {
                    ConnectorError::unreachable(format!("invalid ssl-mode '{}': {}", value, e))
                })?),
                "charset" => options.charset(value),
                other => {
                    tracing::debug!(option = %other, "Ignoring unknown MySQL option");
                    options
                }
            };
        }
        Ok(options)
    }

    fn pool(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
    ) -> Result<MySqlPool, ConnectorError> {
        self.pools.get_or_try_build(target, || {
            let options = Self::connect_options(target, credentials)?;
            Ok(MySqlPoolOptions::new()
                .max_connections(self.settings.max_connections)
                .acquire_timeout(self.settings.acquire_timeout)
                .idle_timeout(self.settings.idle_timeout)
                .connect_lazy_with(options))
        })
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    async fn execute(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
        query: &str,
    ) -> Result<QueryOutput, ConnectorError> {
        let pool = self.pool(target, credentials)?;
        let row = sqlx::query(query)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(match row {
            Some(row) => {
                let values = (0..row.len()).map(|i| decode_mysql_value(&row, i)).collect();
                QueryOutput::row(columns_of(&row), values)
            }
            None => QueryOutput::row(vec![], vec![]),
        })
    }
}
