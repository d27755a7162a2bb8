//! ClickHouse connector over the HTTP interface

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;

use super::pool::PoolSettings;
use super::secrets::Credentials;
use super::{Connector, ConnectorError, ConnectorErrorKind};
use crate::model::{ConnectionTarget, DatabaseType, QueryOutput, ScalarValue};

pub struct ClickHouseConnector {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct JsonCompactResponse {
    meta: Vec<ColumnMeta>,
    data: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ColumnMeta {
    name: String,
}

impl ClickHouseConnector {
    pub fn new(settings: PoolSettings) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.max_connections as usize)
            .pool_idle_timeout(settings.idle_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client for ClickHouse");
                reqwest::Client::new()
            });
        Self { client }
    }

    fn base_url(target: &ConnectionTarget) -> String {
        let secure = target
            .options
            .get("secure")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let scheme = if secure { "https" } else { "http" };
        format!("{}://{}:{}/", scheme, target.host, target.port)
    }

    fn parse_response(body: &str) -> Result<QueryOutput, ConnectorError> {
        let response: JsonCompactResponse = serde_json::from_str(body).map_err(|e| {
            ConnectorError::unreachable(format!("unexpected ClickHouse response: {}", e))
        })?;

        let columns = response.meta.into_iter().map(|m| m.name).collect();
        let values = response
            .data
            .first()
            .map(|row| row.iter().map(ScalarValue::from_json).collect())
            .unwrap_or_default();
        Ok(QueryOutput::row(columns, values))
    }
}

fn exception_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Code:\s*(\d+)").expect("valid exception code regex"))
}

/// Map a ClickHouse exception code (or HTTP status when absent)
fn classify_exception(code: Option<u32>, status: StatusCode) -> ConnectorErrorKind {
    match code {
        // AUTHENTICATION_FAILED, UNKNOWN_USER, WRONG_PASSWORD, ACCESS_DENIED
        Some(516) | Some(192) | Some(193) | Some(497) => ConnectorErrorKind::AuthFailure,
        // TIMEOUT_EXCEEDED
        Some(159) => ConnectorErrorKind::Timeout,
        // SYNTAX_ERROR, UNKNOWN_IDENTIFIER, UNKNOWN_TABLE, UNKNOWN_FUNCTION, UNKNOWN_DATABASE
        Some(62) | Some(47) | Some(60) | Some(46) | Some(81) => ConnectorErrorKind::QuerySyntax,
        _ => match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorErrorKind::AuthFailure,
            StatusCode::BAD_REQUEST => ConnectorErrorKind::QuerySyntax,
            _ => ConnectorErrorKind::Unreachable,
        },
    }
}

fn exception_code(header: Option<&str>, body: &str) -> Option<u32> {
    header.and_then(|h| h.trim().parse().ok()).or_else(|| {
        exception_code_pattern()
            .captures(body)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

#[async_trait]
impl Connector for ClickHouseConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::ClickHouse
    }

    async fn execute(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
        query: &str,
    ) -> Result<QueryOutput, ConnectorError> {
        let mut request = self
            .client
            .post(Self::base_url(target))
            .query(&[
                ("database", target.database.as_str()),
                ("default_format", "JSONCompact"),
                ("output_format_json_quote_64bit_integers", "0"),
                ("readonly", "1"),
            ])
            .body(query.to_string());

        if let Some(creds) = credentials {
            request = request
                .header("X-ClickHouse-User", &creds.username)
                .header("X-ClickHouse-Key", &creds.password);
        }

        let response = request.send().await.map_err(ConnectorError::from_http)?;
        let status = response.status();
        let code_header = response
            .headers()
            .get("X-ClickHouse-Exception-Code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(ConnectorError::from_http)?;

        if !status.is_success() {
            let code = exception_code(code_header.as_deref(), &body);
            let kind = classify_exception(code, status);
            return Err(ConnectorError::new(kind, body.trim().to_string()));
        }

        Self::parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_compact() {
        let body = r#"{
            "meta": [{"name": "errors", "type": "UInt64"}, {"name": "p99", "type": "Float64"}],
            "data": [[17, 250.5]],
            "rows": 1,
            "statistics": {"elapsed": 0.001, "rows_read": 10, "bytes_read": 80}
        }"#;
        let output = ClickHouseConnector::parse_response(body).unwrap();
        assert_eq!(output.value(Some("errors")), Some(&ScalarValue::Int(17)));
        assert_eq!(output.value(Some("p99")), Some(&ScalarValue::Float(250.5)));
    }

    #[test]
    fn test_parse_empty_result() {
        let body = r#"{"meta": [{"name": "c", "type": "UInt64"}], "data": [], "rows": 0}"#;
        let output = ClickHouseConnector::parse_response(body).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_exception_classification() {
        let body = "Code: 62. DB::Exception: Syntax error: failed at position 1";
        let code = exception_code(None, body);
        assert_eq!(code, Some(62));
        assert_eq!(
            classify_exception(code, StatusCode::BAD_REQUEST),
            ConnectorErrorKind::QuerySyntax
        );

        assert_eq!(
            classify_exception(exception_code(Some("516"), ""), StatusCode::UNAUTHORIZED),
            ConnectorErrorKind::AuthFailure
        );
        assert_eq!(
            classify_exception(None, StatusCode::SERVICE_UNAVAILABLE),
            ConnectorErrorKind::Unreachable
        );
    }

    #[test]
    fn test_base_url_scheme() {
        let target = ConnectionTarget::new(DatabaseType::ClickHouse, "ch", 8443, "default")
            .with_option("secure", "true");
        assert_eq!(ClickHouseConnector::base_url(&target), "https://ch:8443/");
    }
}
