//! Elasticsearch connector: runs a search DSL body against an index pattern

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::pool::PoolSettings;
use super::secrets::Credentials;
use super::{Connector, ConnectorError};
use crate::model::{ConnectionTarget, DatabaseType, QueryOutput, ScalarValue};

pub struct ElasticsearchConnector {
    client: reqwest::Client,
}

impl ElasticsearchConnector {
    pub fn new(settings: PoolSettings) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.max_connections as usize)
            .pool_idle_timeout(settings.idle_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client for Elasticsearch");
                reqwest::Client::new()
            });
        Self { client }
    }

    fn search_url(target: &ConnectionTarget) -> String {
        let scheme = match target.options.get("scheme").map(String::as_str) {
            Some("https") => "https",
            _ => "http",
        };
        format!(
            "{}://{}:{}/{}/_search",
            scheme, target.host, target.port, target.database
        )
    }

    /// Parse the DSL body. Hits are never needed, so `size` defaults to 0.
    fn prepare_body(query: &str) -> Result<Value, ConnectorError> {
        let mut body: Value = serde_json::from_str(query)
            .map_err(|e| ConnectorError::syntax(format!("invalid search body: {}", e)))?;
        match body.as_object_mut() {
            Some(map) => {
                map.entry("size").or_insert(Value::from(0));
                map.entry("track_total_hits").or_insert(Value::Bool(true));
            }
            None => return Err(ConnectorError::syntax("search body must be a JSON object")),
        }
        Ok(body)
    }

    /// Single-value aggregations become named columns; otherwise the hit count is the value
    fn parse_response(response: &Value) -> Result<QueryOutput, ConnectorError> {
        let total = response
            .pointer("/hits/total")
            .and_then(|total| match total {
                Value::Number(_) => total.as_i64(),
                Value::Object(_) => total.get("value").and_then(Value::as_i64),
                _ => None,
            })
            .ok_or_else(|| ConnectorError::unreachable("search response has no hits.total"))?;

        let aggregations = match response.get("aggregations").and_then(Value::as_object) {
            Some(aggs) if !aggs.is_empty() => aggs,
            _ => return Ok(QueryOutput::Scalar(ScalarValue::Int(total))),
        };

        // Single-value aggregations lead, so the default column is the first of them
        let (single, multi): (Vec<_>, Vec<_>) = aggregations
            .iter()
            .map(|(name, agg)| {
                let value = agg
                    .get("value")
                    .or_else(|| agg.get("doc_count"))
                    .map(ScalarValue::from_json);
                (name, value)
            })
            .partition(|(_, value)| value.is_some());

        let mut columns = Vec::with_capacity(aggregations.len() + 1);
        let mut values = Vec::with_capacity(aggregations.len() + 1);
        for (name, value) in single.into_iter().chain(multi) {
            columns.push(name.clone());
            values.push(value.unwrap_or_else(|| {
                ScalarValue::Unsupported("multi-value aggregation".to_string())
            }));
        }
        columns.push("hits_total".to_string());
        values.push(ScalarValue::Int(total));

        Ok(QueryOutput::row(columns, values))
    }

    fn error_for_status(status: StatusCode, body: &str) -> ConnectorError {
        let reason = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.trim().to_string());
        let message = format!("HTTP {}: {}", status.as_u16(), reason);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorError::auth(message),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => ConnectorError::syntax(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                ConnectorError::timeout(message)
            }
            _ => ConnectorError::unreachable(message),
        }
    }
}

#[async_trait]
impl Connector for ElasticsearchConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Elasticsearch
    }

    async fn execute(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
        query: &str,
    ) -> Result<QueryOutput, ConnectorError> {
        let body = Self::prepare_body(query)?;

        let mut request = self.client.post(Self::search_url(target)).json(&body);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await.map_err(ConnectorError::from_http)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::error_for_status(status, &text));
        }

        let json: Value = response.json().await.map_err(ConnectorError::from_http)?;
        if json.get("timed_out").and_then(Value::as_bool) == Some(true) {
            return Err(ConnectorError::timeout("search timed out on the cluster"));
        }
        Self::parse_response(&json)
    }
}
