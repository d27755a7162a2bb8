//! MongoDB connector. Queries are database commands written as JSON, e.g.
//! `{"count": "events", "query": {"level": "error"}}` or an `aggregate`
//! pipeline with `cursor: {}`.

use async_trait::async_trait;
use mongodb::bson::{Bson, Decimal128, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::Client;

use super::pool::{ClientCache, PoolSettings};
use super::secrets::Credentials;
use super::{Connector, ConnectorError};
use crate::model::{check_read_only, ConnectionTarget, DatabaseType, QueryOutput, ScalarValue};

/// Reply fields that describe the command rather than its result
const REPLY_METADATA: &[&str] = &["ok", "$clusterTime", "operationTime"];

pub struct MongoConnector {
    clients: ClientCache<Client>,
    settings: PoolSettings,
}

impl MongoConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            clients: ClientCache::new(settings.idle_timeout),
            settings,
        }
    }

    fn client_options(
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
        settings: &PoolSettings,
    ) -> ClientOptions {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: target.host.clone(),
            port: Some(target.port),
        }];
        options.max_pool_size = Some(settings.max_connections);
        options.connect_timeout = Some(settings.connect_timeout);
        options.server_selection_timeout = Some(settings.acquire_timeout);
        options.max_idle_time = Some(settings.idle_timeout);
        options.app_name = Some(
            target
                .options
                .get("appName")
                .cloned()
                .unwrap_or_else(|| "beacon".to_string()),
        );
        if let Some(set) = target.options.get("replicaSet") {
            options.repl_set_name = Some(set.clone());
        }

        if let Some(creds) = credentials {
            let mut credential = Credential::default();
            credential.username = Some(creds.username.clone());
            credential.password = Some(creds.password.clone());
            credential.source = target.options.get("authSource").cloned();
            options.credential = Some(credential);
        }
        options
    }

    fn client(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
    ) -> Result<Client, ConnectorError> {
        self.clients.get_or_try_build(target, || {
            let options = Self::client_options(target, credentials, &self.settings);
            Client::with_options(options).map_err(map_mongo_error)
        })
    }

    /// Parse the command JSON. `Document` keeps key order, which MongoDB
    /// requires (the command name must come first).
    fn parse_command(query: &str) -> Result<Document, ConnectorError> {
        serde_json::from_str::<Document>(query)
            .map_err(|e| ConnectorError::syntax(format!("invalid command document: {}", e)))
    }

    fn shape_reply(reply: &Document) -> QueryOutput {
        // count / countDocuments-style replies
        if let Some(n) = reply.get("n") {
            return QueryOutput::Scalar(bson_to_scalar(n));
        }

        // find / aggregate replies carry the first batch inline
        if let Ok(batch) = reply
            .get_document("cursor")
            .and_then(|cursor| cursor.get_array("firstBatch"))
        {
            return match batch.first() {
                Some(Bson::Document(doc)) => document_row(doc, &["_id"]),
                Some(other) => QueryOutput::Scalar(bson_to_scalar(other)),
                None => QueryOutput::row(vec![], vec![]),
            };
        }

        document_row(reply, REPLY_METADATA)
    }
}

fn document_row(doc: &Document, skip: &[&str]) -> QueryOutput {
    let (columns, values) = doc
        .iter()
        .filter(|(key, _)| !skip.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), bson_to_scalar(value)))
        .unzip();
    QueryOutput::row(columns, values)
}

fn bson_to_scalar(value: &Bson) -> ScalarValue {
    match value {
        Bson::Null | Bson::Undefined => ScalarValue::Null,
        Bson::Boolean(b) => ScalarValue::Bool(*b),
        Bson::Int32(i) => ScalarValue::Int(*i as i64),
        Bson::Int64(i) => ScalarValue::Int(*i),
        Bson::Double(f) => ScalarValue::Float(*f),
        Bson::String(s) => ScalarValue::Text(s.clone()),
        Bson::DateTime(dt) => ScalarValue::Int(dt.timestamp_millis()),
        Bson::Decimal128(d) => decimal128_to_f64(d)
            .map(ScalarValue::Float)
            .unwrap_or_else(|| ScalarValue::Unsupported("decimal128".to_string())),
        other => ScalarValue::Unsupported(format!("{:?}", other.element_type())),
    }
}

/// Decode an IEEE 754-2008 BID decimal128. NaN and infinities yield `None`.
fn decimal128_to_f64(value: &Decimal128) -> Option<f64> {
    let bits = u128::from_le_bytes(value.bytes());
    let negative = bits >> 127 == 1;
    let combination = (bits >> 122) & 0x1f;
    if combination >= 0x1e {
        return None;
    }

    let (exponent, coefficient) = if (bits >> 125) & 0b11 == 0b11 {
        // Coefficients in this form exceed 10^34 and are non-canonical zeros
        (((bits >> 111) & 0x3fff) as i32, 0u128)
    } else {
        (((bits >> 113) & 0x3fff) as i32, bits & ((1u128 << 113) - 1))
    };

    let magnitude: f64 = format!("{}e{}", coefficient, exponent - 6176).parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

pub(crate) fn map_mongo_error(err: mongodb::error::Error) -> ConnectorError {
    let message = err.to_string();
    match err.kind.as_ref() {
        ErrorKind::Authentication { .. } => ConnectorError::auth(message),
        ErrorKind::Command(command) => match command.code {
            // Unauthorized, AuthenticationFailed
            13 | 18 => ConnectorError::auth(message),
            // MaxTimeMSExpired
            50 => ConnectorError::timeout(message),
            _ => ConnectorError::syntax(message),
        },
        ErrorKind::InvalidArgument { .. } => ConnectorError::syntax(message),
        _ => ConnectorError::unreachable(message),
    }
}

#[async_trait]
impl Connector for MongoConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MongoDb
    }

    async fn execute(
        &self,
        target: &ConnectionTarget,
        credentials: Option<&Credentials>,
        query: &str,
    ) -> Result<QueryOutput, ConnectorError> {
        let command = Self::parse_command(query)?;
        check_read_only(&command).map_err(ConnectorError::syntax)?;
        let client = self.client(target, credentials)?;

        let reply = client
            .database(&target.database)
            .run_command(command, None)
            .await
            .map_err(map_mongo_error)?;

        Ok(Self::shape_reply(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_command_key_order_preserved() {
        let command =
            MongoConnector::parse_command(r#"{"count": "events", "query": {"level": "error"}}"#)
                .unwrap();
        assert_eq!(command.keys().next().map(String::as_str), Some("count"));
    }

    #[test]
    fn test_count_reply() {
        let reply = doc! { "n": 12, "ok": 1.0 };
        assert_eq!(
            MongoConnector::shape_reply(&reply),
            QueryOutput::Scalar(ScalarValue::Int(12))
        );
    }

    #[test]
    fn test_aggregate_first_batch() {
        let reply = doc! {
            "cursor": {
                "firstBatch": [ { "_id": null, "total": 3.5_f64, "errors": 9_i64 } ],
                "id": 0_i64,
                "ns": "app.events"
            },
            "ok": 1.0
        };
        let output = MongoConnector::shape_reply(&reply);
        assert_eq!(output.value(Some("total")), Some(&ScalarValue::Float(3.5)));
        assert_eq!(output.value(Some("errors")), Some(&ScalarValue::Int(9)));
        assert_eq!(output.value(Some("_id")), None);
    }

    #[test]
    fn test_empty_batch() {
        let reply = doc! { "cursor": { "firstBatch": [], "id": 0_i64 }, "ok": 1.0 };
        assert!(MongoConnector::shape_reply(&reply).is_empty());
    }

    #[test]
    fn test_generic_reply_skips_metadata() {
        let reply = doc! { "ok": 1.0, "connections": 4 };
        let output = MongoConnector::shape_reply(&reply);
        assert_eq!(output.value(None), Some(&ScalarValue::Int(4)));
    }

    fn decimal128(coefficient: u128, exponent: i32, negative: bool) -> Decimal128 {
        let biased = (exponent + 6176) as u128;
        let sign = if negative { 1u128 << 127 } else { 0 };
        Decimal128::from_bytes((sign | (biased << 113) | coefficient).to_le_bytes())
    }

    #[test]
    fn test_decimal128_coerced_to_float() {
        let avg = Bson::Decimal128(decimal128(1275, -2, false));
        assert_eq!(bson_to_scalar(&avg), ScalarValue::Float(12.75));

        let neg = Bson::Decimal128(decimal128(5, 3, true));
        assert_eq!(bson_to_scalar(&neg), ScalarValue::Float(-5000.0));

        let nan = Decimal128::from_bytes((0x1fu128 << 122).to_le_bytes());
        assert!(matches!(
            bson_to_scalar(&Bson::Decimal128(nan)),
            ScalarValue::Unsupported(_)
        ));
    }

    #[test]
    fn test_client_options() {
        let target = ConnectionTarget::new(DatabaseType::MongoDb, "mongo-1", 27017, "app")
            .with_option("authSource", "admin");
        let creds = Credentials::new("reader", "pw");
        let options =
            MongoConnector::client_options(&target, Some(&creds), &PoolSettings::default());
        assert_eq!(options.max_pool_size, Some(10));
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("reader"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
    }
}
