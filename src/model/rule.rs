//! Alert rule definitions and their validation

use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::{ClickHouseDialect, Dialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use super::database::{DatabaseType, QueryLanguage, SqlDialect};

pub type RuleId = String;

/// Longest accepted evaluation interval (one year)
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// MongoDB commands a rule may run
const MONGO_READ_COMMANDS: &[&str] = &[
    "count",
    "find",
    "distinct",
    "aggregate",
    "dbStats",
    "collStats",
    "serverStatus",
];

/// Aggregation stages that write their output
const MONGO_WRITE_STAGES: &[&str] = &["$out", "$merge"];

/// Where a rule's query runs. Holds a reference to credentials, never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub database_type: DatabaseType,
    pub host: String,
    pub port: u16,
    /// Database name (SQL, MongoDB) or index pattern (Elasticsearch)
    pub database: String,
    #[serde(default)]
    pub credentials_ref: Option<String>,
    /// Driver-specific connection options passed through verbatim
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ConnectionTarget {
    pub fn new(
        database_type: DatabaseType,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        Self {
            database_type,
            host: host.into(),
            port,
            database: database.into(),
            credentials_ref: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_credentials(mut self, credentials_ref: impl Into<String>) -> Self {
        self.credentials_ref = Some(credentials_ref.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Key shared by every rule that talks to the same backend endpoint
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            database_type: self.database_type,
            host: self.host.to_ascii_lowercase(),
            port: self.port,
        }
    }
}

/// (type, host, port) identity of a backend endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub database_type: DatabaseType,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.database_type, self.host, self.port)
    }
}

/// Comparison operator applied to the observed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::GreaterThan => ">",
            CompareOp::GreaterOrEqual => ">=",
            CompareOp::LessThan => "<",
            CompareOp::LessOrEqual => "<=",
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
        }
    }

    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::GreaterThan => value > threshold,
            CompareOp::GreaterOrEqual => value >= threshold,
            CompareOp::LessThan => value < threshold,
            CompareOp::LessOrEqual => value <= threshold,
            CompareOp::Equal => value == threshold,
            CompareOp::NotEqual => value != threshold,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for CompareOp {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" => Ok(CompareOp::GreaterThan),
            ">=" | "gte" => Ok(CompareOp::GreaterOrEqual),
            "<" | "lt" => Ok(CompareOp::LessThan),
            "<=" | "lte" => Ok(CompareOp::LessOrEqual),
            "==" | "=" | "eq" => Ok(CompareOp::Equal),
            "!=" | "<>" | "ne" => Ok(CompareOp::NotEqual),
            other => Err(ValidationError::InvalidOperator(other.to_string())),
        }
    }
}

/// Operator plus threshold, optionally naming the result column to compare
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub operator: CompareOp,
    pub threshold: f64,
    #[serde(default)]
    pub column: Option<String>,
}

impl Predicate {
    pub fn new(operator: CompareOp, threshold: f64) -> Self {
        Self {
            operator,
            threshold,
            column: None,
        }
    }

    /// Build from an operator string such as `">="`
    pub fn parse(operator: &str, threshold: f64) -> Result<Self, ValidationError> {
        Ok(Self::new(operator.parse()?, threshold))
    }

    pub fn on_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn matches(&self, value: f64) -> bool {
        self.operator.check(value, self.threshold)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "{} {} {}", column, self.operator, self.threshold),
            None => write!(f, "value {} {}", self.operator, self.threshold),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Alert rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: RuleId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Identity id of the owning user
    pub owner: String,
    pub target: ConnectionTarget,
    /// Backend-native query text
    pub query: String,
    pub predicate: Predicate,
    pub interval_secs: u64,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bumped by the rule store on every update
    #[serde(default)]
    pub revision: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        target: ConnectionTarget,
        query: impl Into<String>,
        predicate: Predicate,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            description: None,
            owner: owner.into(),
            target,
            query: query.into(),
            predicate,
            interval_secs: 60,
            severity: Severity::default(),
            enabled: true,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Check the rule invariants. Runs at the rule store boundary.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.interval_secs == 0 {
            return Err(ValidationError::ZeroInterval);
        }
        if self.interval_secs > MAX_INTERVAL_SECS {
            return Err(ValidationError::IntervalTooLong(self.interval_secs));
        }
        if !self.predicate.threshold.is_finite() {
            return Err(ValidationError::NonFiniteThreshold);
        }
        validate_target(&self.target)?;
        validate_query(self.target.database_type, &self.query)
    }
}

fn credentials_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid credentials ref regex"))
}

fn validate_target(target: &ConnectionTarget) -> Result<(), ValidationError> {
    if target.host.trim().is_empty() {
        return Err(ValidationError::InvalidTarget("host is empty".to_string()));
    }
    if target.port == 0 {
        return Err(ValidationError::InvalidTarget("port must be non-zero".to_string()));
    }
    if target.database.trim().is_empty() {
        return Err(ValidationError::InvalidTarget(
            "database/index name is empty".to_string(),
        ));
    }
    if let Some(reference) = &target.credentials_ref {
        if !credentials_ref_pattern().is_match(reference) {
            return Err(ValidationError::InvalidCredentialsRef(reference.clone()));
        }
    }
    Ok(())
}

/// Validate query text against the backend's query language
pub fn validate_query(database_type: DatabaseType, query: &str) -> Result<(), ValidationError> {
    if query.trim().is_empty() {
        return Err(ValidationError::EmptyQuery);
    }

    match database_type.query_language() {
        QueryLanguage::Sql(dialect) => validate_sql(dialect, query),
        QueryLanguage::DocumentFilter => {
            let command: Document = serde_json::from_str(query)
                .map_err(|e| ValidationError::InvalidQuery(format!("invalid command document: {}", e)))?;
            check_read_only(&command).map_err(ValidationError::InvalidQuery)
        }
        QueryLanguage::SearchDsl => {
            let parsed: serde_json::Value = serde_json::from_str(query)
                .map_err(|e| ValidationError::InvalidQuery(format!("invalid JSON: {}", e)))?;
            match parsed {
                serde_json::Value::Object(map) if !map.is_empty() => Ok(()),
                _ => Err(ValidationError::InvalidQuery(
                    "query must be a non-empty JSON object".to_string(),
                )),
            }
        }
    }
}

/// Accept only read commands. The command name is the document's first key.
pub fn check_read_only(command: &Document) -> Result<(), String> {
    let name = command
        .keys()
        .next()
        .ok_or_else(|| "query must be a non-empty command document".to_string())?;

    if !MONGO_READ_COMMANDS.iter().any(|c| c.eq_ignore_ascii_case(name)) {
        return Err(format!("command '{}' is not a read-only command", name));
    }

    if name.eq_ignore_ascii_case("aggregate") {
        let stages = match command.get("pipeline") {
            Some(Bson::Array(stages)) => stages,
            _ => return Err("aggregate requires a pipeline array".to_string()),
        };
        for stage in stages {
            if let Bson::Document(stage) = stage {
                if let Some(op) = stage.keys().find(|k| MONGO_WRITE_STAGES.contains(&k.as_str())) {
                    return Err(format!("pipeline stage '{}' writes data", op));
                }
            }
        }
    }
    Ok(())
}

fn validate_sql(dialect: SqlDialect, sql: &str) -> Result<(), ValidationError> {
    let dialect: Box<dyn Dialect> = match dialect {
        SqlDialect::PostgreSql => Box::new(PostgreSqlDialect {}),
        SqlDialect::MySql => Box::new(MySqlDialect {}),
        SqlDialect::ClickHouse => Box::new(ClickHouseDialect {}),
    };

    let statements = Parser::parse_sql(dialect.as_ref(), sql)
        .map_err(|e| ValidationError::InvalidQuery(e.to_string()))?;

    match statements.as_slice() {
        [] => Err(ValidationError::EmptyQuery),
        [Statement::Query(_)] => Ok(()),
        [_] => Err(ValidationError::InvalidQuery(
            "only read-only SELECT queries are allowed".to_string(),
        )),
        _ => Err(ValidationError::InvalidQuery(
            "multiple statements not supported".to_string(),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Evaluation interval must be greater than zero")]
    ZeroInterval,

    #[error("Evaluation interval of {0}s exceeds one year")]
    IntervalTooLong(u64),

    #[error("Query must not be empty")]
    EmptyQuery,

    #[error("Rule name must not be empty")]
    EmptyName,

    #[error("Invalid predicate operator: {0}")]
    InvalidOperator(String),

    #[error("Predicate threshold must be a finite number")]
    NonFiniteThreshold,

    #[error("Invalid connection target: {0}")]
    InvalidTarget(String),

    #[error("Invalid credentials reference: {0}")]
    InvalidCredentialsRef(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Rule already exists: {0}")]
    DuplicateId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg_rule(query: &str) -> AlertRule {
        AlertRule::new(
            "pg-errors",
            "alice",
            ConnectionTarget::new(DatabaseType::PostgreSql, "db.internal", 5432, "app"),
            query,
            Predicate::new(CompareOp::GreaterThan, 10.0),
        )
    }

    #[test]
    fn test_valid_sql_rule() {
        let rule = pg_rule("SELECT COUNT(*) FROM errors WHERE created_at > now() - interval '5 minutes'");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let rule = pg_rule("SELECT 1").with_interval_secs(0);
        assert_eq!(rule.validate(), Err(ValidationError::ZeroInterval));
    }

    #[test]
    fn test_rejects_huge_interval() {
        let rule = pg_rule("SELECT 1").with_interval_secs(u64::MAX);
        assert_eq!(rule.validate(), Err(ValidationError::IntervalTooLong(u64::MAX)));

        let rule = pg_rule("SELECT 1").with_interval_secs(MAX_INTERVAL_SECS);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_query() {
        let rule = pg_rule("   ");
        assert_eq!(rule.validate(), Err(ValidationError::EmptyQuery));
    }

    #[test]
    fn test_rejects_mutating_sql() {
        let rule = pg_rule("DELETE FROM errors");
        assert!(matches!(rule.validate(), Err(ValidationError::InvalidQuery(_))));

        let rule = pg_rule("SELECT 1; SELECT 2");
        assert!(matches!(rule.validate(), Err(ValidationError::InvalidQuery(_))));
    }

    #[test]
    fn test_rejects_unparseable_sql() {
        let rule = pg_rule("SELEC count FROM");
        assert!(matches!(rule.validate(), Err(ValidationError::InvalidQuery(_))));
    }

    #[test]
    fn test_document_and_search_queries() {
        assert!(validate_query(DatabaseType::MongoDb, r#"{"count": "events", "query": {"level": "error"}}"#).is_ok());
        assert!(validate_query(DatabaseType::MongoDb, "[1, 2]").is_err());
        assert!(validate_query(DatabaseType::Elasticsearch, r#"{"query": {"match_all": {}}}"#).is_ok());
        assert!(validate_query(DatabaseType::Elasticsearch, "not json").is_err());
    }

    #[test]
    fn test_mongo_read_commands_only() {
        let ok = [
            r#"{"find": "events", "filter": {"level": "error"}, "limit": 1}"#,
            r#"{"distinct": "events", "key": "host"}"#,
            r#"{"aggregate": "events", "pipeline": [{"$match": {"level": "error"}}, {"$count": "n"}], "cursor": {}}"#,
            r#"{"dbStats": 1}"#,
        ];
        for query in ok {
            assert!(validate_query(DatabaseType::MongoDb, query).is_ok(), "{}", query);
        }

        let rejected = [
            r#"{"dropDatabase": 1}"#,
            r#"{"delete": "events", "deletes": [{"q": {}, "limit": 0}]}"#,
            r#"{"aggregate": "events", "pipeline": [{"$match": {}}, {"$out": "copy"}], "cursor": {}}"#,
            r#"{"aggregate": "events", "pipeline": [{"$merge": {"into": "copy"}}], "cursor": {}}"#,
            r#"{"aggregate": "events", "cursor": {}}"#,
            "{}",
        ];
        for query in rejected {
            assert!(
                matches!(validate_query(DatabaseType::MongoDb, query), Err(ValidationError::InvalidQuery(_))),
                "{}",
                query
            );
        }
    }

    #[test]
    fn test_invalid_target() {
        let mut rule = pg_rule("SELECT 1");
        rule.target.port = 0;
        assert!(matches!(rule.validate(), Err(ValidationError::InvalidTarget(_))));

        let mut rule = pg_rule("SELECT 1");
        rule.target.credentials_ref = Some("bad ref!".to_string());
        assert!(matches!(rule.validate(), Err(ValidationError::InvalidCredentialsRef(_))));
    }

    #[test]
    fn test_rejects_non_finite_threshold() {
        let mut rule = pg_rule("SELECT 1");
        rule.predicate.threshold = f64::NAN;
        assert_eq!(rule.validate(), Err(ValidationError::NonFiniteThreshold));
    }

    #[test]
    fn test_compare_ops() {
        assert!(CompareOp::GreaterThan.check(11.0, 10.0));
        assert!(!CompareOp::GreaterThan.check(10.0, 10.0));
        assert!(CompareOp::GreaterOrEqual.check(10.0, 10.0));
        assert!(CompareOp::LessThan.check(9.0, 10.0));
        assert!(CompareOp::LessOrEqual.check(10.0, 10.0));
        assert!(CompareOp::Equal.check(10.0, 10.0));
        assert!(CompareOp::NotEqual.check(9.0, 10.0));
    }

    #[test]
    fn test_parse_operator() {
        assert_eq!(Predicate::parse(">=", 1.0).unwrap().operator, CompareOp::GreaterOrEqual);
        assert_eq!(
            Predicate::parse("=~", 1.0),
            Err(ValidationError::InvalidOperator("=~".to_string()))
        );
    }

    #[test]
    fn test_rule_json_shape() {
        let json = serde_json::json!({
            "id": "slow-queries",
            "name": "Slow queries",
            "owner": "bob",
            "target": {
                "database_type": "ClickHouse",
                "host": "ch-1",
                "port": 8123,
                "database": "metrics"
            },
            "query": "SELECT count() FROM slow_log",
            "predicate": { "operator": ">=", "threshold": 5 },
            "interval_secs": 30
        });
        let rule: AlertRule = serde_json::from_value(json).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.severity, Severity::Warning);
        assert_eq!(rule.predicate.operator, CompareOp::GreaterOrEqual);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_pool_key_normalizes_host() {
        let a = ConnectionTarget::new(DatabaseType::MySql, "DB-1", 3306, "a");
        let b = ConnectionTarget::new(DatabaseType::MySql, "db-1", 3306, "b");
        assert_eq!(a.pool_key(), b.pool_key());
    }
}
