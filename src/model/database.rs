use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported backend data stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatabaseType {
    #[serde(rename = "PostgreSQL", alias = "postgresql", alias = "POSTGRESQL")]
    PostgreSql,
    #[serde(rename = "MySQL", alias = "mysql", alias = "MYSQL")]
    MySql,
    #[serde(rename = "ClickHouse", alias = "clickhouse", alias = "CLICKHOUSE")]
    ClickHouse,
    #[serde(rename = "MongoDB", alias = "mongodb", alias = "MONGODB")]
    MongoDb,
    #[serde(rename = "Elasticsearch", alias = "elasticsearch", alias = "ELASTICSEARCH")]
    Elasticsearch,
}

/// Query language family accepted by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLanguage {
    /// SQL text in the given dialect
    Sql(SqlDialect),
    /// JSON database command (count, aggregate, find)
    DocumentFilter,
    /// JSON search request body
    SearchDsl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    PostgreSql,
    MySql,
    ClickHouse,
}

impl DatabaseType {
    pub const ALL: [DatabaseType; 5] = [
        DatabaseType::PostgreSql,
        DatabaseType::MySql,
        DatabaseType::ClickHouse,
        DatabaseType::MongoDb,
        DatabaseType::Elasticsearch,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseType::PostgreSql => "PostgreSQL",
            DatabaseType::MySql => "MySQL",
            DatabaseType::ClickHouse => "ClickHouse",
            DatabaseType::MongoDb => "MongoDB",
            DatabaseType::Elasticsearch => "Elasticsearch",
        }
    }

    pub fn query_language(&self) -> QueryLanguage {
        match self {
            DatabaseType::PostgreSql => QueryLanguage::Sql(SqlDialect::PostgreSql),
            DatabaseType::MySql => QueryLanguage::Sql(SqlDialect::MySql),
            DatabaseType::ClickHouse => QueryLanguage::Sql(SqlDialect::ClickHouse),
            DatabaseType::MongoDb => QueryLanguage::DocumentFilter,
            DatabaseType::Elasticsearch => QueryLanguage::SearchDsl,
        }
    }

    /// Port the backend listens on out of the box (HTTP port for ClickHouse)
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::PostgreSql => 5432,
            DatabaseType::MySql => 3306,
            DatabaseType::ClickHouse => 8123,
            DatabaseType::MongoDb => 27017,
            DatabaseType::Elasticsearch => 9200,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for DatabaseType {
    type Err = UnknownDatabaseType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatabaseType::ALL
            .into_iter()
            .find(|db| db.display_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownDatabaseType(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown database type: {0}")]
pub struct UnknownDatabaseType(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("postgresql".parse::<DatabaseType>().unwrap(), DatabaseType::PostgreSql);
        assert_eq!("ClickHouse".parse::<DatabaseType>().unwrap(), DatabaseType::ClickHouse);
        assert_eq!(" ELASTICSEARCH ".parse::<DatabaseType>().unwrap(), DatabaseType::Elasticsearch);
        assert!("oracle".parse::<DatabaseType>().is_err());
    }

    #[test]
    fn test_query_language_families() {
        assert!(matches!(DatabaseType::MySql.query_language(), QueryLanguage::Sql(SqlDialect::MySql)));
        assert_eq!(DatabaseType::MongoDb.query_language(), QueryLanguage::DocumentFilter);
        assert_eq!(DatabaseType::Elasticsearch.query_language(), QueryLanguage::SearchDsl);
    }

    #[test]
    fn test_serde_display_names() {
        let json = serde_json::to_string(&DatabaseType::MongoDb).unwrap();
        assert_eq!(json, "\"MongoDB\"");
        let parsed: DatabaseType = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(parsed, DatabaseType::MySql);
    }
}
