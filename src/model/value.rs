use serde::Serialize;

/// A single value returned by a backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Backend type with no decoder here, carrying the backend's type name
    Unsupported(String),
}

impl ScalarValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScalarValue::Null => "null",
            ScalarValue::Bool(_) => "bool",
            ScalarValue::Int(_) => "int",
            ScalarValue::Float(_) => "float",
            ScalarValue::Text(_) => "text",
            ScalarValue::Unsupported(_) => "unsupported",
        }
    }

    /// Numeric coercion to double precision. Text and booleans are not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Convert a decoded JSON value (ClickHouse, Elasticsearch, MongoDB results)
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => ScalarValue::Null,
            serde_json::Value::Bool(b) => ScalarValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ScalarValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    ScalarValue::Float(f)
                } else {
                    ScalarValue::Null
                }
            }
            serde_json::Value::String(s) => ScalarValue::Text(s.clone()),
            other => ScalarValue::Text(other.to_string()),
        }
    }
}

/// Result of a backend query: either a bare scalar or a single named row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueryOutput {
    Scalar(ScalarValue),
    Row {
        columns: Vec<String>,
        values: Vec<ScalarValue>,
    },
}

impl QueryOutput {
    pub fn row(columns: Vec<String>, values: Vec<ScalarValue>) -> Self {
        QueryOutput::Row { columns, values }
    }

    /// Pick the value to compare: the named column, or the first one
    pub fn value(&self, column: Option<&str>) -> Option<&ScalarValue> {
        match self {
            QueryOutput::Scalar(value) => Some(value),
            QueryOutput::Row { columns, values } => match column {
                Some(name) => columns
                    .iter()
                    .position(|c| c == name)
                    .and_then(|idx| values.get(idx)),
                None => values.first(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, QueryOutput::Row { values, .. } if values.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(ScalarValue::Int(42).as_f64(), Some(42.0));
        assert_eq!(ScalarValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(ScalarValue::Text("42".into()).as_f64(), None);
        assert_eq!(ScalarValue::Bool(true).as_f64(), None);
        assert_eq!(ScalarValue::Null.as_f64(), None);
    }

    #[test]
    fn test_row_column_selection() {
        let output = QueryOutput::row(
            vec!["host".into(), "errors".into()],
            vec![ScalarValue::Text("db-1".into()), ScalarValue::Int(7)],
        );
        assert_eq!(output.value(Some("errors")), Some(&ScalarValue::Int(7)));
        assert_eq!(output.value(None), Some(&ScalarValue::Text("db-1".into())));
        assert_eq!(output.value(Some("missing")), None);
    }

    #[test]
    fn test_from_json() {
        assert_eq!(ScalarValue::from_json(&serde_json::json!(3)), ScalarValue::Int(3));
        assert_eq!(ScalarValue::from_json(&serde_json::json!(2.5)), ScalarValue::Float(2.5));
        assert_eq!(ScalarValue::from_json(&serde_json::json!(null)), ScalarValue::Null);
    }
}
