use serde::{Deserialize, Serialize};
use serde_json::Value;

use medallion_types::{MedallionError, Result};

/// Logical column type of a [`crate::DataFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Null,
    Boolean,
    Integer,
    Double,
    String,
    Struct,
    List,
}

impl DataType {
    /// Type of a single cell.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_f64() => DataType::Double,
            Value::Number(_) => DataType::Integer,
            Value::String(_) => DataType::String,
            Value::Object(_) => DataType::Struct,
            Value::Array(_) => DataType::List,
        }
    }

    /// Common supertype of two column types. Incompatible types widen to string.
    pub fn unify(self, other: DataType) -> DataType {
        match (self, other) {
            (a, b) if a == b => a,
            (DataType::Null, b) => b,
            (a, DataType::Null) => a,
            (DataType::Integer, DataType::Double) | (DataType::Double, DataType::Integer) => {
                DataType::Double
            }
            _ => DataType::String,
        }
    }

    /// Infer a column type from its values.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> DataType {
        values
            .into_iter()
            .fold(DataType::Null, |acc, v| acc.unify(DataType::of(v)))
    }

    /// Parse a type name as written in configuration (`string`, `int`, `double`, ...).
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "varchar" | "text" => Ok(DataType::String),
            "int" | "integer" | "bigint" | "long" | "smallint" | "tinyint" | "int64" => {
                Ok(DataType::Integer)
            }
            "double" | "float" | "real" | "decimal" | "float64" => Ok(DataType::Double),
            "bool" | "boolean" => Ok(DataType::Boolean),
            "struct" | "map" | "object" => Ok(DataType::Struct),
            "array" | "list" => Ok(DataType::List),
            "null" | "void" => Ok(DataType::Null),
            other => Err(MedallionError::ConfigError(format!(
                "unknown data type '{other}'"
            ))),
        }
    }

    /// Cast a value to this type. Values that cannot be converted become null.
    pub fn cast(self, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match self {
            DataType::Null => Value::Null,
            DataType::Boolean => match value {
                Value::Bool(b) => Value::Bool(*b),
                Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" | "1" => Value::Bool(true),
                    "false" | "f" | "no" | "0" => Value::Bool(false),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },
            DataType::Integer => match value {
                Value::Bool(b) => Value::from(i64::from(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => Value::from(i),
                    None => float_to_int(n.as_f64()),
                },
                Value::String(s) => {
                    let s = s.trim();
                    match s.parse::<i64>() {
                        Ok(i) => Value::from(i),
                        Err(_) => float_to_int(s.parse::<f64>().ok()),
                    }
                }
                _ => Value::Null,
            },
            DataType::Double => match value {
                Value::Bool(b) => float_value(if *b { 1.0 } else { 0.0 }),
                Value::Number(n) => n.as_f64().map(float_value).unwrap_or(Value::Null),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .map(float_value)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
            DataType::String => Value::String(display_value(value)),
            DataType::Struct => match value {
                Value::Object(_) => value.clone(),
                _ => Value::Null,
            },
            DataType::List => match value {
                Value::Array(_) => value.clone(),
                _ => Value::Null,
            },
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Null => "null",
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Struct => "struct",
            DataType::List => "list",
        };
        f.write_str(name)
    }
}

fn float_to_int(f: Option<f64>) -> Value {
    match f {
        Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Value::from(f.trunc() as i64),
        _ => Value::Null,
    }
}

/// Wrap an `f64` as a JSON number; NaN and infinities become null.
pub fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Render a value the way string casts and concatenation see it.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infer_unifies_numbers() {
        let values = [json!(1), json!(null), json!(2.5)];
        assert_eq!(DataType::infer(values.iter()), DataType::Double);
        let values = [json!("a"), json!(1)];
        assert_eq!(DataType::infer(values.iter()), DataType::String);
        assert_eq!(DataType::infer(Vec::<Value>::new().iter()), DataType::Null);
    }

    #[test]
    fn parse_type_names() {
        assert_eq!(DataType::parse("BIGINT").unwrap(), DataType::Integer);
        assert_eq!(DataType::parse("float").unwrap(), DataType::Double);
        assert_eq!(DataType::parse("string").unwrap(), DataType::String);
        assert!(DataType::parse("timestamp_ntz").unwrap_err().is_config_error());
    }

    #[test]
    fn cast_values() {
        assert_eq!(DataType::Integer.cast(&json!("42")), json!(42));
        assert_eq!(DataType::Integer.cast(&json!(3.9)), json!(3));
        assert_eq!(DataType::Integer.cast(&json!("abc")), Value::Null);
        assert_eq!(DataType::Double.cast(&json!(2)), json!(2.0));
        assert_eq!(DataType::String.cast(&json!(1.5)), json!("1.5"));
        assert_eq!(DataType::Boolean.cast(&json!("TRUE")), json!(true));
        assert_eq!(DataType::Struct.cast(&json!(1)), Value::Null);
        assert_eq!(DataType::Double.cast(&Value::Null), Value::Null);
    }
}
