//! Table schema and record validation

use super::value::{Record, Value};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name of the primary key column every schema must declare.
pub const ID_COLUMN: &str = "id";

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int64,
    Float64,
    Utf8,
    Boolean,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Utf8 => "utf8",
            DataType::Boolean => "boolean",
        };
        write!(f, "{}", name)
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
}

impl Field {
    /// Non-nullable column
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }

    /// Nullable column
    pub fn nullable(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// Ordered list of columns. Immutable for the lifetime of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Build a schema, requiring a non-nullable `id: int64` column and
    /// unique column names.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::SchemaMismatch(format!(
                    "Duplicate column '{}'",
                    field.name
                )));
            }
        }

        match fields.iter().find(|f| f.name == ID_COLUMN) {
            Some(f) if f.data_type == DataType::Int64 && !f.nullable => {}
            Some(f) => {
                return Err(Error::SchemaMismatch(format!(
                    "Column 'id' must be a non-nullable int64, found {}",
                    f.data_type
                )))
            }
            None => {
                return Err(Error::SchemaMismatch(
                    "Schema must declare an 'id' column".to_string(),
                ))
            }
        }

        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Column names in schema order
    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Validate and normalize a record against this schema.
    ///
    /// The result holds exactly the schema's columns. Unknown columns and
    /// missing non-nullable columns are rejected, missing nullable columns
    /// become `Null`, integers are widened for float columns. When
    /// `allow_missing_id` is set the `id` column may be absent (it is then
    /// left out of the result for the caller to assign).
    pub fn conform(&self, mut record: Record, allow_missing_id: bool) -> Result<Record> {
        if let Some(unknown) = record.keys().find(|k| self.field(k).is_none()) {
            return Err(Error::SchemaMismatch(format!("Unknown column '{}'", unknown)));
        }

        let mut out = Record::new();
        for field in &self.fields {
            let value = record.remove(&field.name).unwrap_or(Value::Null);
            if value.is_null() {
                if field.name == ID_COLUMN && allow_missing_id {
                    continue;
                }
                if !field.nullable {
                    return Err(Error::SchemaMismatch(format!(
                        "Missing value for column '{}'",
                        field.name
                    )));
                }
                out.insert(field.name.clone(), Value::Null);
                continue;
            }
            out.insert(field.name.clone(), coerce(field, value)?);
        }
        Ok(out)
    }

    /// Parse a textual literal for the given column
    pub fn parse_value(&self, column: &str, text: &str) -> Result<Value> {
        let field = self
            .field(column)
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown column '{}'", column)))?;

        if field.nullable && text == "null" {
            return Ok(Value::Null);
        }

        let invalid = || {
            Error::InvalidArgument(format!(
                "Cannot parse '{}' as {} for column '{}'",
                text, field.data_type, column
            ))
        };
        match field.data_type {
            DataType::Int64 => text.parse().map(Value::Int).map_err(|_| invalid()),
            DataType::Float64 => text
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float)
                .ok_or_else(invalid),
            DataType::Boolean => text.parse().map(Value::Bool).map_err(|_| invalid()),
            DataType::Utf8 => Ok(Value::String(text.to_string())),
        }
    }

    /// Values of a record in schema order
    pub fn row_of(&self, record: &Record) -> Vec<Value> {
        self.fields
            .iter()
            .map(|f| record.get(&f.name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

fn coerce(field: &Field, value: Value) -> Result<Value> {
    match (field.data_type, value) {
        (DataType::Int64, v @ Value::Int(_)) => Ok(v),
        (DataType::Float64, Value::Float(f)) if !f.is_finite() => Err(Error::SchemaMismatch(format!(
            "Column '{}' only stores finite floats, got {}",
            field.name, f
        ))),
        (DataType::Float64, v @ Value::Float(_)) => Ok(v),
        (DataType::Float64, Value::Int(n)) => Ok(Value::Float(n as f64)),
        (DataType::Utf8, v @ Value::String(_)) => Ok(v),
        (DataType::Boolean, v @ Value::Bool(_)) => Ok(v),
        (data_type, v) => Err(Error::SchemaMismatch(format!(
            "Column '{}' expects {}, got {:?}",
            field.name, data_type, v
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::record;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("amount", DataType::Float64),
            Field::new("description", DataType::Utf8),
            Field::nullable("note", DataType::Utf8),
        ])
        .unwrap()
    }

    #[test]
    fn test_schema_requires_id() {
        let err = Schema::new(vec![Field::new("name", DataType::Utf8)]).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));

        let err = Schema::new(vec![Field::new("id", DataType::Utf8)]).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));

        let err = Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("id", DataType::Int64),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn test_conform_fills_and_coerces() -> Result<()> {
        let rec = record([
            ("id", Value::Int(1)),
            ("amount", Value::Int(10)),
            ("description", Value::from("rent")),
        ]);
        let out = schema().conform(rec, false)?;
        assert_eq!(out.get("amount"), Some(&Value::Float(10.0)));
        assert_eq!(out.get("note"), Some(&Value::Null));
        assert_eq!(out.len(), 4);
        Ok(())
    }

    #[test]
    fn test_conform_rejects_bad_shapes() {
        let s = schema();

        let unknown = record([
            ("id", Value::Int(1)),
            ("amount", Value::Float(1.0)),
            ("description", Value::from("x")),
            ("color", Value::from("red")),
        ]);
        assert!(matches!(s.conform(unknown, false), Err(Error::SchemaMismatch(_))));

        let missing = record([("id", Value::Int(1)), ("amount", Value::Float(1.0))]);
        assert!(matches!(s.conform(missing, false), Err(Error::SchemaMismatch(_))));

        let wrong_type = record([
            ("id", Value::Int(1)),
            ("amount", Value::from("ten")),
            ("description", Value::from("x")),
        ]);
        assert!(matches!(s.conform(wrong_type, false), Err(Error::SchemaMismatch(_))));
    }

    #[test]
    fn test_conform_missing_id() -> Result<()> {
        let s = schema();
        let rec = record([("amount", Value::Float(1.0)), ("description", Value::from("x"))]);
        assert!(s.conform(rec.clone(), false).is_err());
        let out = s.conform(rec, true)?;
        assert!(!out.contains_key("id"));
        Ok(())
    }

    #[test]
    fn test_parse_value() -> Result<()> {
        let s = schema();
        assert_eq!(s.parse_value("id", "42")?, Value::Int(42));
        assert_eq!(s.parse_value("amount", "2.5")?, Value::Float(2.5));
        assert_eq!(s.parse_value("note", "null")?, Value::Null);
        assert!(s.parse_value("id", "abc").is_err());
        assert!(s.parse_value("missing", "1").is_err());
        assert!(s.parse_value("amount", "inf").is_err());
        assert!(s.parse_value("amount", "NaN").is_err());
        Ok(())
    }

    #[test]
    fn test_conform_rejects_non_finite_floats() {
        let s = schema();
        for bad in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let rec = record([
                ("id", Value::Int(1)),
                ("amount", Value::Float(bad)),
                ("description", Value::from("x")),
            ]);
            assert!(matches!(s.conform(rec, false), Err(Error::SchemaMismatch(_))));
        }
    }
}
