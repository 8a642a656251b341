//! Row predicates
//!
//! Predicates are used both for reads (scan filters) and for logical deletes,
//! where they are persisted in the commit log. Besides per-row evaluation a
//! predicate can be checked against a file's partition values and column
//! statistics, which lets scans skip whole files.

use super::data_file::FileMeta;
use super::schema::{Schema, ID_COLUMN};
use super::value::{Record, Value};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A row filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `column = value`
    Eq { column: String, value: Value },
    /// Every inner predicate holds
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// `id = target`
    pub fn id(target: i64) -> Self {
        Self::eq(ID_COLUMN, target)
    }

    /// Parse `col=value[,col=value...]` using the column types of `schema`
    pub fn parse(schema: &Schema, text: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (column, literal) = part.split_once('=').ok_or_else(|| {
                Error::InvalidArgument(format!("Expected column=value, got '{}'", part))
            })?;
            let column = column.trim();
            terms.push(Self::eq(column, schema.parse_value(column, literal.trim())?));
        }

        match terms.len() {
            0 => Err(Error::InvalidArgument("Empty filter".to_string())),
            1 => Ok(terms.remove(0)),
            _ => Ok(Predicate::And(terms)),
        }
    }

    /// Reject predicates that name columns outside the schema
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        match self {
            Predicate::Eq { column, .. } => {
                if schema.field(column).is_none() {
                    return Err(Error::InvalidArgument(format!(
                        "Unknown column '{}' in predicate",
                        column
                    )));
                }
                Ok(())
            }
            Predicate::And(inner) => inner.iter().try_for_each(|p| p.validate(schema)),
        }
    }

    /// Evaluate against one record
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::Eq { column, value } => record
                .get(column)
                .map(|v| v.loosely_equals(value))
                .unwrap_or(false),
            Predicate::And(inner) => inner.iter().all(|p| p.matches(record)),
        }
    }

    /// `false` only when no row of the file can match.
    pub fn may_match(&self, file: &FileMeta) -> bool {
        match self {
            Predicate::Eq { column, value } => {
                if let Some(part) = file.partition_values.get(column) {
                    return part.loosely_equals(value);
                }
                match file.stats.get(column) {
                    Some(stats) => match (&stats.min, &stats.max) {
                        (Some(min), Some(max)) => {
                            value.same_kind(min)
                                && value.total_cmp(min).is_ge()
                                && value.total_cmp(max).is_le()
                        }
                        // All nulls: an equality never holds
                        _ => false,
                    },
                    None => true,
                }
            }
            Predicate::And(inner) => inner.iter().all(|p| p.may_match(file)),
        }
    }

    /// `true` only when every row of the file certainly matches.
    pub fn covers(&self, file: &FileMeta) -> bool {
        match self {
            Predicate::Eq { column, value } => {
                if let Some(part) = file.partition_values.get(column) {
                    return part.loosely_equals(value);
                }
                match file.stats.get(column) {
                    Some(stats) => {
                        stats.null_count == 0
                            && matches!(
                                (&stats.min, &stats.max),
                                (Some(min), Some(max))
                                    if min.loosely_equals(value) && max.loosely_equals(value)
                            )
                    }
                    None => false,
                }
            }
            Predicate::And(inner) => inner.iter().all(|p| p.covers(file)),
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Eq { column, value } => write!(f, "{} = {}", column, value),
            Predicate::And(inner) => {
                for (i, p) in inner.iter().enumerate() {
                    if i > 0 {
                        write!(f, " AND ")?;
                    }
                    write!(f, "{}", p)?;
                }
                Ok(())
            }
        }
    }
}
