//! Entities of the personal finance application
//!
//! Each entity owns one table named after it and one id sequence.

use crate::error::Result;
use crate::storage::schema::{DataType, Field, Schema, ID_COLUMN};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Transactions,
    Accounts,
    Categories,
    Users,
}

impl Entity {
    pub fn all() -> [Entity; 4] {
        [
            Entity::Transactions,
            Entity::Accounts,
            Entity::Categories,
            Entity::Users,
        ]
    }

    /// Table and sequence name
    pub fn name(&self) -> &'static str {
        match self {
            Entity::Transactions => "transactions",
            Entity::Accounts => "accounts",
            Entity::Categories => "categories",
            Entity::Users => "users",
        }
    }

    pub fn schema(&self) -> Result<Schema> {
        let id = Field::new(ID_COLUMN, DataType::Int64);
        let fields = match self {
            Entity::Transactions => vec![
                id,
                Field::new("description", DataType::Utf8),
                Field::new("amount", DataType::Float64),
                // ISO-8601 date
                Field::new("date", DataType::Utf8),
                Field::new("type", DataType::Utf8),
                Field::new("account_id", DataType::Int64),
                Field::new("category_id", DataType::Int64),
                Field::new("user_id", DataType::Int64),
            ],
            Entity::Accounts => vec![
                id,
                Field::new("name", DataType::Utf8),
                Field::new("type", DataType::Utf8),
                Field::new("initial_balance", DataType::Float64),
                Field::new("user_id", DataType::Int64),
            ],
            Entity::Categories => vec![
                id,
                Field::new("name", DataType::Utf8),
                Field::new("kind", DataType::Utf8),
                Field::new("user_id", DataType::Int64),
            ],
            Entity::Users => vec![
                id,
                Field::new("name", DataType::Utf8),
                Field::new("email", DataType::Utf8),
                Field::new("password_hash", DataType::Utf8),
                Field::new("created_at", DataType::Utf8),
            ],
        };
        Schema::new(fields)
    }

    /// Partition columns; the application's tables are unpartitioned
    pub fn partition_by(&self) -> Vec<String> {
        Vec::new()
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_schema_is_valid() -> Result<()> {
        for entity in Entity::all() {
            let schema = entity.schema()?;
            assert_eq!(schema.fields()[0].name, ID_COLUMN);
            crate::storage::table::validate_name(entity.name())?;
        }
        assert_eq!(Entity::Transactions.schema()?.fields().len(), 8);
        Ok(())
    }
}
