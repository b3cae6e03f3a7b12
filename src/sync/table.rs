// ABOUTME: Validated schema-qualified table names
// ABOUTME: Parses "schema.table" or "table" and renders quoted SQL identifiers

use anyhow::{bail, Context, Result};
use std::fmt;

use crate::utils::{quote_ident, validate_identifier};

/// Schema used when a job names a table without qualification.
pub const DEFAULT_SCHEMA: &str = "public";

/// A table name whose parts have passed the identifier allow-list and are
/// therefore safe to interpolate (quoted) into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    schema: String,
    name: String,
}

impl TableName {
    pub fn new(schema: &str, name: &str) -> Result<Self> {
        validate_identifier(schema).context("invalid schema name")?;
        validate_identifier(name).context("invalid table name")?;
        Ok(Self {
            schema: schema.to_string(),
            name: name.to_string(),
        })
    }

    /// Parse `schema.table` or `table` (schema defaults to `public`).
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let parts: Vec<&str> = value.split('.').collect();
        match parts.as_slice() {
            [name] => Self::new(DEFAULT_SCHEMA, name),
            [schema, name] => Self::new(schema, name),
            _ => bail!("table name '{}' must be 'table' or 'schema.table'", value),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"schema"."table"`
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}
