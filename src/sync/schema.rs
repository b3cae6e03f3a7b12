// ABOUTME: Column metadata snapshots and the source/destination compatibility check
// ABOUTME: Missing destination columns block a sync; type and nullability drift only warn

use super::table::TableName;

/// Declared source/destination type pairs that are accepted without a
/// warning in addition to exact matches. Compared case-insensitively.
///
/// Variable-width text in either storage flavour, and narrower integers
/// written into wider ones.
const COMPATIBLE_TYPES: &[(&str, &str)] = &[
    ("varchar", "nvarchar"),
    ("nvarchar", "varchar"),
    ("character varying", "text"),
    ("text", "character varying"),
    ("int", "bigint"),
    ("integer", "bigint"),
    ("smallint", "integer"),
    ("smallint", "bigint"),
];

/// Metadata for a single column, read from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub max_length: Option<i32>,
    pub numeric_precision: Option<i32>,
    pub numeric_scale: Option<i32>,
}

impl ColumnInfo {
    pub fn new(name: &str, data_type: &str, is_nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            is_nullable,
            max_length: None,
            numeric_precision: None,
            numeric_scale: None,
        }
    }
}

/// Columns of one table keyed by name, in physical ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Outcome of comparing a source table with its destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaValidationResult {
    pub is_valid: bool,
    /// Set only when `is_valid` is false.
    pub error_message: Option<String>,
    /// Non-blocking findings, in the order they were found.
    pub warnings: Vec<String>,
}

impl SchemaValidationResult {
    fn valid() -> Self {
        Self {
            is_valid: true,
            error_message: None,
            warnings: Vec::new(),
        }
    }

    fn invalid(mut self, message: String) -> Self {
        self.is_valid = false;
        self.error_message = Some(message);
        self
    }
}

/// Whether `source_type` may be written into a `dest_type` column without a
/// warning.
pub fn types_compatible(source_type: &str, dest_type: &str) -> bool {
    if source_type.eq_ignore_ascii_case(dest_type) {
        return true;
    }
    COMPATIBLE_TYPES.iter().any(|(s, d)| {
        s.eq_ignore_ascii_case(source_type) && d.eq_ignore_ascii_case(dest_type)
    })
}

/// Compare source and destination column sets.
///
/// Every source column must exist in the destination; the first missing one
/// ends validation with an error. Type mismatches outside
/// [`types_compatible`], nullability narrowing, and destination-only columns
/// are collected as warnings.
pub fn check_compatibility(
    source_table: &TableName,
    source: &TableSchema,
    destination_table: &TableName,
    destination: &TableSchema,
) -> SchemaValidationResult {
    let mut result = SchemaValidationResult::valid();

    if source.is_empty() {
        return result.invalid(format!(
            "No columns found for source table '{}'. The table may not exist or could not be inspected.",
            source_table
        ));
    }

    for column in source.iter() {
        let Some(dest_column) = destination.get(&column.name) else {
            return result.invalid(format!(
                "Column '{}' exists in source table '{}' but not in destination table '{}'.",
                column.name, source_table, destination_table
            ));
        };

        if !types_compatible(&column.data_type, &dest_column.data_type) {
            result.warnings.push(format!(
                "Data type mismatch for column '{}': source is {}, destination is {}.",
                column.name, column.data_type, dest_column.data_type
            ));
        }

        if column.is_nullable && !dest_column.is_nullable {
            result.warnings.push(format!(
                "Nullability mismatch for column '{}': source allows NULL, but destination does not.",
                column.name
            ));
        }
    }

    for dest_column in destination.iter() {
        if !source.contains(&dest_column.name) {
            result.warnings.push(format!(
                "Column '{}' exists in destination table '{}' but not in source table '{}'. This column will not be synchronized.",
                dest_column.name, destination_table, source_table
            ));
        }
    }

    result
}
