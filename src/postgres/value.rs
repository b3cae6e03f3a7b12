// ABOUTME: Conversion between tokio-postgres rows/parameters and owned SqlValues
// ABOUTME: Decodes by the result column type and binds by the statement parameter type

use anyhow::{anyhow, bail, Context, Result};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Row;

use crate::sync::value::SqlValue;

/// Decode column `idx` of `row` using the column's wire type.
///
/// Types with no lossless owned representation are rejected rather than read
/// as NULL, so a batch never silently drops data.
pub fn decode_value(row: &Row, idx: usize) -> Result<SqlValue> {
    let column = row
        .columns()
        .get(idx)
        .ok_or_else(|| anyhow!("result has no column at position {}", idx))?;
    let name = column.name();

    let value = match column.type_().name() {
        "bool" => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(SqlValue::Bool)),
        "int2" => row.try_get::<_, Option<i16>>(idx).map(|v| v.map(SqlValue::Int16)),
        "int4" => row.try_get::<_, Option<i32>>(idx).map(|v| v.map(SqlValue::Int32)),
        "int8" => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(SqlValue::Int64)),
        "float4" => row.try_get::<_, Option<f32>>(idx).map(|v| v.map(SqlValue::Float32)),
        "float8" => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(SqlValue::Float64)),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .map(|v| v.map(SqlValue::Decimal)),
        "text" | "varchar" | "bpchar" | "name" | "citext" => row
            .try_get::<_, Option<String>>(idx)
            .map(|v| v.map(SqlValue::Text)),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map(|v| v.map(SqlValue::Uuid)),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| v.map(SqlValue::Timestamp)),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| v.map(SqlValue::TimestampTz)),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map(|v| v.map(SqlValue::Date)),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map(|v| v.map(SqlValue::Json)),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .map(|v| v.map(SqlValue::Bytes)),
        other => bail!("column '{}' has unsupported type '{}'", name, other),
    };

    let value = value.with_context(|| format!("Failed to decode column '{}'", name))?;
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Box `value` as a parameter accepted by a slot of type `ty`.
///
/// Integers widen, timestamps without zone bind to `timestamptz` as UTC, and
/// any value binds to a text slot through its display form. NULL is bound
/// with the slot's own Rust type so the driver's type check passes.
pub fn to_param(value: &SqlValue, ty: &Type) -> Result<Box<dyn ToSql + Sync + Send>> {
    let param: Box<dyn ToSql + Sync + Send> = match ty.name() {
        "bool" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Bool(v) => Some(*v),
            other => return Err(mismatch(other, ty)),
        }),
        "int2" => {
            let v = integer(value, ty)?
                .map(i16::try_from)
                .transpose()
                .with_context(|| format!("value {} out of range for {}", value, ty))?;
            Box::new(v)
        }
        "int4" => {
            let v = integer(value, ty)?
                .map(i32::try_from)
                .transpose()
                .with_context(|| format!("value {} out of range for {}", value, ty))?;
            Box::new(v)
        }
        "int8" => Box::new(integer(value, ty)?),
        "float4" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Float32(v) => Some(*v),
            other => return Err(mismatch(other, ty)),
        }),
        "float8" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Float32(v) => Some(f64::from(*v)),
            SqlValue::Float64(v) => Some(*v),
            other => return Err(mismatch(other, ty)),
        }),
        "numeric" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Decimal(v) => Some(*v),
            other => match other.as_i64() {
                Some(i) => Some(rust_decimal::Decimal::from(i)),
                None => return Err(mismatch(other, ty)),
            },
        }),
        "text" | "varchar" | "bpchar" | "name" | "citext" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Text(v) => Some(v.clone()),
            other => Some(other.to_string()),
        }),
        "uuid" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Uuid(v) => Some(*v),
            other => return Err(mismatch(other, ty)),
        }),
        "timestamp" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Timestamp(v) => Some(*v),
            other => return Err(mismatch(other, ty)),
        }),
        "timestamptz" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::TimestampTz(v) => Some(*v),
            SqlValue::Timestamp(v) => Some(v.and_utc()),
            other => return Err(mismatch(other, ty)),
        }),
        "date" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Date(v) => Some(*v),
            other => return Err(mismatch(other, ty)),
        }),
        "json" | "jsonb" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Json(v) => Some(v.clone()),
            other => return Err(mismatch(other, ty)),
        }),
        "bytea" => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Bytes(v) => Some(v.clone()),
            other => return Err(mismatch(other, ty)),
        }),
        other => bail!("unsupported destination type '{}'", other),
    };
    Ok(param)
}

fn integer(value: &SqlValue, ty: &Type) -> Result<Option<i64>> {
    if value.is_null() {
        return Ok(None);
    }
    value
        .as_i64()
        .map(Some)
        .ok_or_else(|| mismatch(value, ty))
}

fn mismatch(value: &SqlValue, ty: &Type) -> anyhow::Error {
    anyhow!("cannot bind {} value to parameter of type {}", value.kind(), ty)
}
