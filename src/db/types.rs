//! Type mappings between sqlx values and JSON.
//!
//! Decoding uses a two-phase approach: `TypeCategory` classifies a column
//! type name into a logical category, then a backend-specific decoder pulls
//! the value out of the row. Encoding goes the other way: a JSON argument
//! plus its declared [`SqlType`] become a [`SqlValue`] the driver can bind.

use crate::db::driver::DriverError;
use crate::db::params::json_type_name;
use crate::models::{DatabaseType, Row as JsonRow, SqlType};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Date,
    Time,
    DateTime,
    Timestamp,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric before the float checks; SQLite's NUMERIC affinity is a float
    if lower.contains("decimal") || lower.contains("numeric") {
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") {
        return TypeCategory::Binary;
    }

    match lower.as_str() {
        "date" => return TypeCategory::Date,
        "time" => return TypeCategory::Time,
        "datetime" => return TypeCategory::DateTime,
        "timestamp" => return TypeCategory::Timestamp,
        _ => {}
    }

    if lower.contains("char") || lower.contains("text") || lower.contains("clob") {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

/// Raw DECIMAL values as strings, preserving the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Binary column data: UTF-8 text when it is valid UTF-8, base64 otherwise.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::String(STANDARD.encode(bytes)),
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Conversion of a database row into a JSON row.
pub trait RowToJson {
    fn to_json_row(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySQL);
                (col.name().to_string(), mysql::decode_column(self, idx, category))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let declared = col.type_info().name();
                (col.name().to_string(), sqlite::decode_column(self, idx, declared))
            })
            .collect()
    }
}

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Date => decode_temporal::<NaiveDate>(row, idx, |v| v.to_string()),
            TypeCategory::Time => decode_temporal::<NaiveTime>(row, idx, |v| v.to_string()),
            TypeCategory::DateTime => decode_temporal::<NaiveDateTime>(row, idx, |v| {
                v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
            }),
            TypeCategory::Timestamp => {
                decode_temporal::<DateTime<Utc>>(row, idx, |v| v.to_rfc3339())
            }
            TypeCategory::Text | TypeCategory::Unknown => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!(column = idx, error = %e, "Failed to decode DECIMAL");
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_binary(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_temporal<T>(row: &MySqlRow, idx: usize, render: fn(T) -> String) -> JsonValue
    where
        T: for<'r> Decode<'r, sqlx::MySql> + Type<sqlx::MySql>,
    {
        match row.try_get::<Option<T>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(render(v)),
            Ok(None) => JsonValue::Null,
            // zero dates and other values chrono rejects come back as text
            Err(_) => decode_text(row, idx),
        }
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(JsonValue::String).unwrap_or(JsonValue::Null);
        }
        row.try_get_unchecked::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }
}

mod sqlite {
    use super::*;

    /// SQLite values carry their own storage class; the declared column type
    /// only refines INTEGER into booleans and TEXT into JSON.
    pub fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> JsonValue {
        let storage = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return JsonValue::Null,
            Ok(raw) => raw.type_info().name().to_uppercase(),
            Err(e) => {
                tracing::error!(column = idx, error = %e, "Failed to read SQLite value");
                return JsonValue::Null;
            }
        };
        let category = categorize_type(declared, DatabaseType::SQLite);

        match storage.as_str() {
            "INTEGER" | "BIGINT" | "INT4" | "INT8" => {
                let Ok(v) = row.try_get_unchecked::<i64, _>(idx) else {
                    return JsonValue::Null;
                };
                if category == TypeCategory::Boolean {
                    JsonValue::Bool(v != 0)
                } else {
                    JsonValue::Number(v.into())
                }
            }
            "REAL" => row
                .try_get_unchecked::<f64, _>(idx)
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            "BLOB" => row
                .try_get_unchecked::<Vec<u8>, _>(idx)
                .map(|v| decode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            _ => decode_text(row, idx, category),
        }
    }

    fn decode_text(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        let Ok(v) = row.try_get_unchecked::<String, _>(idx) else {
            return JsonValue::Null;
        };
        if category == TypeCategory::Json {
            if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                return json;
            }
        }
        JsonValue::String(v)
    }
}

/// A value ready to bind, independent of the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact numeric text, bound as a string so no precision is lost
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl SqlValue {
    /// Convert an argument to the representation its declared type binds as.
    ///
    /// Errors carry the parameter name so the caller can surface a bind error.
    pub fn from_json(
        parameter: &str,
        sql_type: SqlType,
        value: Option<&JsonValue>,
    ) -> Result<Self, DriverError> {
        let value = match value {
            None | Some(JsonValue::Null) => return Ok(SqlValue::Null),
            Some(v) => v,
        };
        let mismatch = || {
            DriverError::bind(
                parameter,
                format!("cannot bind {} as {}", json_type_name(value), sql_type),
            )
        };

        let converted = match sql_type {
            SqlType::Bit => match value {
                JsonValue::Bool(b) => SqlValue::Bool(*b),
                JsonValue::Number(n) => SqlValue::Bool(n.as_f64().is_some_and(|n| n != 0.0)),
                JsonValue::String(s) if s == "true" || s == "1" => SqlValue::Bool(true),
                JsonValue::String(s) if s == "false" || s == "0" => SqlValue::Bool(false),
                _ => return Err(mismatch()),
            },
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Int | SqlType::BigInt => {
                match value {
                    JsonValue::Number(n) => match n.as_i64() {
                        Some(i) => SqlValue::Int(i),
                        None => match n.as_f64() {
                            Some(f) if f.fract() == 0.0 => SqlValue::Int(f as i64),
                            _ => return Err(mismatch()),
                        },
                    },
                    JsonValue::Bool(b) => SqlValue::Int(i64::from(*b)),
                    JsonValue::String(s) => s.trim().parse().map(SqlValue::Int).map_err(|_| {
                        DriverError::bind(parameter, format!("'{}' is not an integer", s))
                    })?,
                    _ => return Err(mismatch()),
                }
            }
            SqlType::Float | SqlType::Real => match value {
                JsonValue::Number(n) => SqlValue::Float(n.as_f64().ok_or_else(mismatch)?),
                JsonValue::String(s) => s.trim().parse().map(SqlValue::Float).map_err(|_| {
                    DriverError::bind(parameter, format!("'{}' is not a number", s))
                })?,
                _ => return Err(mismatch()),
            },
            SqlType::Decimal { .. } => match value {
                JsonValue::Number(n) => SqlValue::Decimal(n.to_string()),
                JsonValue::String(s) => SqlValue::Decimal(s.clone()),
                _ => return Err(mismatch()),
            },
            SqlType::VarBinary(_) => match value {
                JsonValue::String(s) => STANDARD
                    .decode(s)
                    .map(SqlValue::Bytes)
                    .map_err(|e| DriverError::bind(parameter, format!("invalid base64: {}", e)))?,
                JsonValue::Array(items) => SqlValue::Bytes(
                    items
                        .iter()
                        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                        .collect::<Option<Vec<u8>>>()
                        .ok_or_else(mismatch)?,
                ),
                _ => return Err(mismatch()),
            },
            SqlType::Json => SqlValue::Json(value.clone()),
            // text, temporal and identifier types bind as text
            _ => match value {
                JsonValue::String(s) => SqlValue::String(s.clone()),
                JsonValue::Number(_) | JsonValue::Bool(_) => SqlValue::String(value.to_string()),
                _ => return Err(mismatch()),
            },
        };
        Ok(converted)
    }
}
