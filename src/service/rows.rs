//! Row decoding into JSON, driven by each field's canonical type.
//!
//! SQL NULL becomes JSON `null`. A value that cannot be decoded as its field's type is an
//! upstream failure, never a silent `null`.

use crate::error::{AppError, UpstreamCode};
use crate::synth::FieldDef;
use crate::typemap::CanonicalType;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::Row;

macro_rules! cell {
    ($row:expr, $name:expr, $t:ty) => {
        $row.try_get::<Option<$t>, _>($name)
    };
}

macro_rules! row_to_json {
    ($row:expr, $fields:expr) => {{
        let row = $row;
        let mut map = Map::with_capacity($fields.len());
        for f in $fields {
            let name = f.name.as_str();
            let decoded = match &f.canonical {
                CanonicalType::Int64 => cell!(row, name, i64).map(|v| v.map(|n| Value::Number(n.into()))),
                CanonicalType::Float64 => {
                    cell!(row, name, f64).map(|v| v.and_then(serde_json::Number::from_f64).map(Value::Number))
                }
                CanonicalType::Bool => or_alternative(cell!(row, name, bool).map(|v| v.map(Value::Bool)), || {
                    cell!(row, name, i64).map(|v| v.map(|n| Value::Bool(n != 0)))
                }),
                CanonicalType::Text | CanonicalType::Enum(_) => cell!(row, name, String).map(|v| v.map(Value::String)),
                CanonicalType::Timestamp => {
                    let first = cell!(row, name, DateTime<Utc>).map(|v| v.map(|d| d.to_rfc3339()));
                    let text = or_alternative(first, || {
                        cell!(row, name, NaiveDateTime).map(|v| v.map(|d| d.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                    });
                    let text = or_alternative(text, || {
                        cell!(row, name, NaiveDate).map(|v| v.map(|d| d.format("%Y-%m-%d").to_string()))
                    });
                    let text = or_alternative(text, || {
                        cell!(row, name, NaiveTime).map(|v| v.map(|t| t.format("%H:%M:%S%.f").to_string()))
                    });
                    or_alternative(text, || cell!(row, name, String)).map(|v| v.map(Value::String))
                }
                CanonicalType::Json => cell!(row, name, Value),
                CanonicalType::Binary => cell!(row, name, Vec<u8>)
                    .map(|v| v.map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b)))),
            };
            let v = decoded.map_err(|e| decode_failure(f, e))?;
            map.insert(f.name.clone(), v.unwrap_or(Value::Null));
        }
        Ok(Value::Object(map))
    }};
}

pub fn pg_row_to_json(row: &PgRow, fields: &[FieldDef]) -> Result<Value, AppError> {
    row_to_json!(row, fields)
}

pub fn mysql_row_to_json(row: &MySqlRow, fields: &[FieldDef]) -> Result<Value, AppError> {
    row_to_json!(row, fields)
}

/// Falls back to `alt` when `first` fails; keeps the first error if both do.
fn or_alternative<T>(
    first: Result<T, sqlx::Error>,
    alt: impl FnOnce() -> Result<T, sqlx::Error>,
) -> Result<T, sqlx::Error> {
    first.or_else(|e| alt().map_err(|_| e))
}

fn decode_failure(f: &FieldDef, err: sqlx::Error) -> AppError {
    tracing::warn!(field = %f.name, native_type = %f.native_type, error = %err, "column decode failed");
    AppError::upstream(
        UpstreamCode::QueryFailed,
        format!("decoding column '{}' ({}): {}", f.name, f.native_type, err),
    )
}
