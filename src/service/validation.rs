//! Request validation: coerces JSON bodies and query-string values into bind values
//! according to each field's canonical type.

use crate::error::AppError;
use crate::registry::DatabaseKind;
use crate::sql::BindValue;
use crate::synth::{FieldDef, ResourceDefinition};
use crate::typemap::CanonicalType;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value};

pub struct RequestValidator;

impl RequestValidator {
    /// Values for an INSERT. Every field required on create must be present; unknown fields are rejected.
    pub fn create_values(
        res: &ResourceDefinition,
        dialect: DatabaseKind,
        body: &Map<String, Value>,
    ) -> Result<Vec<(String, BindValue)>, AppError> {
        reject_unknown(res, body)?;
        let mut out = Vec::with_capacity(body.len());
        for f in &res.fields {
            match body.get(&f.name) {
                Some(v) => out.push((f.name.clone(), coerce_column_value(f, dialect, v)?)),
                None if f.required_on_create => {
                    return Err(AppError::validation(f.name.clone(), "is required"));
                }
                None => {}
            }
        }
        Ok(out)
    }

    /// Values for an UPDATE. Only the fields present are set; the primary key cannot change.
    pub fn patch_values(
        res: &ResourceDefinition,
        dialect: DatabaseKind,
        body: &Map<String, Value>,
    ) -> Result<Vec<(String, BindValue)>, AppError> {
        reject_unknown(res, body)?;
        let mut out = Vec::with_capacity(body.len());
        for f in &res.fields {
            let Some(v) = body.get(&f.name) else { continue };
            if f.primary_key {
                return Err(AppError::validation(f.name.clone(), "primary key cannot be updated"));
            }
            out.push((f.name.clone(), coerce_column_value(f, dialect, v)?));
        }
        if out.is_empty() {
            return Err(AppError::validation("body", "no fields to update"));
        }
        Ok(out)
    }

    /// Value from the URL path or query string.
    pub fn coerce_text(f: &FieldDef, dialect: DatabaseKind, raw: &str) -> Result<BindValue, AppError> {
        let bad = |what: &str| AppError::validation(f.name.clone(), format!("expected {}, got '{}'", what, raw));
        match &f.canonical {
            CanonicalType::Int64 => {
                let n = raw.trim().parse::<i64>().map_err(|_| bad("an integer"))?;
                integer(f, dialect, n)
            }
            CanonicalType::Float64 => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(BindValue::F64)
                .ok_or_else(|| bad("a number")),
            CanonicalType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(BindValue::Bool(true)),
                "false" | "0" => Ok(BindValue::Bool(false)),
                _ => Err(bad("a boolean")),
            },
            CanonicalType::Text => {
                reject_nul(f, raw)?;
                Ok(BindValue::Text(raw.to_string()))
            }
            CanonicalType::Enum(labels) => enum_label(f, labels, raw),
            CanonicalType::Timestamp => timestamp(f, dialect, raw),
            CanonicalType::Json => {
                let v: Value = serde_json::from_str(raw).map_err(|_| bad("JSON"))?;
                json_document(f, v)
            }
            CanonicalType::Binary => base64::engine::general_purpose::STANDARD
                .decode(raw)
                .map(BindValue::Bytes)
                .map_err(|_| bad("base64")),
        }
    }

    /// Value from a JSON body or GraphQL argument. `null` passes through.
    pub fn coerce_json(f: &FieldDef, dialect: DatabaseKind, v: &Value) -> Result<BindValue, AppError> {
        let bad = |what: &str| AppError::validation(f.name.clone(), format!("expected {}", what));
        match (&f.canonical, v) {
            (_, Value::Null) => Ok(BindValue::Null),
            (CanonicalType::Json, v) => json_document(f, v.clone()),
            (CanonicalType::Int64, Value::Number(n)) => {
                let n = n.as_i64().ok_or_else(|| bad("an integer"))?;
                integer(f, dialect, n)
            }
            (CanonicalType::Float64, Value::Number(n)) => n.as_f64().map(BindValue::F64).ok_or_else(|| bad("a number")),
            (CanonicalType::Bool, Value::Bool(b)) => Ok(BindValue::Bool(*b)),
            (CanonicalType::Int64 | CanonicalType::Float64 | CanonicalType::Bool, Value::String(s)) => {
                Self::coerce_text(f, dialect, s)
            }
            (
                CanonicalType::Text | CanonicalType::Enum(_) | CanonicalType::Timestamp | CanonicalType::Binary,
                Value::String(s),
            ) => Self::coerce_text(f, dialect, s),
            (t, _) => Err(bad(match t {
                CanonicalType::Int64 => "an integer",
                CanonicalType::Float64 => "a number",
                CanonicalType::Bool => "a boolean",
                CanonicalType::Binary => "a base64 string",
                CanonicalType::Timestamp => "a timestamp string",
                _ => "a string",
            })),
        }
    }
}

fn reject_unknown(res: &ResourceDefinition, body: &Map<String, Value>) -> Result<(), AppError> {
    match body.keys().find(|k| res.field(k).is_none()) {
        Some(k) => Err(AppError::validation(k.clone(), format!("unknown field on '{}'", res.name))),
        None => Ok(()),
    }
}

fn coerce_column_value(f: &FieldDef, dialect: DatabaseKind, v: &Value) -> Result<BindValue, AppError> {
    let value = RequestValidator::coerce_json(f, dialect, v)?;
    if value.is_null() && !f.nullable {
        return Err(AppError::validation(f.name.clone(), "must not be null"));
    }
    Ok(value)
}

fn integer(f: &FieldDef, dialect: DatabaseKind, n: i64) -> Result<BindValue, AppError> {
    match integer_range(dialect, &f.native_type) {
        Some((lo, hi)) if n < lo || n > hi => Err(AppError::validation(
            f.name.clone(),
            format!("{} is out of range for {} ({}..={})", n, f.native_type, lo, hi),
        )),
        _ => Ok(BindValue::I64(n)),
    }
}

/// Bounds of the column's native integer type; `None` when any i64 fits.
fn integer_range(dialect: DatabaseKind, native: &str) -> Option<(i64, i64)> {
    let native = native.trim().to_ascii_lowercase();
    let (base, unsigned) = match native.strip_suffix(" unsigned") {
        Some(base) => (base, true),
        None => (native.as_str(), false),
    };
    let i16_range = (i64::from(i16::MIN), i64::from(i16::MAX));
    let i32_range = (i64::from(i32::MIN), i64::from(i32::MAX));
    match dialect {
        DatabaseKind::Postgres => match base {
            "smallint" | "int2" => Some(i16_range),
            "integer" | "int" | "int4" => Some(i32_range),
            _ => None,
        },
        DatabaseKind::MySql => match (base, unsigned) {
            ("tinyint", false) => Some((-128, 127)),
            ("tinyint", true) => Some((0, 255)),
            ("smallint", false) => Some(i16_range),
            ("smallint", true) => Some((0, i64::from(u16::MAX))),
            ("mediumint", false) => Some((-8_388_608, 8_388_607)),
            ("mediumint", true) => Some((0, 16_777_215)),
            ("int" | "integer", false) => Some(i32_range),
            ("int" | "integer", true) => Some((0, i64::from(u32::MAX))),
            ("bigint", true) => Some((0, i64::MAX)),
            _ => None,
        },
    }
}

fn reject_nul(f: &FieldDef, s: &str) -> Result<(), AppError> {
    if s.contains('\0') {
        return Err(AppError::validation(f.name.clone(), "must not contain NUL characters"));
    }
    Ok(())
}

fn json_document(f: &FieldDef, v: Value) -> Result<BindValue, AppError> {
    fn has_nul(v: &Value) -> bool {
        match v {
            Value::String(s) => s.contains('\0'),
            Value::Array(items) => items.iter().any(has_nul),
            Value::Object(m) => m.iter().any(|(k, v)| k.contains('\0') || has_nul(v)),
            _ => false,
        }
    }
    if has_nul(&v) {
        return Err(AppError::validation(f.name.clone(), "must not contain NUL characters"));
    }
    Ok(BindValue::Json(v))
}

fn enum_label(f: &FieldDef, labels: &[String], raw: &str) -> Result<BindValue, AppError> {
    if labels.iter().any(|l| l == raw) {
        Ok(BindValue::Text(raw.to_string()))
    } else {
        Err(AppError::validation(
            f.name.clone(),
            format!("'{}' is not one of {}", raw, labels.join(", ")),
        ))
    }
}

/// Accepts RFC 3339, naive date-times, dates and times. PostgreSQL parses the text itself;
/// MySQL gets offset-carrying values normalized to UTC.
fn timestamp(f: &FieldDef, dialect: DatabaseKind, raw: &str) -> Result<BindValue, AppError> {
    let raw = raw.trim();
    if let Ok(d) = DateTime::parse_from_rfc3339(raw) {
        return Ok(BindValue::Text(match dialect {
            DatabaseKind::Postgres => raw.to_string(),
            DatabaseKind::MySql => d.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        }));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(d) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(BindValue::Text(d.format("%Y-%m-%d %H:%M:%S%.f").to_string()));
        }
    }
    if NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() || NaiveTime::parse_from_str(raw, "%H:%M:%S%.f").is_ok() {
        return Ok(BindValue::Text(raw.to_string()));
    }
    Err(AppError::validation(
        f.name.clone(),
        format!("expected a timestamp, got '{}'", raw),
    ))
}
