//! Canonical type vocabulary and per-dialect mapping tables.
//!
//! Every column the introspector reports is mapped onto one [`CanonicalType`]. The
//! canonical type drives request coercion, the filter operators a field accepts,
//! whether it can be sorted on and how it is rendered in responses.
//!
//! ```text
//! postgres  "character varying" ─┐
//! mysql     "varchar(255)"      ─┴→ Text
//! postgres  "integer"           ─┐
//! mysql     "int(11) unsigned"  ─┴→ Int64
//! ```
//!
//! Unknown scalar types fall back to [`CanonicalType::Text`]. Structural types (arrays,
//! composites, ranges, MySQL `SET` and spatial types) cannot be expressed as a single
//! field value and are rejected with [`UnsupportedTypeError`].

use crate::registry::DatabaseKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum CanonicalType {
    Int64,
    Float64,
    Bool,
    Text,
    Timestamp,
    Json,
    Binary,
    Enum(Vec<String>),
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalType::Int64 => write!(f, "int64"),
            CanonicalType::Float64 => write!(f, "float64"),
            CanonicalType::Bool => write!(f, "bool"),
            CanonicalType::Text => write!(f, "text"),
            CanonicalType::Timestamp => write!(f, "timestamp"),
            CanonicalType::Json => write!(f, "json"),
            CanonicalType::Binary => write!(f, "binary"),
            CanonicalType::Enum(values) => write!(f, "enum({})", values.join("|")),
        }
    }
}

/// Comparison operators of the filter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Like,
}

impl FilterOp {
    pub const ALL: [FilterOp; 8] = [
        FilterOp::Eq,
        FilterOp::Neq,
        FilterOp::Gt,
        FilterOp::Gte,
        FilterOp::Lt,
        FilterOp::Lte,
        FilterOp::In,
        FilterOp::Like,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
            FilterOp::Like => "like",
        }
    }

    pub fn parse(s: &str) -> Option<FilterOp> {
        FilterOp::ALL.into_iter().find(|op| op.as_str() == s)
    }

    /// SQL comparison for single-value operators.
    pub fn sql_operator(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Neq => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::In => "IN",
            FilterOp::Like => "LIKE",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CanonicalType {
    pub fn filter_ops(&self) -> Vec<FilterOp> {
        use FilterOp::*;
        match self {
            CanonicalType::Int64 | CanonicalType::Float64 | CanonicalType::Timestamp => {
                vec![Eq, Neq, Gt, Gte, Lt, Lte, In]
            }
            CanonicalType::Text => vec![Eq, Neq, Gt, Gte, Lt, Lte, In, Like],
            CanonicalType::Bool => vec![Eq, Neq],
            CanonicalType::Enum(_) => vec![Eq, Neq, In],
            CanonicalType::Json | CanonicalType::Binary => Vec::new(),
        }
    }

    pub fn sortable(&self) -> bool {
        !matches!(self, CanonicalType::Json | CanonicalType::Binary)
    }

    /// GraphQL scalar used for this type in generated SDL.
    pub fn graphql_scalar(&self) -> &'static str {
        match self {
            CanonicalType::Int64 => "Int",
            CanonicalType::Float64 => "Float",
            CanonicalType::Bool => "Boolean",
            CanonicalType::Text | CanonicalType::Enum(_) => "String",
            CanonicalType::Timestamp => "DateTime",
            CanonicalType::Json => "JSON",
            CanonicalType::Binary => "Base64",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unsupported {dialect} type '{raw_type}': {reason}")]
pub struct UnsupportedTypeError {
    pub dialect: DatabaseKind,
    pub raw_type: String,
    pub reason: &'static str,
}

/// Map a declared column type onto the canonical vocabulary. Pure and table-driven.
pub fn map_type(dialect: DatabaseKind, raw_type: &str) -> Result<CanonicalType, UnsupportedTypeError> {
    let lowered = raw_type.trim().to_ascii_lowercase();
    let unsupported = |reason| UnsupportedTypeError {
        dialect,
        raw_type: raw_type.to_string(),
        reason,
    };

    if lowered.starts_with("enum(") {
        return parse_enum_labels(raw_type.trim())
            .map(CanonicalType::Enum)
            .ok_or_else(|| unsupported("malformed enum label list"));
    }

    match dialect {
        DatabaseKind::Postgres => map_postgres(&lowered).map_err(unsupported),
        DatabaseKind::MySql => map_mysql(&lowered).map_err(unsupported),
    }
}

fn base_name(lowered: &str) -> &str {
    lowered.split('(').next().unwrap_or(lowered).trim()
}

fn map_postgres(lowered: &str) -> Result<CanonicalType, &'static str> {
    if lowered.ends_with("[]") || lowered == "array" || lowered.starts_with('_') {
        return Err("array columns are not supported");
    }
    if lowered.starts_with("composite:") || lowered == "record" {
        return Err("composite columns are not supported");
    }
    if lowered.starts_with("range:") || lowered.ends_with("range") || lowered.ends_with("multirange") {
        return Err("range columns are not supported");
    }
    // "timestamp(3) with time zone" -> "timestamp with time zone"
    let without_modifier: String = match lowered.find('(') {
        Some(start) => match lowered[start..].find(')') {
            Some(len) => format!("{}{}", &lowered[..start], &lowered[start + len + 1..]),
            None => lowered.to_string(),
        },
        None => lowered.to_string(),
    };
    Ok(match without_modifier.trim() {
        "smallint" | "integer" | "int" | "bigint" | "int2" | "int4" | "int8" | "smallserial"
        | "serial" | "bigserial" | "serial2" | "serial4" | "serial8" | "oid" => CanonicalType::Int64,
        "real" | "double precision" | "float4" | "float8" | "numeric" | "decimal" => {
            CanonicalType::Float64
        }
        "boolean" | "bool" => CanonicalType::Bool,
        "timestamp" | "timestamp without time zone" | "timestamp with time zone" | "timestamptz"
        | "date" | "time" | "time without time zone" | "time with time zone" | "timetz" => {
            CanonicalType::Timestamp
        }
        "json" | "jsonb" => CanonicalType::Json,
        "bytea" => CanonicalType::Binary,
        _ => CanonicalType::Text,
    })
}

fn map_mysql(lowered: &str) -> Result<CanonicalType, &'static str> {
    if lowered.starts_with("set(") || lowered == "set" {
        return Err("SET columns are not supported");
    }
    let compact: String = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.starts_with("tinyint(1)") || compact == "bool" || compact == "boolean" {
        return Ok(CanonicalType::Bool);
    }
    Ok(match base_name(&compact).split(' ').next().unwrap_or("") {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" | "bit" => {
            CanonicalType::Int64
        }
        "float" | "double" | "real" | "decimal" | "numeric" | "dec" | "fixed" => CanonicalType::Float64,
        "date" | "datetime" | "timestamp" | "time" => CanonicalType::Timestamp,
        "json" => CanonicalType::Json,
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            CanonicalType::Binary
        }
        "geometry" | "point" | "linestring" | "polygon" | "multipoint" | "multilinestring"
        | "multipolygon" | "geometrycollection" | "geomcollection" => {
            return Err("spatial columns are not supported")
        }
        _ => CanonicalType::Text,
    })
}

/// Parse `enum('a','b''c')` into its labels. Quotes inside a label are doubled.
pub fn parse_enum_labels(declared: &str) -> Option<Vec<String>> {
    let open = declared.find('(')?;
    let close = declared.rfind(')')?;
    if close <= open {
        return None;
    }
    let inner = &declared[open + 1..close];
    let mut labels = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            None => break,
            Some('\'') => {}
            Some(_) => return None,
        }
        let mut label = String::new();
        loop {
            match chars.next()? {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    label.push('\'');
                }
                '\'' => break,
                c => label.push(c),
            }
        }
        labels.push(label);
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            None => break,
            Some(',') => continue,
            Some(_) => return None,
        }
    }
    Some(labels)
}

/// Render labels back into the declared `enum(...)` form.
pub fn format_enum_labels(labels: &[String]) -> String {
    let quoted: Vec<String> = labels
        .iter()
        .map(|l| format!("'{}'", l.replace('\'', "''")))
        .collect();
    format!("enum({})", quoted.join(","))
}
