//! Builds parameterized SELECT, COUNT, INSERT, UPDATE, DELETE from a resource definition.
//!
//! Identifiers only ever come from the routing table and are quoted for the dialect;
//! request values only ever travel as bind parameters.

use super::params::BindValue;
use super::query::{Filter, FilterValue, ListQuery};
use crate::error::AppError;
use crate::registry::DatabaseKind;
use crate::synth::{FieldDef, ResourceDefinition};
use crate::typemap::{CanonicalType, FilterOp};

/// Escape character used for LIKE patterns. Same in both dialects, needs no backslash handling.
const LIKE_ESCAPE: char = '!';

#[derive(Debug, Clone, PartialEq)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<BindValue>,
    /// The row this statement yields is the result of its plan.
    pub returns_row: bool,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
            returns_row: false,
        }
    }

    /// Push a value and return its placeholder, cast to `cast` on PostgreSQL.
    fn push_param(&mut self, dialect: DatabaseKind, v: BindValue, cast: Option<&str>) -> String {
        self.params.push(v);
        match dialect {
            DatabaseKind::Postgres => match cast {
                Some(t) => format!("${}::{}", self.params.len(), t),
                None => format!("${}", self.params.len()),
            },
            DatabaseKind::MySql => "?".to_string(),
        }
    }
}

pub fn quoted(dialect: DatabaseKind, ident: &str) -> String {
    match dialect {
        DatabaseKind::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        DatabaseKind::MySql => format!("`{}`", ident.replace('`', "``")),
    }
}

fn qualified_table(dialect: DatabaseKind, res: &ResourceDefinition) -> String {
    format!("{}.{}", quoted(dialect, &res.schema), quoted(dialect, &res.table))
}

/// Column expression that decodes into the field's canonical type.
fn select_expr(dialect: DatabaseKind, f: &FieldDef) -> String {
    let col = quoted(dialect, &f.column);
    let expr = match dialect {
        DatabaseKind::Postgres => match &f.canonical {
            CanonicalType::Int64 => format!("{}::bigint", col),
            CanonicalType::Float64 => format!("{}::double precision", col),
            CanonicalType::Text | CanonicalType::Enum(_) => format!("{}::text", col),
            CanonicalType::Timestamp if f.native_type.starts_with("time with") => format!("{}::text", col),
            _ => col,
        },
        DatabaseKind::MySql => match &f.canonical {
            CanonicalType::Int64 => format!("CAST({} AS SIGNED)", col),
            CanonicalType::Float64 => format!("CAST({} AS DOUBLE)", col),
            CanonicalType::Text => format!("CAST({} AS CHAR)", col),
            CanonicalType::Timestamp if f.native_type == "time" => format!("CAST({} AS CHAR)", col),
            _ => col,
        },
    };
    format!("{} AS {}", expr, quoted(dialect, &f.name))
}

fn select_column_list(dialect: DatabaseKind, res: &ResourceDefinition) -> String {
    res.fields
        .iter()
        .map(|f| select_expr(dialect, f))
        .collect::<Vec<_>>()
        .join(", ")
}

fn field<'a>(res: &'a ResourceDefinition, name: &str) -> Result<&'a FieldDef, AppError> {
    res.field(name)
        .ok_or_else(|| AppError::validation(name, format!("unknown field on '{}'", res.name)))
}

fn primary_key<'a>(res: &'a ResourceDefinition) -> Result<&'a FieldDef, AppError> {
    res.primary_key_field()
        .ok_or_else(|| AppError::NotFound(format!("{} has no single-column primary key", res.name)))
}

fn cast_for(dialect: DatabaseKind, f: &FieldDef) -> Option<&str> {
    match dialect {
        DatabaseKind::Postgres => Some(f.native_type.as_str()),
        DatabaseKind::MySql => None,
    }
}

/// Escape LIKE metacharacters and wrap the value for a substring match.
pub fn like_pattern(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('%');
    for c in raw.chars() {
        if c == '%' || c == '_' || c == LIKE_ESCAPE {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn where_clause(
    dialect: DatabaseKind,
    res: &ResourceDefinition,
    filters: &[Filter],
    q: &mut QueryBuf,
) -> Result<String, AppError> {
    let mut parts = Vec::with_capacity(filters.len());
    for filter in filters {
        let f = field(res, &filter.field)?;
        if !f.allows(filter.op) {
            return Err(AppError::validation(
                format!("{}.{}", filter.field, filter.op),
                format!("operator not supported for {} field", f.canonical),
            ));
        }
        let col = quoted(dialect, &f.column);
        let part = match (&filter.op, &filter.value) {
            (FilterOp::Eq, FilterValue::One(BindValue::Null)) => format!("{} IS NULL", col),
            (FilterOp::Neq, FilterValue::One(BindValue::Null)) => format!("{} IS NOT NULL", col),
            (FilterOp::In, FilterValue::Many(values)) => {
                if values.is_empty() {
                    return Err(AppError::validation(format!("{}.in", filter.field), "empty value list"));
                }
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| q.push_param(dialect, v.clone(), cast_for(dialect, f)))
                    .collect();
                format!("{} IN ({})", col, placeholders.join(", "))
            }
            (FilterOp::Like, FilterValue::One(BindValue::Text(s))) => {
                let ph = q.push_param(dialect, BindValue::Text(like_pattern(s)), None);
                match dialect {
                    DatabaseKind::Postgres => format!("{}::text LIKE {} ESCAPE '{}'", col, ph, LIKE_ESCAPE),
                    DatabaseKind::MySql => format!("{} LIKE {} ESCAPE '{}'", col, ph, LIKE_ESCAPE),
                }
            }
            (op, FilterValue::One(v)) if *op != FilterOp::In && *op != FilterOp::Like => {
                let ph = q.push_param(dialect, v.clone(), cast_for(dialect, f));
                format!("{} {} {}", col, op.sql_operator(), ph)
            }
            (op, _) => {
                return Err(AppError::validation(
                    format!("{}.{}", filter.field, op),
                    "value shape does not match operator",
                ))
            }
        };
        parts.push(part);
    }
    Ok(if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    })
}

/// SELECT with filters, ORDER BY (primary key appended as tiebreaker) and LIMIT/OFFSET.
pub fn select_list(dialect: DatabaseKind, res: &ResourceDefinition, query: &ListQuery) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(dialect, res, &query.filters, &mut q)?;

    let mut order = Vec::with_capacity(query.order.len() + 1);
    for key in &query.order {
        let f = field(res, &key.field)?;
        if !f.sortable {
            return Err(AppError::validation(
                format!("order={}", key.field),
                format!("{} field is not sortable", f.canonical),
            ));
        }
        order.push(format!("{} {}", quoted(dialect, &f.column), key.direction.as_sql()));
    }
    if let Some(pk) = res.primary_key_field() {
        if !query.order.iter().any(|k| k.field == pk.name) {
            order.push(format!("{} ASC", quoted(dialect, &pk.column)));
        }
    }
    let order_sql = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };

    q.sql = format!(
        "SELECT {} FROM {}{}{} LIMIT {} OFFSET {}",
        select_column_list(dialect, res),
        qualified_table(dialect, res),
        where_sql,
        order_sql,
        query.limit,
        query.offset
    );
    q.returns_row = true;
    Ok(q)
}

/// COUNT(*) under the same filters as a list request.
pub fn count(dialect: DatabaseKind, res: &ResourceDefinition, filters: &[Filter]) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(dialect, res, filters, &mut q)?;
    q.sql = format!(
        "SELECT COUNT(*) AS {} FROM {}{}",
        quoted(dialect, "total"),
        qualified_table(dialect, res),
        where_sql
    );
    q.returns_row = true;
    Ok(q)
}

pub fn select_by_id(dialect: DatabaseKind, res: &ResourceDefinition, id: BindValue) -> Result<QueryBuf, AppError> {
    let pk = primary_key(res)?;
    let mut q = QueryBuf::new();
    let ph = q.push_param(dialect, id, cast_for(dialect, pk));
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = {}",
        select_column_list(dialect, res),
        qualified_table(dialect, res),
        quoted(dialect, &pk.column),
        ph
    );
    q.returns_row = true;
    Ok(q)
}

/// INSERT one row. Fields left out of `values` take the column default.
/// On MySQL the inserted row is read back inside the same transaction.
pub fn insert(
    dialect: DatabaseKind,
    res: &ResourceDefinition,
    values: &[(String, BindValue)],
) -> Result<Vec<QueryBuf>, AppError> {
    let mut q = QueryBuf::new();
    let table = qualified_table(dialect, res);
    let mut cols = Vec::with_capacity(values.len());
    let mut placeholders = Vec::with_capacity(values.len());
    for (name, v) in values {
        let f = field(res, name)?;
        cols.push(quoted(dialect, &f.column));
        placeholders.push(q.push_param(dialect, v.clone(), cast_for(dialect, f)));
    }

    match dialect {
        DatabaseKind::Postgres => {
            let body = if cols.is_empty() {
                "DEFAULT VALUES".to_string()
            } else {
                format!("({}) VALUES ({})", cols.join(", "), placeholders.join(", "))
            };
            q.sql = format!(
                "INSERT INTO {} {} RETURNING {}",
                table,
                body,
                select_column_list(dialect, res)
            );
            q.returns_row = true;
            Ok(vec![q])
        }
        DatabaseKind::MySql => {
            q.sql = format!("INSERT INTO {} ({}) VALUES ({})", table, cols.join(", "), placeholders.join(", "));
            let mut steps = vec![q];
            if let Some(pk) = res.primary_key_field() {
                let provided = values.iter().find(|(n, _)| *n == pk.name).map(|(_, v)| v.clone());
                let read_back = match provided {
                    Some(id) => select_by_id(dialect, res, id)?,
                    None if pk.auto_generated => {
                        let mut r = QueryBuf::new();
                        r.sql = format!(
                            "SELECT {} FROM {} WHERE {} = LAST_INSERT_ID()",
                            select_column_list(dialect, res),
                            table,
                            quoted(dialect, &pk.column)
                        );
                        r.returns_row = true;
                        r
                    }
                    None => return Ok(steps),
                };
                steps.push(read_back);
            }
            Ok(steps)
        }
    }
}

/// UPDATE by primary key, setting only the given fields.
pub fn update(
    dialect: DatabaseKind,
    res: &ResourceDefinition,
    id: BindValue,
    values: &[(String, BindValue)],
) -> Result<Vec<QueryBuf>, AppError> {
    let pk = primary_key(res)?;
    if values.is_empty() {
        return Ok(vec![select_by_id(dialect, res, id)?]);
    }
    let mut q = QueryBuf::new();
    let mut sets = Vec::with_capacity(values.len());
    for (name, v) in values {
        let f = field(res, name)?;
        if f.primary_key {
            return Err(AppError::validation(name.clone(), "primary key cannot be updated"));
        }
        let ph = q.push_param(dialect, v.clone(), cast_for(dialect, f));
        sets.push(format!("{} = {}", quoted(dialect, &f.column), ph));
    }
    let id_ph = q.push_param(dialect, id.clone(), cast_for(dialect, pk));
    let table = qualified_table(dialect, res);

    match dialect {
        DatabaseKind::Postgres => {
            q.sql = format!(
                "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
                table,
                sets.join(", "),
                quoted(dialect, &pk.column),
                id_ph,
                select_column_list(dialect, res)
            );
            q.returns_row = true;
            Ok(vec![q])
        }
        DatabaseKind::MySql => {
            q.sql = format!(
                "UPDATE {} SET {} WHERE {} = {}",
                table,
                sets.join(", "),
                quoted(dialect, &pk.column),
                id_ph
            );
            Ok(vec![q, select_by_id(dialect, res, id)?])
        }
    }
}

/// DELETE by primary key, yielding the removed row.
pub fn delete(dialect: DatabaseKind, res: &ResourceDefinition, id: BindValue) -> Result<Vec<QueryBuf>, AppError> {
    let pk = primary_key(res)?;
    let table = qualified_table(dialect, res);
    let mut q = QueryBuf::new();
    let ph = q.push_param(dialect, id.clone(), cast_for(dialect, pk));
    match dialect {
        DatabaseKind::Postgres => {
            q.sql = format!(
                "DELETE FROM {} WHERE {} = {} RETURNING {}",
                table,
                quoted(dialect, &pk.column),
                ph,
                select_column_list(dialect, res)
            );
            q.returns_row = true;
            Ok(vec![q])
        }
        DatabaseKind::MySql => {
            q.sql = format!("DELETE FROM {} WHERE {} = {}", table, quoted(dialect, &pk.column), ph);
            Ok(vec![select_by_id(dialect, res, id)?, q])
        }
    }
}
