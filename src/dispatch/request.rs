//! Parsing of list parameters: the `field.op=value` filter grammar, `order`, `limit`, `offset`,
//! and the equivalent GraphQL arguments.

use crate::error::AppError;
use crate::registry::DatabaseKind;
use crate::service::RequestValidator;
use crate::settings::DispatchSettings;
use crate::sql::{BindValue, Direction, Filter, FilterValue, ListQuery, SortKey};
use crate::synth::{FieldDef, ResourceDefinition};
use crate::typemap::FilterOp;
use serde_json::{Map, Value};

/// Request input for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchParams {
    /// Primary key from the path, for get, update and delete.
    pub id: Option<String>,
    /// Raw query-string pairs, for list.
    pub query: Vec<(String, String)>,
    /// JSON object body, for create and update.
    pub body: Option<Map<String, Value>>,
}

impl DispatchParams {
    pub fn list(query: Vec<(String, String)>) -> Self {
        Self { query, ..Default::default() }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()), ..Default::default() }
    }

    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        self.body = Some(body);
        self
    }
}

fn limit_from(raw: &str, settings: &DispatchSettings) -> Result<u32, AppError> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(AppError::validation("limit", format!("expected a positive integer, got '{}'", raw))),
        Ok(n) => Ok(n.min(settings.max_limit as u64) as u32),
    }
}

fn offset_from(raw: &str) -> Result<u64, AppError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| AppError::validation("offset", format!("expected a non-negative integer, got '{}'", raw)))
}

fn sort_key<'r>(
    res: &'r ResourceDefinition,
    spec: &str,
    lookup: impl Fn(&str) -> Option<&'r FieldDef>,
) -> Result<SortKey, AppError> {
    let spec = spec.trim();
    let (name, direction) = match spec.rsplit_once('.') {
        Some((n, "asc")) => (n, Direction::Asc),
        Some((n, "desc")) => (n, Direction::Desc),
        _ => (spec, Direction::Asc),
    };
    let f = lookup(name)
        .ok_or_else(|| AppError::validation(format!("order={}", spec), format!("unknown field on '{}'", res.name)))?;
    if !f.sortable {
        return Err(AppError::validation(format!("order={}", spec), format!("{} field is not sortable", f.canonical)));
    }
    Ok(SortKey { field: f.name.clone(), direction })
}

/// Splits `field.op` into the field and operator; a bare field means `eq`.
fn filter_key<'a>(res: &'a ResourceDefinition, key: &str) -> Result<(&'a FieldDef, FilterOp), AppError> {
    if let Some((name, op)) = key.rsplit_once('.') {
        if let Some(op) = FilterOp::parse(op) {
            let f = res
                .field(name)
                .ok_or_else(|| AppError::validation(key, format!("unknown field on '{}'", res.name)))?;
            return Ok((f, op));
        }
    }
    match res.field(key) {
        Some(f) => Ok((f, FilterOp::Eq)),
        None if key.contains('.') => Err(AppError::validation(key, "unknown filter operator")),
        None => Err(AppError::validation(key, format!("unknown field on '{}'", res.name))),
    }
}

fn check_op(f: &FieldDef, op: FilterOp, parameter: &str) -> Result<(), AppError> {
    if f.allows(op) {
        Ok(())
    } else {
        Err(AppError::validation(parameter, format!("operator '{}' not supported for {} field", op, f.canonical)))
    }
}

/// Parse list parameters from a query string.
pub fn parse_list_query(
    res: &ResourceDefinition,
    dialect: DatabaseKind,
    pairs: &[(String, String)],
    settings: &DispatchSettings,
) -> Result<ListQuery, AppError> {
    let mut query = ListQuery {
        filters: Vec::new(),
        order: Vec::new(),
        limit: settings.default_limit,
        offset: 0,
    };
    for (key, raw) in pairs {
        match key.as_str() {
            "limit" => query.limit = limit_from(raw, settings)?,
            "offset" => query.offset = offset_from(raw)?,
            "order" => {
                for spec in raw.split(',').filter(|s| !s.trim().is_empty()) {
                    query.order.push(sort_key(res, spec, |n| res.field(n))?);
                }
            }
            _ => {
                let (f, op) = filter_key(res, key)?;
                check_op(f, op, key)?;
                let value = if op == FilterOp::In {
                    let items: Vec<&str> = raw.split(',').collect();
                    if items.len() > settings.max_in_values {
                        return Err(AppError::validation(key.clone(), format!("at most {} values", settings.max_in_values)));
                    }
                    if items.iter().any(|s| s.is_empty()) {
                        return Err(AppError::validation(key.clone(), "empty value in list"));
                    }
                    FilterValue::Many(
                        items
                            .iter()
                            .map(|s| RequestValidator::coerce_text(f, dialect, s))
                            .collect::<Result<_, _>>()?,
                    )
                } else {
                    FilterValue::One(RequestValidator::coerce_text(f, dialect, raw)?)
                };
                query.filters.push(Filter { field: f.name.clone(), op, value });
            }
        }
    }
    Ok(query)
}

fn by_graphql_name<'a>(res: &'a ResourceDefinition, name: &str) -> Option<&'a FieldDef> {
    res.fields.iter().find(|f| f.graphql_name == name)
}

/// Parse list arguments of a GraphQL query field: `filter`, `orderBy`, `limit`, `offset`.
/// Filter entries are `{field: value}` (equality) or `{field: {op: value}}`.
pub fn parse_graphql_list(
    res: &ResourceDefinition,
    dialect: DatabaseKind,
    args: &Map<String, Value>,
    settings: &DispatchSettings,
) -> Result<ListQuery, AppError> {
    let mut query = ListQuery {
        filters: Vec::new(),
        order: Vec::new(),
        limit: settings.default_limit,
        offset: 0,
    };
    for (arg, v) in args {
        match (arg.as_str(), v) {
            (_, Value::Null) => {}
            ("limit", Value::Number(n)) => query.limit = limit_from(&n.to_string(), settings)?,
            ("offset", Value::Number(n)) => query.offset = offset_from(&n.to_string())?,
            ("orderBy", Value::Array(items)) => {
                for item in items {
                    let spec = item
                        .as_str()
                        .ok_or_else(|| AppError::validation("orderBy", "expected a list of strings"))?;
                    query.order.push(sort_key(res, spec, |n| by_graphql_name(res, n))?);
                }
            }
            ("orderBy", Value::String(spec)) => query.order.push(sort_key(res, spec, |n| by_graphql_name(res, n))?),
            ("filter", Value::Object(entries)) => {
                for (name, cond) in entries {
                    let f = by_graphql_name(res, name)
                        .ok_or_else(|| AppError::validation(format!("filter.{}", name), format!("unknown field on '{}'", res.name)))?;
                    match cond {
                        Value::Object(ops) => {
                            for (op_name, operand) in ops {
                                let parameter = format!("filter.{}.{}", name, op_name);
                                let op = FilterOp::parse(op_name)
                                    .ok_or_else(|| AppError::validation(parameter.clone(), "unknown filter operator"))?;
                                check_op(f, op, &parameter)?;
                                query.filters.push(Filter {
                                    field: f.name.clone(),
                                    op,
                                    value: graphql_operand(f, dialect, op, operand, &parameter, settings)?,
                                });
                            }
                        }
                        scalar => {
                            check_op(f, FilterOp::Eq, &format!("filter.{}", name))?;
                            query.filters.push(Filter {
                                field: f.name.clone(),
                                op: FilterOp::Eq,
                                value: FilterValue::One(RequestValidator::coerce_json(f, dialect, scalar)?),
                            });
                        }
                    }
                }
            }
            (other, _) => return Err(AppError::validation(other, "unexpected argument")),
        }
    }
    Ok(query)
}

fn graphql_operand(
    f: &FieldDef,
    dialect: DatabaseKind,
    op: FilterOp,
    operand: &Value,
    parameter: &str,
    settings: &DispatchSettings,
) -> Result<FilterValue, AppError> {
    if op != FilterOp::In {
        let value = RequestValidator::coerce_json(f, dialect, operand)?;
        if op == FilterOp::Like && !matches!(value, BindValue::Text(_)) {
            return Err(AppError::validation(parameter, "expected a string"));
        }
        return Ok(FilterValue::One(value));
    }
    let items = operand
        .as_array()
        .ok_or_else(|| AppError::validation(parameter, "expected a list"))?;
    if items.is_empty() || items.len() > settings.max_in_values {
        return Err(AppError::validation(parameter, format!("expected 1 to {} values", settings.max_in_values)));
    }
    Ok(FilterValue::Many(
        items
            .iter()
            .map(|v| RequestValidator::coerce_json(f, dialect, v))
            .collect::<Result<_, _>>()?,
    ))
}

/// Map GraphQL input field names back onto column field names.
pub fn graphql_input(res: &ResourceDefinition, input: &Map<String, Value>) -> Result<Map<String, Value>, AppError> {
    let mut out = Map::with_capacity(input.len());
    for (name, v) in input {
        let f = by_graphql_name(res, name)
            .ok_or_else(|| AppError::validation(name.clone(), format!("unknown field on '{}'", res.name)))?;
        out.insert(f.name.clone(), v.clone());
    }
    Ok(out)
}

/// Re-key a row from field names to GraphQL names.
pub fn graphql_row(res: &ResourceDefinition, row: Value) -> Value {
    match row {
        Value::Object(mut map) => {
            let mut out = Map::with_capacity(map.len());
            for f in &res.fields {
                if let Some(v) = map.remove(&f.name) {
                    out.insert(f.graphql_name.clone(), v);
                }
            }
            Value::Object(out)
        }
        other => other,
    }
}
