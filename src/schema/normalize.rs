//! Turns raw catalog rows into a [`SchemaSnapshot`]. No I/O happens here.

use super::types::{
    ColumnDescriptor, ColumnRef, Constraint, ConstraintKind, ForeignTarget, SchemaSnapshot,
    SkippedItem, TableDescriptor,
};
use crate::registry::DatabaseKind;
use crate::typemap::{format_enum_labels, map_type};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// One column as read from the catalog.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub name: String,
    pub ordinal: i32,
    pub declared_type: String,
    pub native_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub identity: bool,
}

/// One column of one key constraint, in key order.
#[derive(Debug, Clone)]
pub struct RawConstraintColumn {
    pub name: String,
    pub kind: ConstraintKind,
    pub column: String,
    pub position: i32,
    pub ref_schema: Option<String>,
    pub ref_table: Option<String>,
    pub ref_column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawTable {
    pub schema: String,
    pub name: String,
    pub columns: Vec<RawColumn>,
    pub constraints: Vec<RawConstraintColumn>,
}

/// What the catalog queries produced, including tables that could not be read.
#[derive(Debug, Clone, Default)]
pub struct RawCatalog {
    pub tables: Vec<RawTable>,
    pub failed: Vec<SkippedItem>,
}

/// Schema whose tables are exposed without a prefix.
pub fn default_schema(dialect: DatabaseKind, database_name: &str) -> &str {
    match dialect {
        DatabaseKind::Postgres => "public",
        DatabaseKind::MySql => database_name,
    }
}

pub fn resource_name(default_schema: &str, schema: &str, table: &str) -> String {
    if schema == default_schema {
        table.to_string()
    } else {
        format!("{}__{}", schema, table)
    }
}

/// Declared type for a PostgreSQL column given its `pg_type` classification.
/// Enums become `enum('a',...)`; composites and ranges are tagged so the mapper can reject them.
pub fn pg_declared_type(format_type: &str, typtype: &str, typcategory: &str, enum_labels: &[String]) -> String {
    match typtype {
        "e" => format_enum_labels(enum_labels),
        "c" => format!("composite:{}", format_type),
        "r" | "m" => format!("range:{}", format_type),
        _ if typcategory == "A" && !format_type.ends_with("[]") => format!("{}[]", format_type),
        _ => format_type.to_string(),
    }
}

pub fn is_sequence_default(default: Option<&str>) -> bool {
    default.map(|d| d.trim_start().starts_with("nextval(")).unwrap_or(false)
}

/// Build a snapshot from raw catalog rows. Output order depends only on names and ordinals.
pub fn build_snapshot(
    project_id: Uuid,
    dialect: DatabaseKind,
    database_name: &str,
    catalog: RawCatalog,
    captured_at: DateTime<Utc>,
) -> SchemaSnapshot {
    let default = default_schema(dialect, database_name).to_string();
    let mut skipped = catalog.failed;
    let mut by_resource: BTreeMap<String, TableDescriptor> = BTreeMap::new();

    let mut raw_tables = catalog.tables;
    raw_tables.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));

    for raw in raw_tables {
        let resource = resource_name(&default, &raw.schema, &raw.name);
        if by_resource.contains_key(&resource) {
            skipped.push(SkippedItem {
                table: format!("{}.{}", raw.schema, raw.name),
                column: None,
                reason: format!("resource name '{}' already taken", resource),
            });
            continue;
        }
        match build_table(dialect, &default, raw, &resource, &mut skipped) {
            Some(t) => {
                by_resource.insert(resource, t);
            }
            None => continue,
        }
    }

    skipped.sort_by(|a, b| (&a.table, &a.column).cmp(&(&b.table, &b.column)));

    SchemaSnapshot {
        project_id,
        dialect,
        database_name: database_name.to_string(),
        tables: by_resource.into_values().collect(),
        skipped,
        captured_at,
    }
}

fn build_table(
    dialect: DatabaseKind,
    default_schema: &str,
    raw: RawTable,
    resource: &str,
    skipped: &mut Vec<SkippedItem>,
) -> Option<TableDescriptor> {
    let mut constraints = group_constraints(default_schema, &raw.constraints);
    constraints.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));

    let primary_key: Vec<String> = constraints
        .iter()
        .find(|c| c.kind == ConstraintKind::PrimaryKey)
        .map(|c| c.columns.clone())
        .unwrap_or_default();

    // single-column foreign keys only; composite keys stay as constraints
    let mut fk_targets: BTreeMap<&str, ColumnRef> = BTreeMap::new();
    for c in constraints.iter().filter(|c| c.kind == ConstraintKind::ForeignKey) {
        if let (Some(target), [col]) = (&c.references, c.columns.as_slice()) {
            if let [ref_col] = target.columns.as_slice() {
                fk_targets.insert(col.as_str(), ColumnRef {
                    table: target.table.clone(),
                    column: ref_col.clone(),
                });
            }
        }
    }
    let fk_columns: HashSet<&str> = constraints
        .iter()
        .filter(|c| c.kind == ConstraintKind::ForeignKey)
        .flat_map(|c| c.columns.iter().map(String::as_str))
        .collect();

    let mut raw_columns = raw.columns;
    raw_columns.sort_by_key(|c| c.ordinal);
    let qualified = format!("{}.{}", raw.schema, raw.name);

    let mut columns = Vec::with_capacity(raw_columns.len());
    for rc in raw_columns {
        let mapped = match map_type(dialect, &rc.declared_type) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(table = %qualified, column = %rc.name, error = %e, "skipping column");
                skipped.push(SkippedItem {
                    table: qualified.clone(),
                    column: Some(rc.name),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let auto_generated = rc.identity || is_sequence_default(rc.default.as_deref());
        columns.push(ColumnDescriptor {
            is_primary_key: primary_key.contains(&rc.name),
            is_foreign_key: fk_columns.contains(rc.name.as_str()),
            references: fk_targets.get(rc.name.as_str()).cloned(),
            name: rc.name,
            ordinal: rc.ordinal,
            raw_type: rc.declared_type,
            native_type: rc.native_type,
            mapped_type: mapped,
            nullable: rc.nullable,
            default: rc.default,
            auto_generated,
        });
    }

    if columns.is_empty() {
        skipped.push(SkippedItem {
            table: qualified,
            column: None,
            reason: "no supported columns".into(),
        });
        return None;
    }

    // a key whose column was skipped cannot address rows
    let primary_key = if primary_key.iter().all(|k| columns.iter().any(|c| &c.name == k)) {
        primary_key
    } else {
        Vec::new()
    };

    Some(TableDescriptor {
        schema: raw.schema,
        name: raw.name,
        resource_name: resource.to_string(),
        columns,
        primary_key,
        constraints,
    })
}

fn group_constraints(default_schema: &str, rows: &[RawConstraintColumn]) -> Vec<Constraint> {
    let mut grouped: BTreeMap<(&str, ConstraintKind), Vec<&RawConstraintColumn>> = BTreeMap::new();
    for row in rows {
        grouped.entry((row.name.as_str(), row.kind)).or_default().push(row);
    }
    grouped
        .into_iter()
        .map(|((name, kind), mut cols)| {
            cols.sort_by_key(|c| c.position);
            let references = match (kind, cols.first()) {
                (ConstraintKind::ForeignKey, Some(first)) => first.ref_table.as_ref().map(|t| {
                    let schema = first.ref_schema.as_deref().unwrap_or(default_schema);
                    ForeignTarget {
                        table: resource_name(default_schema, schema, t),
                        columns: cols.iter().filter_map(|c| c.ref_column.clone()).collect(),
                    }
                }),
                _ => None,
            };
            Constraint {
                name: name.to_string(),
                kind,
                columns: cols.iter().map(|c| c.column.clone()).collect(),
                references,
            }
        })
        .collect()
}
