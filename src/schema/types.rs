//! Schema snapshot: the normalized, immutable description of one project database.

use crate::registry::DatabaseKind;
use crate::typemap::CanonicalType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaSnapshot {
    pub project_id: Uuid,
    pub dialect: DatabaseKind,
    pub database_name: String,
    /// Sorted by resource name.
    pub tables: Vec<TableDescriptor>,
    /// Tables and columns left out, with the reason.
    pub skipped: Vec<SkippedItem>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableDescriptor {
    /// Database schema (PostgreSQL namespace or MySQL database).
    pub schema: String,
    pub name: String,
    /// Name the table is exposed under; `schema__table` outside the default schema.
    pub resource_name: String,
    /// Ordered by ordinal position.
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key columns in key order; empty when the table has none.
    pub primary_key: Vec<String>,
    pub constraints: Vec<Constraint>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub ordinal: i32,
    /// Declared type after normalization; input of the type mapper.
    pub raw_type: String,
    /// Type name the database accepts in a cast.
    pub native_type: String,
    pub mapped_type: CanonicalType,
    pub nullable: bool,
    pub default: Option<String>,
    pub auto_generated: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub references: Option<ColumnRef>,
}

impl ColumnDescriptor {
    /// Whether a create request may leave this column out.
    pub fn optional_on_create(&self) -> bool {
        self.nullable || self.default.is_some() || self.auto_generated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnRef {
    /// Resource name of the referenced table.
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Unique,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignTarget {
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedItem {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub reason: String,
}

impl SchemaSnapshot {
    pub fn table(&self, resource_name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.resource_name == resource_name)
    }

    /// Structural hash over tables, columns, declared and native types, and keys. Ignores capture time and column order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dialect.as_str());
        hasher.update([0u8]);
        hasher.update(&self.database_name);
        for table in &self.tables {
            hasher.update([1u8]);
            hasher.update(&table.resource_name);
            let mut columns: Vec<&ColumnDescriptor> = table.columns.iter().collect();
            columns.sort_by(|a, b| a.name.cmp(&b.name));
            for c in columns {
                hasher.update([2u8]);
                hasher.update(&c.name);
                hasher.update([0u8]);
                hasher.update(&c.raw_type);
                hasher.update([0u8]);
                hasher.update(&c.native_type);
                hasher.update([0u8]);
                hasher.update(c.mapped_type.to_string());
                hasher.update([c.nullable as u8, c.auto_generated as u8, c.default.is_some() as u8]);
                if let Some(r) = &c.references {
                    hasher.update(&r.table);
                    hasher.update([0u8]);
                    hasher.update(&r.column);
                }
            }
            for pk in &table.primary_key {
                hasher.update([3u8]);
                hasher.update(pk);
            }
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
