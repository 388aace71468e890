//! Routing table types produced by synthesis.

use super::graphql::GraphqlSchema;
use crate::registry::DatabaseKind;
use crate::typemap::{CanonicalType, FilterOp};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Operation::List | Operation::Get)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDef {
    /// Name used in requests and responses.
    pub name: String,
    pub column: String,
    pub canonical: CanonicalType,
    /// Type used to cast bound parameters.
    pub native_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_generated: bool,
    pub required_on_create: bool,
    pub filter_ops: Vec<FilterOp>,
    pub sortable: bool,
    pub graphql_name: String,
}

impl FieldDef {
    pub fn allows(&self, op: FilterOp) -> bool {
        self.filter_ops.contains(&op)
    }
}

/// A foreign key surfaced as navigation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relation {
    pub field: String,
    pub target_resource: String,
    pub target_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDefinition {
    pub name: String,
    pub schema: String,
    pub table: String,
    /// Ordered by column position.
    pub fields: Vec<FieldDef>,
    /// Single-column primary key; `None` limits the resource to list and create.
    pub primary_key: Option<String>,
    pub operations: BTreeSet<Operation>,
    pub relations: Vec<Relation>,
    pub type_name: String,
}

impl ResourceDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn supports(&self, op: Operation) -> bool {
        self.operations.contains(&op)
    }

    pub fn primary_key_field(&self) -> Option<&FieldDef> {
        self.primary_key.as_deref().and_then(|pk| self.field(pk))
    }
}

/// Everything needed to serve one project's synthesized API. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingTable {
    pub project_id: Uuid,
    pub dialect: DatabaseKind,
    /// Fingerprint of the snapshot this table was built from.
    pub fingerprint: String,
    pub resources: BTreeMap<String, ResourceDefinition>,
    pub graphql: GraphqlSchema,
}

impl RoutingTable {
    pub fn resource(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.get(name)
    }
}
