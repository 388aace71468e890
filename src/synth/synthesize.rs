//! Snapshot -> routing table. Pure: the same snapshot always yields an equal table.

use super::graphql::{add_resource, type_name_for, GraphqlSchema};
use super::resource::{FieldDef, Operation, Relation, ResourceDefinition, RoutingTable};
use crate::case::{graphql_safe, to_camel_case};
use crate::schema::{SchemaSnapshot, TableDescriptor};
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub fn synthesize(snapshot: &SchemaSnapshot) -> RoutingTable {
    let mut resources = BTreeMap::new();
    let mut graphql = GraphqlSchema::default();

    for table in &snapshot.tables {
        let res = resource_for(table);
        if !add_resource(&mut graphql, &res) {
            tracing::warn!(
                project_id = %snapshot.project_id,
                resource = %res.name,
                "graphql name collision; resource served over REST only"
            );
        }
        resources.insert(res.name.clone(), res);
    }

    RoutingTable {
        project_id: snapshot.project_id,
        dialect: snapshot.dialect,
        fingerprint: snapshot.fingerprint(),
        resources,
        graphql,
    }
}

fn resource_for(table: &TableDescriptor) -> ResourceDefinition {
    let mut used_graphql_names = HashSet::new();
    let fields: Vec<FieldDef> = table
        .columns
        .iter()
        .map(|c| {
            let graphql_name = unique_graphql_name(&c.name, &mut used_graphql_names);
            FieldDef {
                name: c.name.clone(),
                column: c.name.clone(),
                canonical: c.mapped_type.clone(),
                native_type: c.native_type.clone(),
                nullable: c.nullable,
                primary_key: c.is_primary_key,
                auto_generated: c.auto_generated,
                required_on_create: !c.optional_on_create(),
                filter_ops: c.mapped_type.filter_ops(),
                sortable: c.mapped_type.sortable(),
                graphql_name,
            }
        })
        .collect();

    let primary_key = match table.primary_key.as_slice() {
        [single] => Some(single.clone()),
        _ => None,
    };

    let mut operations = BTreeSet::from([Operation::List, Operation::Create]);
    if primary_key.is_some() {
        operations.insert(Operation::Get);
        operations.insert(Operation::Delete);
        if fields.iter().any(|f| !f.primary_key) {
            operations.insert(Operation::Update);
        }
    }

    let relations = table
        .columns
        .iter()
        .filter_map(|c| {
            c.references.as_ref().map(|r| Relation {
                field: c.name.clone(),
                target_resource: r.table.clone(),
                target_field: r.column.clone(),
            })
        })
        .collect();

    ResourceDefinition {
        name: table.resource_name.clone(),
        schema: table.schema.clone(),
        table: table.name.clone(),
        fields,
        primary_key,
        operations,
        relations,
        type_name: type_name_for(&table.resource_name),
    }
}

fn unique_graphql_name(column: &str, used: &mut HashSet<String>) -> String {
    let camel = to_camel_case(&graphql_safe(column));
    let base = if camel.is_empty() { graphql_safe(column) } else { camel };
    let mut candidate = base.clone();
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}
