//! GraphQL surface of a routing table: object, input and filter types plus root fields.
//!
//! Root fields are resolved by name against the same operations the REST routes use;
//! there is no document parser. `sdl()` renders the schema for client tooling.

use super::resource::{Operation, ResourceDefinition};
use crate::case::{graphql_safe, to_camel_case, to_pascal_case};
use crate::typemap::CanonicalType;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    Query,
    Mutation,
}

impl RootKind {
    pub fn parse(s: &str) -> Option<RootKind> {
        match s.to_ascii_lowercase().as_str() {
            "query" => Some(RootKind::Query),
            "mutation" => Some(RootKind::Mutation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GqlArg {
    pub name: String,
    pub type_ref: String,
}

/// A root query or mutation field bound to one resource operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GqlRootField {
    pub name: String,
    pub resource: String,
    pub operation: Operation,
    pub args: Vec<GqlArg>,
    pub returns: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GqlObjectField {
    pub name: String,
    pub type_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GqlTypeKind {
    Object,
    Input,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GqlType {
    pub name: String,
    pub kind: GqlTypeKind,
    pub fields: Vec<GqlObjectField>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphqlSchema {
    pub types: Vec<GqlType>,
    pub queries: BTreeMap<String, GqlRootField>,
    pub mutations: BTreeMap<String, GqlRootField>,
}

impl GraphqlSchema {
    pub fn root_field(&self, root: RootKind, name: &str) -> Option<&GqlRootField> {
        match root {
            RootKind::Query => self.queries.get(name),
            RootKind::Mutation => self.mutations.get(name),
        }
    }

    /// Schema definition language text.
    pub fn sdl(&self) -> String {
        let mut out = String::new();
        out.push_str("scalar DateTime\nscalar JSON\nscalar Base64\n\n");
        out.push_str("input IntFilter { eq: Int neq: Int gt: Int gte: Int lt: Int lte: Int in: [Int!] }\n");
        out.push_str("input FloatFilter { eq: Float neq: Float gt: Float gte: Float lt: Float lte: Float in: [Float!] }\n");
        out.push_str("input StringFilter { eq: String neq: String gt: String gte: String lt: String lte: String in: [String!] like: String }\n");
        out.push_str("input EnumFilter { eq: String neq: String in: [String!] }\n");
        out.push_str("input BooleanFilter { eq: Boolean neq: Boolean }\n");
        out.push_str("input DateTimeFilter { eq: DateTime neq: DateTime gt: DateTime gte: DateTime lt: DateTime lte: DateTime in: [DateTime!] }\n\n");
        for t in &self.types {
            let keyword = match t.kind {
                GqlTypeKind::Object => "type",
                GqlTypeKind::Input => "input",
            };
            let _ = writeln!(out, "{} {} {{", keyword, t.name);
            for f in &t.fields {
                let _ = writeln!(out, "  {}: {}", f.name, f.type_ref);
            }
            out.push_str("}\n\n");
        }
        render_root(&mut out, "Query", &self.queries);
        if !self.mutations.is_empty() {
            render_root(&mut out, "Mutation", &self.mutations);
        }
        out
    }
}

fn render_root(out: &mut String, name: &str, fields: &BTreeMap<String, GqlRootField>) {
    let _ = writeln!(out, "type {} {{", name);
    for f in fields.values() {
        if f.args.is_empty() {
            let _ = writeln!(out, "  {}: {}", f.name, f.returns);
        } else {
            let args: Vec<String> = f.args.iter().map(|a| format!("{}: {}", a.name, a.type_ref)).collect();
            let _ = writeln!(out, "  {}({}): {}", f.name, args.join(", "), f.returns);
        }
    }
    out.push_str("}\n\n");
}

fn filter_type(t: &CanonicalType) -> Option<&'static str> {
    match t {
        CanonicalType::Int64 => Some("IntFilter"),
        CanonicalType::Float64 => Some("FloatFilter"),
        CanonicalType::Text => Some("StringFilter"),
        CanonicalType::Enum(_) => Some("EnumFilter"),
        CanonicalType::Bool => Some("BooleanFilter"),
        CanonicalType::Timestamp => Some("DateTimeFilter"),
        CanonicalType::Json | CanonicalType::Binary => None,
    }
}

/// GraphQL type name for a resource.
pub fn type_name_for(resource: &str) -> String {
    to_pascal_case(&graphql_safe(resource))
}

/// Add the types and root fields of one resource. Returns false when a generated name is already taken.
pub fn add_resource(schema: &mut GraphqlSchema, res: &ResourceDefinition) -> bool {
    let type_name = &res.type_name;
    let list_name = to_camel_case(&graphql_safe(&res.name));
    let by_id = format!("{}ById", list_name);
    let create = format!("create{}", type_name);
    let update = format!("update{}", type_name);
    let delete = format!("delete{}", type_name);

    let taken = schema.types.iter().any(|t| &t.name == type_name)
        || schema.queries.contains_key(&list_name)
        || schema.queries.contains_key(&by_id)
        || schema.mutations.contains_key(&create);
    if taken {
        return false;
    }

    let object = GqlType {
        name: type_name.clone(),
        kind: GqlTypeKind::Object,
        fields: res
            .fields
            .iter()
            .map(|f| GqlObjectField {
                name: f.graphql_name.clone(),
                type_ref: if f.nullable {
                    f.canonical.graphql_scalar().to_string()
                } else {
                    format!("{}!", f.canonical.graphql_scalar())
                },
            })
            .collect(),
    };
    let filter = GqlType {
        name: format!("{}Filter", type_name),
        kind: GqlTypeKind::Input,
        fields: res
            .fields
            .iter()
            .filter_map(|f| {
                filter_type(&f.canonical).map(|t| GqlObjectField {
                    name: f.graphql_name.clone(),
                    type_ref: t.to_string(),
                })
            })
            .collect(),
    };
    let input = GqlType {
        name: format!("{}Input", type_name),
        kind: GqlTypeKind::Input,
        fields: res
            .fields
            .iter()
            .map(|f| GqlObjectField {
                name: f.graphql_name.clone(),
                type_ref: if f.required_on_create {
                    format!("{}!", f.canonical.graphql_scalar())
                } else {
                    f.canonical.graphql_scalar().to_string()
                },
            })
            .collect(),
    };
    let patch = GqlType {
        name: format!("{}Patch", type_name),
        kind: GqlTypeKind::Input,
        fields: res
            .fields
            .iter()
            .filter(|f| !f.primary_key)
            .map(|f| GqlObjectField {
                name: f.graphql_name.clone(),
                type_ref: f.canonical.graphql_scalar().to_string(),
            })
            .collect(),
    };

    let arg = |name: &str, type_ref: String| GqlArg {
        name: name.to_string(),
        type_ref,
    };
    let id_type = res
        .primary_key_field()
        .map(|f| format!("{}!", f.canonical.graphql_scalar()));

    let has_filter = !filter.fields.is_empty();
    schema.types.push(object);
    if has_filter {
        schema.types.push(filter);
    }
    schema.types.push(input);

    if res.supports(Operation::List) {
        let mut args = Vec::with_capacity(4);
        if has_filter {
            args.push(arg("filter", format!("{}Filter", type_name)));
        }
        args.push(arg("orderBy", "[String!]".into()));
        args.push(arg("limit", "Int".into()));
        args.push(arg("offset", "Int".into()));
        schema.queries.insert(
            list_name.clone(),
            GqlRootField {
                name: list_name.clone(),
                resource: res.name.clone(),
                operation: Operation::List,
                args,
                returns: format!("[{}!]!", type_name),
            },
        );
    }
    if res.supports(Operation::Create) {
        schema.mutations.insert(
            create.clone(),
            GqlRootField {
                name: create,
                resource: res.name.clone(),
                operation: Operation::Create,
                args: vec![arg("input", format!("{}Input!", type_name))],
                returns: format!("{}!", type_name),
            },
        );
    }
    if let Some(id_type) = id_type {
        if res.supports(Operation::Get) {
            schema.queries.insert(
                by_id.clone(),
                GqlRootField {
                    name: by_id,
                    resource: res.name.clone(),
                    operation: Operation::Get,
                    args: vec![arg("id", id_type.clone())],
                    returns: type_name.clone(),
                },
            );
        }
        if res.supports(Operation::Update) {
            schema.types.push(patch);
            schema.mutations.insert(
                update.clone(),
                GqlRootField {
                    name: update,
                    resource: res.name.clone(),
                    operation: Operation::Update,
                    args: vec![arg("id", id_type.clone()), arg("patch", format!("{}Patch!", type_name))],
                    returns: type_name.clone(),
                },
            );
        }
        if res.supports(Operation::Delete) {
            schema.mutations.insert(
                delete.clone(),
                GqlRootField {
                    name: delete,
                    resource: res.name.clone(),
                    operation: Operation::Delete,
                    args: vec![arg("id", id_type)],
                    returns: type_name.clone(),
                },
            );
        }
    }
    true
}
