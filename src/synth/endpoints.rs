//! Human-readable listing of the HTTP surface a routing table serves.

use super::resource::{Operation, RoutingTable};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub method: &'static str,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    pub description: String,
}

/// One entry per supported operation of every resource, in resource order, then the GraphQL endpoint.
pub fn describe_endpoints(table: &RoutingTable, base_url: &str) -> Vec<Endpoint> {
    let mut out = Vec::new();
    for res in table.resources.values() {
        for op in &res.operations {
            let (method, path, description) = match op {
                Operation::List => ("GET", format!("{}/{}", base_url, res.name), format!("List {} records", res.name)),
                Operation::Create => ("POST", format!("{}/{}", base_url, res.name), format!("Create a {} record", res.name)),
                Operation::Get => ("GET", format!("{}/{}/{{id}}", base_url, res.name), format!("Get one {} record", res.name)),
                Operation::Update => (
                    "PATCH",
                    format!("{}/{}/{{id}}", base_url, res.name),
                    format!("Update a {} record", res.name),
                ),
                Operation::Delete => (
                    "DELETE",
                    format!("{}/{}/{{id}}", base_url, res.name),
                    format!("Delete a {} record", res.name),
                ),
            };
            out.push(Endpoint {
                method,
                path,
                resource: Some(res.name.clone()),
                operation: Some(*op),
                description,
            });
        }
    }
    out.push(Endpoint {
        method: "POST",
        path: format!("{}/graphql", base_url),
        resource: None,
        operation: None,
        description: "GraphQL queries and mutations over every resource".into(),
    });
    out
}
