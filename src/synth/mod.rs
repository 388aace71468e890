//! Endpoint synthesis: routing tables and their GraphQL surface.

pub mod endpoints;
pub mod graphql;
pub mod resource;
pub mod synthesize;

pub use endpoints::{describe_endpoints, Endpoint};
pub use graphql::{GqlRootField, GraphqlSchema, RootKind};
pub use resource::{FieldDef, Operation, Relation, ResourceDefinition, RoutingTable};
pub use synthesize::synthesize;
