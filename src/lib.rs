//! Schema synth: REST and GraphQL APIs synthesized from live database schemas, plus
//! per-project database provisioning.

pub mod case;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod lifecycle;
pub mod registry;
pub mod response;
pub mod routes;
pub mod schema;
pub mod service;
pub mod settings;
pub mod sql;
pub mod state;
pub mod synth;
pub mod typemap;

pub use dispatch::{DispatchOutput, DispatchParams, Dispatcher};
pub use engine::{
    ApiStatus, EndpointListing, Engine, EngineParts, ExecutorFactory, ProjectOverview, ProvisionOutcome, RefreshOutcome,
};
pub use error::{AppError, ConfigError, UpstreamCode};
pub use lifecycle::{ContainerRuntime, LifecycleManager, LifecycleState, ReadinessProbe};
pub use registry::{DatabaseConnection, DatabaseKind, MemoryProjectStore, PgProjectStore, Project, ProjectStore};
pub use response::{success_created, success_many, success_one, success_page};
pub use routes::{app, common_routes, data_routes, project_routes};
pub use schema::{Introspector, SchemaSnapshot};
pub use service::QueryExecutor;
pub use settings::Settings;
pub use state::AppState;
pub use synth::{synthesize, Operation, RootKind, RoutingTable};
