//! Dynamic dispatch of data requests against synthesized routing tables.

pub mod dispatcher;
pub mod request;

pub use dispatcher::{ActiveRoutes, DispatchOutput, Dispatcher};
pub use request::{parse_graphql_list, parse_list_query, DispatchParams};
