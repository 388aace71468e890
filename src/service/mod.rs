//! Query execution, row decoding and request validation.

mod executor;
mod rows;
mod validation;

pub use executor::{DbPool, QueryExecutor, SqlExecutor};
pub use rows::{mysql_row_to_json, pg_row_to_json};
pub use validation::RequestValidator;
