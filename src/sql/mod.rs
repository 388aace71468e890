//! SQL generation and parameter binding.

pub mod builder;
pub mod params;
pub mod query;

pub use builder::{count, delete, insert, like_pattern, quoted, select_by_id, select_list, update, QueryBuf};
pub use params::BindValue;
pub use query::{Direction, Filter, FilterValue, ListQuery, SortKey};
