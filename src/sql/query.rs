//! Validated list-request model consumed by the statement builder.

use super::params::BindValue;
use crate::typemap::FilterOp;

#[derive(Clone, Debug, PartialEq)]
pub enum FilterValue {
    One(BindValue),
    Many(Vec<BindValue>),
}

/// `field <op> value`; all filters of a request are joined with AND.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListQuery {
    pub filters: Vec<Filter>,
    pub order: Vec<SortKey>,
    pub limit: u32,
    pub offset: u64,
}
