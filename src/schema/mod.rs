//! Schema introspection and the snapshot model.

pub mod introspect;
pub mod normalize;
pub mod types;

pub use introspect::{Introspector, SqlIntrospector};
pub(crate) use introspect::{mysql_options, pg_options};
pub use types::{
    ColumnDescriptor, ColumnRef, Constraint, ConstraintKind, ForeignTarget, SchemaSnapshot,
    SkippedItem, TableDescriptor,
};
