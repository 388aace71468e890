pub mod caller;

pub use caller::{CallerId, CALLER_ID_HEADER};
