//! Core data model: records, keys, descriptors, operations

mod descriptor;
mod key;
mod operation;
mod query;
mod record;
mod record_set;
mod transform;

pub use descriptor::*;
pub use key::*;
pub use operation::*;
pub use query::*;
pub use record::*;
pub use record_set::*;
pub use transform::*;
