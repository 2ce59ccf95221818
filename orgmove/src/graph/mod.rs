//! Entity dependency graph and schedule construction

mod builder;
mod dependency_graph;

pub use builder::*;
pub use dependency_graph::*;
