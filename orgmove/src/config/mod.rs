//! Plan files and execution settings

mod loader;
mod plan;
mod settings;

pub use loader::*;
pub use plan::*;
pub use settings::*;
