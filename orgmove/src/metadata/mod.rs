//! Entity metadata: describe models, provider seam, per-job cache

mod models;
mod provider;

pub use models::*;
pub use provider::*;
