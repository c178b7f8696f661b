//! Routing: the shared provider registry and per-request candidate selection.

mod registry;
pub mod selector;

pub use registry::ProviderRegistry;
pub use selector::{candidates, Candidate, ModelCategory, ModelTarget};
