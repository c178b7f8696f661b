//! tiergate - provider routing gateway with circuit breaking and
//! streaming translation
//!
//! This library provides the core functionality for the tiergate gateway,
//! including configuration, provider selection, circuit breaking, and
//! request/response translation between API formats.

pub mod config;
pub mod error;
pub mod proxy;
pub mod router;

pub use config::Config;
pub use error::{Error, Result};
