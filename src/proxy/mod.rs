//! HTTP gateway module.
//!
//! This module provides the messages-format HTTP API that accepts
//! requests and forwards them to selected upstream providers, with
//! circuit breaking, retry with fallback, and streaming translation.

pub mod circuit_breaker;
mod handlers;
pub mod health;
pub mod retry;
mod server;
pub mod stream;
pub mod translate;
pub mod types;

pub use server::{create_router, run_server, AppState, RequestId};
