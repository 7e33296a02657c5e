//! Core library for gopayloader: run engine, workers, HTTP clients, JWT
//! generation and cache. Used by the CLI binary; can be reused by other
//! tools embedding load runs.

pub mod config;
pub mod engine;
pub mod error;
pub mod http_clients;
pub mod jwt;
pub mod results;
pub mod worker;

#[cfg(test)]
mod engine_tests;

// Re-export the main API for the CLI
pub use config::{ClientKind, RunConfig};
pub use engine::{clear_cache, jwt_cache_dir, Payloader};
pub use error::{Error, Result};
pub use results::RunResult;
pub use tokio_util::sync::CancellationToken;
