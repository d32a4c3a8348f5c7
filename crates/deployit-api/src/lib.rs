//! HTTP API for deployit.
//!
//! Accepts deployment submissions and serves job status and logs.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
