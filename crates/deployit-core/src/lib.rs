//! Core domain types and traits for deployit.
//!
//! This crate contains:
//! - Job and deployment identifiers
//! - Deployment submissions, validation and upload results
//! - Queued job records and the `JobStore` queue trait
//! - Executor trait for external commands
//! - Artifact/object storage abstraction
//! - Pipeline stages and the stage error taxonomy

pub mod artifact;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod pipeline;
pub mod queue;

pub use error::{Error, Result};
pub use id::{DeploymentId, JobId};
