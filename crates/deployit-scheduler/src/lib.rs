//! Job scheduling and execution for deployit.
//!
//! Submits deployments to the job queue, claims them on workers and runs
//! each attempt through the clone/build/upload pipeline. Backed by
//! PostgreSQL with SKIP LOCKED for distributed claiming, or by an in-process
//! store for development and tests.

pub mod memory;
pub mod orchestrator;
pub mod queue;
pub mod worker;

pub use memory::MemoryJobStore;
pub use orchestrator::{DeployPipeline, JobContext, PipelineSettings};
pub use queue::{DeployQueue, Submission};
pub use worker::{Worker, WorkerSettings};
