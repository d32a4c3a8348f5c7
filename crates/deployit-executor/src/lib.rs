//! Command execution and workspace handling for deployit.
//!
//! - [`LocalProcessExecutor`] runs git and the package manager on the host
//! - [`GitClient`] clones repositories and checks out branches
//! - [`DirectoryResolver`] finds the directory to build from
//! - [`manifest`] reads `package.json`
//! - [`workspace`] manages clone and artifact directories

pub mod git;
pub mod manifest;
pub mod process;
pub mod resolver;
pub mod workspace;

pub use deployit_core::executor::{CommandOutput, CommandSpec, Executor};
pub use git::GitClient;
pub use manifest::Manifest;
pub use process::LocalProcessExecutor;
pub use resolver::{DirectoryResolver, Resolution, ResolvedDir};
