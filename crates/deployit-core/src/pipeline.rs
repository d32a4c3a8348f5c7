//! Deployment pipeline stages and stage errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Error;

/// A stage of the build-and-deploy pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clone,
    Resolve,
    Detect,
    Install,
    Build,
    LocateOutput,
    Package,
    Upload,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Clone => "clone",
            Stage::Resolve => "resolve",
            Stage::Detect => "detect",
            Stage::Install => "install",
            Stage::Build => "build",
            Stage::LocateOutput => "locate_output",
            Stage::Package => "package",
            Stage::Upload => "upload",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a build ran but none of the known output directories
/// exists afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingOutputPolicy {
    /// Fail the attempt with [`StageError::OutputNotFound`].
    #[default]
    Fail,
    /// Deploy the build directory itself.
    UseBuildDir,
}

impl std::str::FromStr for MissingOutputPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(MissingOutputPolicy::Fail),
            "use-build-dir" => Ok(MissingOutputPolicy::UseBuildDir),
            other => Err(format!(
                "unknown missing-output policy {other:?} (expected \"fail\" or \"use-build-dir\")"
            )),
        }
    }
}

/// Fatal errors raised by pipeline stages.
///
/// The display string is what ends up as the job's failure reason.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to clone repository: {0}")]
    Clone(String),

    #[error("Failed to checkout branch \"{branch}\": {message}")]
    BranchCheckout { branch: String, message: String },

    #[error("Folder \"{target}\" not found in repository (available folders: {})", .available.join(", "))]
    DirectoryNotFound {
        target: String,
        available: Vec<String>,
    },

    #[error("Invalid package.json: {0}")]
    ManifestParse(String),

    #[error("Dependency installation failed: {0}")]
    Install(String),

    #[error("Build failed: {0}")]
    Build(String),

    #[error("No build output folder found (looked for: {})", .searched.join(", "))]
    OutputNotFound { searched: Vec<String> },

    #[error("Failed to package artifacts: {0}")]
    Package(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Deployment cancelled")]
    Cancelled,

    #[error("Queue error: {0}")]
    Queue(Error),
}

impl StageError {
    /// Whether the attempt was aborted by a cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }
}

impl From<Error> for StageError {
    fn from(err: Error) -> Self {
        match err {
            Error::Cancelled => StageError::Cancelled,
            other => StageError::Queue(other),
        }
    }
}
