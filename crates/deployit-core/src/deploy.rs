//! Deployment submissions and results.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::sync::LazyLock;

use crate::{DeploymentId, Error, Result};

pub const DEFAULT_REPO_NAME: &str = "repository";
pub const DEFAULT_BRANCH: &str = "main";

/// Number of uploaded paths kept in an [`UploadResult`] preview.
pub const UPLOAD_PREVIEW_LIMIT: usize = 20;

static GIT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(https?://)?([\w.-]+@)?([\w.-]+)(:\d+)?(/[\w.-]+)*\.git$")
        .expect("valid git url regex")
});

static GITHUB_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://github\.com/[\w-]+/[\w-]+$").expect("valid github url regex")
});

/// A deployment request as submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[serde(default)]
    pub repo_url: String,
    pub repo_name: Option<String>,
    pub branch: Option<String>,
    pub build_path: Option<String>,
}

impl DeployRequest {
    /// Validate the request shape and turn it into a [`DeploymentSpec`] with a
    /// freshly generated deployment id.
    pub fn into_spec(self) -> Result<DeploymentSpec> {
        let repo_url = self.repo_url.trim().to_string();
        validate_repo_url(&repo_url)?;

        let repo_name = self
            .repo_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_REPO_NAME.to_string());

        let branch = self
            .branch
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        validate_branch(&branch)?;

        let build_path = self
            .build_path
            .map(|p| p.trim().trim_matches('/').to_string())
            .unwrap_or_default();
        validate_build_path(&build_path)?;

        Ok(DeploymentSpec {
            repo_url,
            repo_name,
            branch,
            build_path,
            deployment_id: DeploymentId::generate(),
        })
    }
}

/// Check that a repository URL looks like a git remote.
pub fn validate_repo_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::Validation("Repository URL is required".to_string()));
    }
    if url.starts_with('-') || url.chars().any(char::is_whitespace) {
        return Err(Error::Validation(
            "Invalid repository URL format".to_string(),
        ));
    }
    if GIT_URL.is_match(url) || GITHUB_URL.is_match(url) || url.ends_with(".git") {
        Ok(())
    } else {
        Err(Error::Validation(
            "Invalid repository URL format".to_string(),
        ))
    }
}

fn validate_branch(branch: &str) -> Result<()> {
    if branch.starts_with('-') || branch.contains("..") || branch.chars().any(char::is_whitespace)
    {
        return Err(Error::Validation(format!("Invalid branch name: {branch:?}")));
    }
    Ok(())
}

fn validate_build_path(build_path: &str) -> Result<()> {
    let escapes = Path::new(build_path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::Validation(format!(
            "Build path must be relative to the repository: {build_path:?}"
        )));
    }
    Ok(())
}

/// The validated description of one deployment, stored as the job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub repo_url: String,
    pub repo_name: String,
    pub branch: String,
    /// Directory to build from; empty means the repository root.
    pub build_path: String,
    pub deployment_id: DeploymentId,
}

impl DeploymentSpec {
    /// Whether the branch needs an explicit checkout after cloning.
    pub fn needs_checkout(&self) -> bool {
        !self.branch.is_empty() && self.branch != "main" && self.branch != "master"
    }
}

/// A file that could not be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedFile {
    pub path: String,
    pub error: String,
}

/// Outcome of uploading an artifact directory.
///
/// `uploaded_count + failed_files.len() == total_files` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub deployment_id: DeploymentId,
    pub total_files: usize,
    pub uploaded_count: usize,
    pub failed_files: Vec<FailedFile>,
    /// Public URL of the deployment's index document.
    pub object_store_url: String,
    /// Backend-specific location of the deployment prefix.
    pub storage_path: String,
    /// The first few uploaded paths, relative to the artifact directory.
    pub uploaded_preview: Vec<String>,
    /// Local artifact directory the files were read from.
    pub local_path: String,
}

impl UploadResult {
    pub fn failed_count(&self) -> usize {
        self.failed_files.len()
    }
}
