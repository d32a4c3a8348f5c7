//! Git operations run through an [`Executor`].

use deployit_core::Error;
use deployit_core::executor::{CommandOutput, CommandSpec, Executor};
use deployit_core::pipeline::StageError;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lines of git output kept in error messages.
const ERROR_TAIL_LINES: usize = 20;

/// Clones repositories and switches branches.
#[derive(Clone)]
pub struct GitClient {
    executor: Arc<dyn Executor>,
}

impl GitClient {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Clone `url` into `dest`. `dest` must not exist yet.
    pub async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, StageError> {
        info!(url = %redact_url(url), path = %dest.display(), "Cloning repository");

        let spec = CommandSpec::new("git").args([
            "clone".to_string(),
            "--".to_string(),
            url.to_string(),
            dest.to_string_lossy().into_owned(),
        ]);

        let output = self
            .executor
            .run(spec, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled => StageError::Cancelled,
                other => StageError::Clone(other.to_string()),
            })?;

        if !output.success() {
            warn!(url = %redact_url(url), exit_code = ?output.exit_code, "Git clone failed");
            return Err(StageError::Clone(redact_all(
                &output.tail(ERROR_TAIL_LINES),
                url,
            )));
        }
        Ok(output)
    }

    /// Check out `branch` inside an existing clone.
    pub async fn checkout(
        &self,
        repo: &Path,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        info!(branch, path = %repo.display(), "Checking out branch");

        let spec = CommandSpec::new("git")
            .args(["checkout", branch])
            .current_dir(repo);

        let output = self.executor.run(spec, cancel).await.map_err(|e| match e {
            Error::Cancelled => StageError::Cancelled,
            other => StageError::BranchCheckout {
                branch: branch.to_string(),
                message: other.to_string(),
            },
        })?;

        if !output.success() {
            return Err(StageError::BranchCheckout {
                branch: branch.to_string(),
                message: output.tail(ERROR_TAIL_LINES),
            });
        }
        Ok(())
    }
}

/// Strip any `user:password@` part from a URL before it is logged.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://[REDACTED]@{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}

fn redact_all(text: &str, url: &str) -> String {
    let redacted = redact_url(url);
    if redacted == url {
        text.to_string()
    } else {
        text.replace(url, &redacted)
    }
}
