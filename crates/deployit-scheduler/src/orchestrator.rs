//! Deployment pipeline: clone, resolve, install, build, package, upload.

use async_trait::async_trait;
use deployit_config::WorkerConfig;
use deployit_core::artifact::ObjectStore;
use deployit_core::deploy::{DeploymentSpec, UploadResult};
use deployit_core::executor::{CommandOutput, CommandSpec, Executor};
use deployit_core::job::Lease;
use deployit_core::pipeline::{MissingOutputPolicy, Stage, StageError};
use deployit_core::queue::JobStore;
use deployit_core::{DeploymentId, Error, JobId, Result};
use deployit_deployer::{ArtifactUploader, UploadObserver};
use deployit_executor::git::redact_url;
use deployit_executor::workspace;
use deployit_executor::{DirectoryResolver, GitClient, Resolution, manifest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Progress checkpoints of an attempt.
pub mod progress {
    pub const STARTED: u8 = 5;
    pub const CLONED: u8 = 15;
    pub const INSTALLING: u8 = 20;
    pub const INSTALLED: u8 = 50;
    pub const BUILT: u8 = 70;
    pub const PACKAGED: u8 = 75;
    /// Highest value an active attempt reports; completing the job sets 100.
    pub const UPLOADED: u8 = 99;

    /// Progress after `done` of `total` files were processed by the upload.
    pub fn upload(done: usize, total: usize) -> u8 {
        if total == 0 {
            return UPLOADED;
        }
        let span = usize::from(UPLOADED - PACKAGED);
        PACKAGED + (done.min(total) * span / total) as u8
    }
}

/// Lines of command output copied into the job log.
const OUTPUT_TAIL_LINES: usize = 20;

/// Marker line written before a fatal error message.
pub const ERROR_MARKER: &str = "=== ERROR ===";

/// Logs and progress for one attempt of one job, written through its lease.
///
/// Clones share the lease-lost flag, so the heartbeat and the pipeline see
/// the same ownership state.
#[derive(Clone)]
pub struct JobContext {
    store: Arc<dyn JobStore>,
    lease: Lease,
    lease_lost: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new(store: Arc<dyn JobStore>, lease: Lease) -> Self {
        Self {
            store,
            lease,
            lease_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.lease.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.lease.attempt
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Whether another worker may now own this job.
    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    pub fn mark_lease_lost(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
    }

    /// Append a line to the job log, tagged with the attempt number.
    pub async fn log(&self, line: impl AsRef<str>) -> Result<()> {
        let line = line.as_ref();
        info!(job_id = %self.lease.job_id, attempt = self.lease.attempt, run = self.lease.run, "{}", line);
        let tagged = format!("{} {}", self.lease.log_tag(), line);
        self.observe(self.store.append_log(&self.lease, &tagged).await)
    }

    pub async fn progress(&self, value: u8) -> Result<()> {
        self.observe(self.store.update_progress(&self.lease, value).await)
    }

    fn observe(&self, result: Result<()>) -> Result<()> {
        if matches!(result, Err(Error::LeaseLost(_))) {
            self.mark_lease_lost();
        }
        result
    }
}

#[async_trait]
impl UploadObserver for JobContext {
    async fn on_progress(&self, done: usize, total: usize) -> Result<()> {
        self.progress(progress::upload(done, total)).await
    }

    async fn on_log(&self, line: &str) -> Result<()> {
        self.log(line).await
    }
}

/// Pipeline settings taken from the worker configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workspace_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub install_command: Vec<String>,
    pub build_command: Vec<String>,
    pub output_dirs: Vec<String>,
    pub missing_output: MissingOutputPolicy,
    pub max_search_depth: usize,
}

impl From<&WorkerConfig> for PipelineSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            workspace_dir: config.workspace_dir.clone(),
            artifact_dir: config.artifact_dir.clone(),
            install_command: config.install_command.clone(),
            build_command: config.build_command.clone(),
            output_dirs: config.output_dirs.clone(),
            missing_output: config.missing_output,
            max_search_depth: config.max_search_depth,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// Runs one attempt of a deployment.
///
/// Stages run strictly in order. Any fatal stage error aborts the attempt,
/// removes the clone workspace and the artifact directory, and is returned
/// unchanged for the queue to retry or fail. A retry starts over from the
/// clone. An attempt that lost its lease leaves both directories alone: they
/// are keyed by deployment and belong to the new owner.
pub struct DeployPipeline {
    executor: Arc<dyn Executor>,
    git: GitClient,
    resolver: DirectoryResolver,
    uploader: ArtifactUploader,
    settings: PipelineSettings,
}

impl DeployPipeline {
    pub fn new(
        executor: Arc<dyn Executor>,
        object_store: Arc<dyn ObjectStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            git: GitClient::new(executor.clone()),
            resolver: DirectoryResolver::new(settings.max_search_depth),
            uploader: ArtifactUploader::new(object_store),
            executor,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Temporary clone workspace of a deployment.
    pub fn clone_dir(&self, id: &DeploymentId) -> PathBuf {
        self.settings.workspace_dir.join(format!("clone-{id}"))
    }

    /// Final artifact directory of a deployment.
    pub fn artifact_path(&self, id: &DeploymentId) -> PathBuf {
        self.settings.artifact_dir.join(id.as_str())
    }

    /// Run every stage of one attempt.
    pub async fn run(
        &self,
        spec: &DeploymentSpec,
        ctx: &JobContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<UploadResult, StageError> {
        let outcome = self.run_stages(spec, ctx, cancel).await;
        if matches!(outcome, Err(StageError::Queue(Error::LeaseLost(_)))) {
            ctx.mark_lease_lost();
        }
        if ctx.lease_lost() {
            warn!(
                job_id = %ctx.job_id(),
                deployment_id = %spec.deployment_id,
                "Lease lost, leaving the workspace to the current owner"
            );
            return outcome;
        }

        match outcome {
            Ok(result) => {
                self.cleanup(ctx, &self.clone_dir(&spec.deployment_id)).await;
                Ok(result)
            }
            Err(err) => {
                self.cleanup(ctx, &self.clone_dir(&spec.deployment_id)).await;
                self.cleanup(ctx, &self.artifact_path(&spec.deployment_id))
                    .await;
                self.report_failure(ctx, &err).await;
                Err(err)
            }
        }
    }

    async fn report_failure(&self, ctx: &JobContext, err: &StageError) {
        match err {
            StageError::Cancelled => {
                warn!(job_id = %ctx.job_id(), "Attempt cancelled");
                let _ = ctx.log("Deployment interrupted, returning job to the queue").await;
            }
            _ => {
                error!(job_id = %ctx.job_id(), attempt = ctx.attempt(), error = %err, "Deployment failed");
                let _ = ctx.log(ERROR_MARKER).await;
                let _ = ctx.log(err.to_string()).await;
            }
        }
    }

    /// Best-effort removal. Failures are logged and never replace the
    /// attempt's own outcome.
    async fn cleanup(&self, ctx: &JobContext, path: &Path) {
        match workspace::remove_dir_if_exists(path).await {
            Ok(true) => info!(job_id = %ctx.job_id(), path = %path.display(), "Cleaned up"),
            Ok(false) => {}
            Err(e) => {
                let err = StageError::Cleanup(format!("{}: {}", path.display(), e));
                warn!(job_id = %ctx.job_id(), error = %err, "Cleanup failed");
                let _ = ctx.log(format!("Warning: {err}")).await;
            }
        }
    }

    async fn run_stages(
        &self,
        spec: &DeploymentSpec,
        ctx: &JobContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<UploadResult, StageError> {
        let id = &spec.deployment_id;
        let clone_dir = self.clone_dir(id);

        ctx.progress(progress::STARTED).await?;
        ctx.log(format!(
            "Starting deployment {id} of {} ({})",
            spec.repo_name,
            redact_url(&spec.repo_url)
        ))
        .await?;
        ctx.log(format!(
            "Branch: {}, build path: {}",
            spec.branch,
            if spec.build_path.is_empty() {
                "(repository root)"
            } else {
                spec.build_path.as_str()
            }
        ))
        .await?;

        // Clone
        checkpoint(Stage::Clone, cancel)?;
        workspace::remove_dir_if_exists(&clone_dir)
            .await
            .map_err(|e| StageError::Clone(format!("cannot clear workspace: {e}")))?;
        tokio::fs::create_dir_all(&self.settings.workspace_dir)
            .await
            .map_err(|e| StageError::Clone(format!("cannot create workspace: {e}")))?;

        ctx.log("Cloning repository...").await?;
        self.git.clone_repo(&spec.repo_url, &clone_dir, cancel).await?;
        if spec.needs_checkout() {
            ctx.log(format!("Checking out branch {}", spec.branch)).await?;
            self.git.checkout(&clone_dir, &spec.branch, cancel).await?;
        }
        ctx.progress(progress::CLONED).await?;
        ctx.log("Repository cloned").await?;
        if let Ok(entries) = workspace::list_entries(&clone_dir).await {
            ctx.log(format!("Repository contents: {}", entries.join(", ")))
                .await?;
        }

        // Resolve
        checkpoint(Stage::Resolve, cancel)?;
        let resolved = self.resolver.resolve(&clone_dir, &spec.build_path).await?;
        let shown = display_relative(&resolved.path, &clone_dir);
        match resolved.resolution {
            Resolution::Root => ctx.log("Building from repository root").await?,
            Resolution::Direct => ctx.log(format!("Build directory: {shown}")).await?,
            Resolution::Search { depth } => {
                ctx.log(format!(
                    "Build directory \"{}\" found at {shown} (depth {depth})",
                    spec.build_path
                ))
                .await?
            }
        }
        let build_dir = resolved.path;

        // Detect
        checkpoint(Stage::Detect, cancel)?;
        let manifest = manifest::detect(&build_dir).await?;
        let (install, build) = match &manifest {
            Some(m) => {
                ctx.log(format!(
                    "Found {} (dependencies: {}, build script: {})",
                    manifest::MANIFEST_FILE,
                    if m.has_dependencies { "yes" } else { "no" },
                    m.build_script.as_deref().unwrap_or("none")
                ))
                .await?;
                (m.has_dependencies, m.has_build())
            }
            None => {
                ctx.log(format!(
                    "No {} found, deploying directory contents as static files",
                    manifest::MANIFEST_FILE
                ))
                .await?;
                (false, false)
            }
        };

        // Install
        if install {
            checkpoint(Stage::Install, cancel)?;
            ctx.progress(progress::INSTALLING).await?;
            ctx.log(format!(
                "Installing dependencies: {}",
                self.settings.install_command.join(" ")
            ))
            .await?;
            let output = self
                .run_command(&self.settings.install_command, &build_dir, cancel, StageError::Install)
                .await?;
            log_output(ctx, &output).await?;
            ctx.progress(progress::INSTALLED).await?;
            ctx.log("Dependencies installed").await?;
        }

        // Build, then locate its output
        let output_dir = if build {
            checkpoint(Stage::Build, cancel)?;
            ctx.log(format!(
                "Building: {}",
                self.settings.build_command.join(" ")
            ))
            .await?;
            let output = self
                .run_command(&self.settings.build_command, &build_dir, cancel, StageError::Build)
                .await?;
            log_output(ctx, &output).await?;
            ctx.progress(progress::BUILT).await?;
            ctx.log("Build finished").await?;

            checkpoint(Stage::LocateOutput, cancel)?;
            self.locate_output(ctx, &build_dir, &clone_dir).await?
        } else {
            if manifest.is_some() {
                ctx.log("No build script, deploying directory contents as-is")
                    .await?;
            }
            ctx.progress(progress::BUILT).await?;
            build_dir.clone()
        };

        // Package
        checkpoint(Stage::Package, cancel)?;
        // The artifact directory is shared across attempts; confirm the lease first.
        ctx.log("Packaging build output").await?;
        let artifact_path = self.artifact_path(id);
        workspace::remove_dir_if_exists(&artifact_path)
            .await
            .map_err(|e| StageError::Package(format!("cannot clear artifact directory: {e}")))?;
        let copied = workspace::copy_tree(&output_dir, &artifact_path)
            .await
            .map_err(|e| StageError::Package(e.to_string()))?;
        ctx.log(format!(
            "Copied {copied} files from {} to {}",
            display_relative(&output_dir, &clone_dir),
            artifact_path.display()
        ))
        .await?;
        ctx.progress(progress::PACKAGED).await?;

        // Upload
        checkpoint(Stage::Upload, cancel)?;
        let result = self
            .uploader
            .upload(id, &artifact_path, ctx, cancel)
            .await?;
        if !result.failed_files.is_empty() {
            ctx.log(format!(
                "Warning: {} of {} files failed to upload",
                result.failed_count(),
                result.total_files
            ))
            .await?;
        }
        ctx.log(format!("Deployment available at {}", result.object_store_url))
            .await?;

        Ok(result)
    }

    async fn locate_output(
        &self,
        ctx: &JobContext,
        build_dir: &Path,
        clone_dir: &Path,
    ) -> std::result::Result<PathBuf, StageError> {
        if let Some(found) =
            workspace::locate_output(build_dir, &self.settings.output_dirs, clone_dir).await
        {
            ctx.log(format!(
                "Found build output in {}",
                display_relative(&found, build_dir)
            ))
            .await?;
            return Ok(found);
        }

        match self.settings.missing_output {
            MissingOutputPolicy::Fail => Err(StageError::OutputNotFound {
                searched: self.settings.output_dirs.clone(),
            }),
            MissingOutputPolicy::UseBuildDir => {
                ctx.log(format!(
                    "Warning: no build output folder found (looked for: {}), deploying the build directory",
                    self.settings.output_dirs.join(", ")
                ))
                .await?;
                Ok(build_dir.to_path_buf())
            }
        }
    }

    async fn run_command(
        &self,
        argv: &[String],
        dir: &Path,
        cancel: &CancellationToken,
        stage_error: fn(String) -> StageError,
    ) -> std::result::Result<CommandOutput, StageError> {
        let spec = CommandSpec::from_argv(argv)
            .ok_or_else(|| stage_error("no command configured".to_string()))?
            .current_dir(dir);
        let command_line = spec.display();

        let output = self
            .executor
            .run(spec, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled => StageError::Cancelled,
                other => stage_error(other.to_string()),
            })?;

        if !output.success() {
            let status = output
                .exit_code
                .map_or_else(|| "a signal".to_string(), |code| format!("code {code}"));
            return Err(stage_error(format!(
                "`{command_line}` exited with {status}: {}",
                output.tail(OUTPUT_TAIL_LINES)
            )));
        }
        Ok(output)
    }
}

fn checkpoint(stage: Stage, cancel: &CancellationToken) -> std::result::Result<(), StageError> {
    if cancel.is_cancelled() {
        info!(stage = %stage, "Cancelled before stage");
        return Err(StageError::Cancelled);
    }
    Ok(())
}

async fn log_output(ctx: &JobContext, output: &CommandOutput) -> Result<()> {
    let lines: Vec<&str> = output
        .stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    for line in &lines[start..] {
        ctx.log(format!("  {line}")).await?;
    }
    Ok(())
}

fn display_relative(path: &Path, base: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}
