//! End-to-end deployment scenarios against the in-memory queue, a fake
//! toolchain and an in-memory object store.

use async_trait::async_trait;
use bytes::Bytes;
use deployit_core::artifact::{ArtifactKey, ObjectStore, StorageError};
use deployit_core::deploy::DeployRequest;
use deployit_core::executor::{CommandOutput, CommandSpec, Executor};
use deployit_core::job::{BackoffPolicy, FailOutcome, JobOptions, JobRecord, JobState};
use deployit_core::pipeline::MissingOutputPolicy;
use deployit_core::queue::JobStore;
use deployit_core::{Error, JobId};
use deployit_scheduler::worker::process_job;
use deployit_scheduler::{DeployPipeline, DeployQueue, MemoryJobStore, PipelineSettings};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const LEASE: Duration = Duration::from_secs(30);

/// Pretends to be git and npm. A clone copies `template` into the
/// destination; a build writes a small tree into `build_output`.
struct FakeToolchain {
    template: PathBuf,
    clone_failures: AtomicU32,
    build_output: Option<String>,
    failing_command: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeToolchain {
    fn new(template: &Path) -> Self {
        Self {
            template: template.to_path_buf(),
            clone_failures: AtomicU32::new(0),
            build_output: Some("dist".to_string()),
            failing_command: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing_clones(self, n: u32) -> Self {
        self.clone_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The build succeeds but writes nothing.
    fn without_build_output(mut self) -> Self {
        self.build_output = None;
        self
    }

    /// `command` exits with status 1.
    fn failing_command(mut self, command: &str) -> Self {
        self.failing_command = Some(command.to_string());
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    let now = chrono::Utc::now();
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        started_at: now,
        finished_at: now,
    }
}

#[async_trait]
impl Executor for FakeToolchain {
    fn name(&self) -> &'static str {
        "fake-toolchain"
    }

    async fn run(
        &self,
        spec: CommandSpec,
        _cancel: &CancellationToken,
    ) -> deployit_core::Result<CommandOutput> {
        let command = format!("{} {}", spec.program, spec.args.join(" "));
        let key = if spec.program == "git" && spec.args.first().map(String::as_str) == Some("clone")
        {
            "git clone".to_string()
        } else {
            command
        };
        self.calls.lock().unwrap().push(key.clone());
        if self.failing_command.as_deref() == Some(key.as_str()) {
            return Ok(output(1, "", &format!("npm ERR! {key} failed")));
        }

        let dir = spec.working_dir.clone().unwrap_or_default();
        match key.as_str() {
            "git clone" => {
                let remaining = self.clone_failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.clone_failures.store(remaining - 1, Ordering::SeqCst);
                    return Ok(output(128, "", "fatal: unable to access repository"));
                }
                let dest = PathBuf::from(spec.args.last().cloned().unwrap_or_default());
                copy_dir(&self.template, &dest);
                std::fs::create_dir_all(dest.join(".git")).unwrap();
                std::fs::write(dest.join(".git/HEAD"), "ref: refs/heads/main").unwrap();
                Ok(output(0, "", "Cloning into 'repo'..."))
            }
            "npm install" => {
                std::fs::create_dir_all(dir.join("node_modules/left-pad")).unwrap();
                Ok(output(0, "added 1 package in 1s", ""))
            }
            "npm run build" => {
                if let Some(out) = &self.build_output {
                    let out = dir.join(out);
                    std::fs::create_dir_all(out.join("assets")).unwrap();
                    std::fs::write(out.join("index.html"), "<html></html>").unwrap();
                    std::fs::write(out.join("app.js"), "console.log(1)").unwrap();
                    std::fs::write(out.join("assets/logo.png"), [0x89, 0x50]).unwrap();
                }
                Ok(output(0, "built in 42ms", ""))
            }
            other => Err(Error::Internal(format!("unexpected command: {other}"))),
        }
    }
}

fn copy_dir(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}

/// Keeps uploaded objects in memory; keys ending in `fail_suffix` fail.
#[derive(Default)]
struct MemoryObjectStore {
    fail_suffix: Option<String>,
    objects: Mutex<Vec<(String, String)>>,
}

impl MemoryObjectStore {
    fn failing_on(suffix: &str) -> Self {
        Self {
            fail_suffix: Some(suffix.to_string()),
            ..Default::default()
        }
    }

    fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        key: &ArtifactKey,
        _data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let object_key = key.object_key();
        if let Some(suffix) = &self.fail_suffix {
            if object_key.ends_with(suffix.as_str()) {
                return Err(StorageError::Http {
                    status: 503,
                    body: "SlowDown".to_string(),
                });
            }
        }
        self.objects
            .lock()
            .unwrap()
            .push((object_key, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, object_key: &str) -> String {
        format!("https://cdn.test/{object_key}")
    }

    fn location(&self, prefix: &str) -> String {
        format!("memory://{prefix}")
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<MemoryJobStore>,
    queue: DeployQueue,
    toolchain: Arc<FakeToolchain>,
    objects: Arc<MemoryObjectStore>,
    pipeline: Arc<DeployPipeline>,
}

impl Harness {
    fn new(toolchain: FakeToolchain, objects: MemoryObjectStore) -> Self {
        Self::with_settings(toolchain, objects, |_| {})
    }

    fn with_settings(
        toolchain: FakeToolchain,
        objects: MemoryObjectStore,
        configure: impl FnOnce(&mut PipelineSettings),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let toolchain = Arc::new(toolchain);
        let objects = Arc::new(objects);
        let mut settings = PipelineSettings {
            workspace_dir: dir.path().join("temp"),
            artifact_dir: dir.path().join("dist"),
            ..Default::default()
        };
        configure(&mut settings);
        let pipeline = Arc::new(DeployPipeline::new(
            toolchain.clone(),
            objects.clone(),
            settings,
        ));
        let options = JobOptions {
            max_attempts: 1,
            ..Default::default()
        };
        Self {
            queue: DeployQueue::new(store.clone(), options),
            dir,
            store,
            toolchain,
            objects,
            pipeline,
        }
    }

    async fn submit(&self, build_path: Option<&str>) -> JobId {
        self.queue
            .submit(DeployRequest {
                repo_url: "https://github.com/acme/site".to_string(),
                repo_name: Some("site".to_string()),
                build_path: build_path.map(str::to_string),
                ..Default::default()
            })
            .await
            .unwrap()
            .job_id
    }

    /// Claim the next job and run it to the end of its attempt.
    async fn run_next(&self) {
        let job = self
            .store
            .claim("test-worker", LEASE)
            .await
            .unwrap()
            .expect("a claimable job");
        process_job(
            self.store.clone(),
            self.pipeline.clone(),
            job,
            LEASE,
            CancellationToken::new(),
        )
        .await;
    }

    async fn record(&self, id: JobId) -> JobRecord {
        self.queue.status(id).await.unwrap().unwrap()
    }

    fn artifact_dir(&self, record: &JobRecord) -> PathBuf {
        self.dir
            .path()
            .join("dist")
            .join(record.spec.deployment_id.as_str())
    }

    fn clone_dir(&self, record: &JobRecord) -> PathBuf {
        self.dir
            .path()
            .join("temp")
            .join(format!("clone-{}", record.spec.deployment_id))
    }
}

fn template(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (path, content) in files {
        let path = dir.path().join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    dir
}

const BUILDABLE: &str =
    r#"{"name":"site","dependencies":{"react":"^18"},"scripts":{"build":"vite build"}}"#;

fn static_site() -> TempDir {
    template(&[
        ("index.html", "<html></html>"),
        ("css/site.css", "body {}"),
        ("img/logo.svg", "<svg/>"),
    ])
}

#[tokio::test]
async fn scenario_a_full_build_from_root() {
    let repo = template(&[
        (
            "package.json",
            r#"{"name":"site","dependencies":{"react":"^18"},"scripts":{"build":"vite build"}}"#,
        ),
        ("src/main.js", "import React from 'react'"),
    ]);
    let h = Harness::new(
        FakeToolchain::new(repo.path()),
        MemoryObjectStore::default(),
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(
        h.toolchain.calls(),
        vec!["git clone", "npm install", "npm run build"]
    );

    let result = record.result.clone().unwrap();
    assert_eq!(result.total_files, 3);
    assert_eq!(result.uploaded_count, 3);
    assert!(result.failed_files.is_empty());
    assert_eq!(
        result.object_store_url,
        format!("https://cdn.test/{}/index.html", record.spec.deployment_id)
    );

    let mut keys = h.objects.keys();
    keys.sort();
    let id_prefix = record.spec.deployment_id.to_string();
    assert_eq!(
        keys,
        vec![
            format!("{id_prefix}/app.js"),
            format!("{id_prefix}/assets/logo.png"),
            format!("{id_prefix}/index.html"),
        ]
    );

    assert!(h.artifact_dir(&record).join("index.html").exists());
    assert!(!h.clone_dir(&record).exists());
    assert!(
        record
            .logs
            .iter()
            .any(|l| l == "[attempt 1] Found build output in dist")
    );
}

#[tokio::test]
async fn scenario_b_missing_build_path_fails_before_install() {
    let repo = template(&[
        ("package.json", r#"{"dependencies":{"x":"1"}}"#),
        ("docs/readme.md", "# docs"),
        ("src/index.js", ""),
    ]);
    let h = Harness::new(
        FakeToolchain::new(repo.path()),
        MemoryObjectStore::default(),
    );
    let id = h.submit(Some("missingFolder")).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_eq!(record.state, JobState::Failed);
    assert!(record.progress < 20);
    assert_eq!(h.toolchain.calls(), vec!["git clone"]);

    let reason = record.failed_reason.clone().unwrap();
    assert!(reason.contains("missingFolder"));
    assert!(reason.contains("docs, src"));

    let marker = record
        .logs
        .iter()
        .position(|l| l == "[attempt 1] === ERROR ===")
        .expect("error marker logged");
    assert!(record.logs[marker + 1].contains("missingFolder"));

    assert!(!h.clone_dir(&record).exists());
    assert!(!h.artifact_dir(&record).exists());
    assert!(h.objects.keys().is_empty());
}

#[tokio::test]
async fn scenario_c_static_site_is_deployed_as_is() {
    let repo = static_site();
    let h = Harness::new(
        FakeToolchain::new(repo.path()),
        MemoryObjectStore::default(),
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(h.toolchain.calls(), vec!["git clone"]);

    let result = record.result.clone().unwrap();
    assert_eq!(result.total_files, 3);
    assert_eq!(result.uploaded_count, 3);
    // The clone's .git directory is not part of the artifact.
    assert!(h.objects.keys().iter().all(|k| !k.contains(".git")));
    assert!(!h.artifact_dir(&record).join(".git").exists());
}

#[tokio::test]
async fn scenario_d_partial_upload_failure_still_completes() {
    let repo = static_site();
    let h = Harness::new(
        FakeToolchain::new(repo.path()),
        MemoryObjectStore::failing_on("css/site.css"),
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.progress, 100);

    let result = record.result.clone().unwrap();
    assert_eq!(result.total_files, 3);
    assert_eq!(result.uploaded_count, 2);
    assert_eq!(result.failed_files.len(), 1);
    assert_eq!(result.failed_files[0].path, "css/site.css");
    assert_eq!(
        result.uploaded_count + result.failed_files.len(),
        result.total_files
    );
    assert!(record.logs.iter().any(|l| l.contains("Failed to upload css/site.css")));
}

#[tokio::test]
async fn scenario_e_clone_failure_is_retried_after_backoff() {
    let repo = static_site();
    let mut h = Harness::new(
        FakeToolchain::new(repo.path()).failing_clones(1),
        MemoryObjectStore::default(),
    );
    let backoff = Duration::from_millis(100);
    h.queue = DeployQueue::new(
        h.store.clone(),
        JobOptions {
            max_attempts: 3,
            backoff: BackoffPolicy::exponential(backoff),
            ..Default::default()
        },
    );
    let id = h.submit(None).await;

    let first = h.store.claim("test-worker", LEASE).await.unwrap().unwrap();
    assert_eq!(first.lease.attempt, 1);
    let first_started = Instant::now();
    process_job(
        h.store.clone(),
        h.pipeline.clone(),
        first,
        LEASE,
        CancellationToken::new(),
    )
    .await;

    let record = h.record(id).await;
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.attempts_made, 1);
    assert!(record.logs.iter().any(|l| l == "[attempt 1] === ERROR ==="));

    // Not claimable until the backoff delay has passed.
    assert!(h.store.claim("test-worker", LEASE).await.unwrap().is_none());

    let second = loop {
        if let Some(job) = h.store.claim("test-worker", LEASE).await.unwrap() {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(first_started.elapsed() >= backoff);
    assert_eq!(second.lease.attempt, 2);
    process_job(
        h.store.clone(),
        h.pipeline.clone(),
        second,
        LEASE,
        CancellationToken::new(),
    )
    .await;

    let record = h.record(id).await;
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.attempts_made, 2);
    assert_eq!(record.progress, 100);
    assert_eq!(h.toolchain.calls(), vec!["git clone", "git clone"]);
    assert!(record.logs.iter().any(|l| l.starts_with("[attempt 2] ")));
    assert!(record.failed_reason.is_none());
}

/// The attempt failed and left nothing behind.
fn assert_failed_clean(h: &Harness, record: &JobRecord) {
    assert_eq!(record.state, JobState::Failed);
    assert!(record.logs.iter().any(|l| l == "[attempt 1] === ERROR ==="));
    assert!(!h.clone_dir(record).exists());
    assert!(!h.artifact_dir(record).exists());
    assert!(h.objects.keys().is_empty());
}

#[tokio::test]
async fn missing_build_output_fails_the_attempt() {
    let repo = template(&[("package.json", BUILDABLE), ("src/main.js", "")]);
    let h = Harness::new(
        FakeToolchain::new(repo.path()).without_build_output(),
        MemoryObjectStore::default(),
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_failed_clean(&h, &record);
    assert_eq!(
        h.toolchain.calls(),
        vec!["git clone", "npm install", "npm run build"]
    );
    assert_eq!(
        record.failed_reason.as_deref(),
        Some("No build output folder found (looked for: dist, build, out, .next)")
    );
}

#[tokio::test]
async fn missing_build_output_can_deploy_the_build_dir() {
    let repo = template(&[("package.json", BUILDABLE), ("src/main.js", "")]);
    let h = Harness::with_settings(
        FakeToolchain::new(repo.path()).without_build_output(),
        MemoryObjectStore::default(),
        |settings| settings.missing_output = MissingOutputPolicy::UseBuildDir,
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_eq!(record.state, JobState::Completed);
    assert!(
        record
            .logs
            .iter()
            .any(|l| l.contains("no build output folder found") && l.contains("deploying the build directory"))
    );

    let mut keys = h.objects.keys();
    keys.sort();
    let id_prefix = record.spec.deployment_id.to_string();
    assert_eq!(
        keys,
        vec![
            format!("{id_prefix}/package.json"),
            format!("{id_prefix}/src/main.js"),
        ]
    );
    assert!(!h.clone_dir(&record).exists());
}

#[tokio::test]
async fn install_failure_removes_workspace() {
    let repo = template(&[("package.json", BUILDABLE), ("src/main.js", "")]);
    let h = Harness::new(
        FakeToolchain::new(repo.path()).failing_command("npm install"),
        MemoryObjectStore::default(),
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_failed_clean(&h, &record);
    assert_eq!(h.toolchain.calls(), vec!["git clone", "npm install"]);

    let reason = record.failed_reason.clone().unwrap();
    assert!(reason.starts_with("Dependency installation failed: "));
    assert!(reason.contains("`npm install` exited with code 1"));
    assert!(reason.contains("npm ERR! npm install failed"));
}

#[tokio::test]
async fn build_failure_removes_workspace() {
    let repo = template(&[("package.json", BUILDABLE), ("src/main.js", "")]);
    let h = Harness::new(
        FakeToolchain::new(repo.path()).failing_command("npm run build"),
        MemoryObjectStore::default(),
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_failed_clean(&h, &record);
    assert_eq!(
        h.toolchain.calls(),
        vec!["git clone", "npm install", "npm run build"]
    );

    let reason = record.failed_reason.clone().unwrap();
    assert!(reason.starts_with("Build failed: "));
    assert!(reason.contains("`npm run build` exited with code 1"));
}

#[tokio::test]
async fn invalid_manifest_fails_before_install() {
    let repo = template(&[("package.json", "{ \"name\": "), ("index.html", "<html>")]);
    let h = Harness::new(
        FakeToolchain::new(repo.path()),
        MemoryObjectStore::default(),
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_failed_clean(&h, &record);
    assert_eq!(h.toolchain.calls(), vec!["git clone"]);
    assert!(
        record
            .failed_reason
            .as_deref()
            .unwrap()
            .starts_with("Invalid package.json: ")
    );
}

#[tokio::test]
async fn dependencies_without_build_script_deploy_as_is() {
    let repo = template(&[
        ("package.json", r#"{"dependencies":{"left-pad":"1"}}"#),
        ("index.html", "<html></html>"),
    ]);
    let h = Harness::new(
        FakeToolchain::new(repo.path()),
        MemoryObjectStore::default(),
    );
    let id = h.submit(None).await;
    h.run_next().await;

    let record = h.record(id).await;
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(h.toolchain.calls(), vec!["git clone", "npm install"]);
    assert!(
        record
            .logs
            .iter()
            .any(|l| l == "[attempt 1] No build script, deploying directory contents as-is")
    );

    let result = record.result.clone().unwrap();
    assert_eq!(result.total_files, 2);
    assert_eq!(result.uploaded_count, 2);
    let mut keys = h.objects.keys();
    keys.sort();
    let id_prefix = record.spec.deployment_id.to_string();
    assert_eq!(
        keys,
        vec![
            format!("{id_prefix}/index.html"),
            format!("{id_prefix}/package.json"),
        ]
    );
}

#[tokio::test]
async fn retry_outcome_reports_next_attempt() {
    let store = MemoryJobStore::new();
    let spec = DeployRequest {
        repo_url: "https://github.com/acme/site".to_string(),
        ..Default::default()
    }
    .into_spec()
    .unwrap();
    store
        .enqueue(
            spec,
            JobOptions {
                max_attempts: 2,
                backoff: BackoffPolicy::exponential(Duration::from_millis(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = store.claim("w", LEASE).await.unwrap().unwrap();
    assert!(matches!(
        store.fail(&job.lease, "boom").await.unwrap(),
        FailOutcome::Retrying { attempt: 1, .. }
    ));
}
