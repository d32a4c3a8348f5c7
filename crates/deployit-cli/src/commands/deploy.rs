//! Deployment commands.

use anyhow::{Result, bail};
use deployit_core::deploy::{DeployRequest, UploadResult};
use deployit_core::job::JobState;
use serde::Deserialize;
use std::time::Duration;

use super::ApiClient;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    deployment_id: String,
    job_id: String,
    repo_name: String,
    branch: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: JobState,
    progress: u8,
    #[serde(default)]
    logs: Vec<String>,
    result: Option<UploadResult>,
    failed_reason: Option<String>,
    attempts_made: u32,
}

#[derive(Debug, Deserialize)]
struct JobLogs {
    logs: Vec<String>,
}

pub async fn submit(client: &ApiClient, request: DeployRequest, wait: bool) -> Result<()> {
    let response: SubmitResponse = client.post("api/deploy", &request).await?;
    println!("{}", response.message);
    println!("  job:        {}", response.job_id);
    println!("  deployment: {}", response.deployment_id);
    println!("  repository: {} ({})", response.repo_name, response.branch);

    if wait {
        let status = follow(client, &response.job_id).await?;
        return finish(&status);
    }
    Ok(())
}

pub async fn status(client: &ApiClient, job_id: &str) -> Result<()> {
    let status = fetch_status(client, job_id).await?;
    println!("Job {job_id}");
    println!("  state:    {}", status.state.as_str());
    println!("  progress: {}%", status.progress);
    println!("  attempts: {}", status.attempts_made);
    if let Some(result) = &status.result {
        print_result(result);
    }
    if let Some(reason) = &status.failed_reason {
        println!("  reason:   {reason}");
    }
    Ok(())
}

pub async fn logs(client: &ApiClient, job_id: &str, follow_logs: bool) -> Result<()> {
    if follow_logs {
        let status = follow(client, job_id).await?;
        return finish(&status);
    }
    let logs: JobLogs = client
        .get("api/deploy/logs", &[("jobId", job_id)])
        .await?;
    for line in logs.logs {
        println!("{line}");
    }
    Ok(())
}

async fn fetch_status(client: &ApiClient, job_id: &str) -> Result<JobStatus> {
    client
        .get("api/deploy/status", &[("jobId", job_id)])
        .await
}

/// Print log lines as they arrive until the job reaches a terminal state.
async fn follow(client: &ApiClient, job_id: &str) -> Result<JobStatus> {
    let mut seen = 0;
    loop {
        let status = fetch_status(client, job_id).await?;
        for line in new_lines(&status.logs, &mut seen) {
            println!("{line}");
        }
        if status.state.is_terminal() {
            return Ok(status);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Lines appended since the last call; logs only ever grow.
fn new_lines<'a>(logs: &'a [String], seen: &mut usize) -> &'a [String] {
    let start = (*seen).min(logs.len());
    *seen = logs.len();
    &logs[start..]
}

fn finish(status: &JobStatus) -> Result<()> {
    match status.state {
        JobState::Completed => {
            println!("Deployment completed");
            if let Some(result) = &status.result {
                print_result(result);
            }
            Ok(())
        }
        _ => bail!(
            "Deployment failed after {} attempt(s): {}",
            status.attempts_made,
            status.failed_reason.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn print_result(result: &UploadResult) {
    println!("  url:      {}", result.object_store_url);
    println!(
        "  uploaded: {}/{} files",
        result.uploaded_count, result.total_files
    );
    for failed in &result.failed_files {
        println!("  failed:   {} ({})", failed.path, failed.error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lines_only_returns_appended() {
        let mut seen = 0;
        let mut logs = vec!["a".to_string(), "b".to_string()];
        assert_eq!(new_lines(&logs, &mut seen), ["a", "b"]);
        assert!(new_lines(&logs, &mut seen).is_empty());

        logs.push("c".to_string());
        assert_eq!(new_lines(&logs, &mut seen), ["c"]);
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_status_response_parses() {
        let status: JobStatus = serde_json::from_str(
            r#"{
                "jobId": "0191e1b4-7c2a-7d30-a5b2-4d1c3e5f6a7b",
                "state": "failed",
                "progress": 15,
                "data": {},
                "logs": ["[attempt 1] Cloning repository..."],
                "failedReason": "Failed to clone repository: not found",
                "attemptsMade": 3,
                "timestamp": "2026-01-01T00:00:00Z",
                "processedOn": null,
                "finishedOn": null
            }"#,
        )
        .unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempts_made, 3);
        let err = finish(&status).unwrap_err().to_string();
        assert!(err.contains("after 3 attempt(s)"));
        assert!(err.contains("not found"));
    }
}
