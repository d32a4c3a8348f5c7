//! CLI command implementations.

pub mod deploy;

use anyhow::{Context, Result, bail};
use deployit_config::parse_system_config;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

/// Thin JSON client for the deployit HTTP API.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let mut base = Url::parse(api_url).with_context(|| format!("Invalid API URL: {api_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    /// Absolute URL of an API path such as `api/deploy/status`.
    pub fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid API path: {path}"))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.endpoint(path, query)?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?;
        decode(response).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.endpoint(path, &[])?;
        let response = self
            .http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;
    if !status.is_success() {
        bail!("{}", error_message(status.as_u16(), &body));
    }
    serde_json::from_str(&body).context("Unexpected response from server")
}

/// Human readable message for an error response.
fn error_message(status: u16, body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return format!("Server returned {status}: {}", body.trim());
    };
    let error = json["error"].as_str().unwrap_or("request failed");
    match json["details"].as_str() {
        Some(details) => format!("{error} ({details}) [{status}]"),
        None => format!("{error} [{status}]"),
    }
}

pub fn validate(path: &str) -> Result<()> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    let config = parse_system_config(&content).and_then(|c| c.validate().map(|_| c));
    match config {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  queue:   {:?}", config.queue.backend);
            println!("  workers: {}", config.worker.concurrency);
            println!("  storage: {:?}", config.storage.backend);
            println!("  listen:  {}", config.server.listen);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_base_path() {
        let client = ApiClient::new("http://localhost:3000").unwrap();
        assert_eq!(
            client
                .endpoint("/api/deploy/status", &[("jobId", "abc")])
                .unwrap()
                .as_str(),
            "http://localhost:3000/api/deploy/status?jobId=abc"
        );

        let client = ApiClient::new("https://example.com/deployit").unwrap();
        assert_eq!(
            client.endpoint("api/deploy", &[]).unwrap().as_str(),
            "https://example.com/deployit/api/deploy"
        );
    }

    #[test]
    fn test_invalid_api_url() {
        assert!(ApiClient::new("not a url").is_err());
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(400, r#"{"error":"Invalid repository URL format"}"#),
            "Invalid repository URL format [400]"
        );
        assert_eq!(
            error_message(500, r#"{"error":"Failed to create deployment job","details":"db down"}"#),
            "Failed to create deployment job (db down) [500]"
        );
        assert_eq!(error_message(502, "Bad Gateway\n"), "Server returned 502: Bad Gateway");
    }
}
