use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::ScmClient;
use crate::config::{RequestConfig, ScmConfig};
use crate::error::{ScmError, ScmResult};

const API_VERSION: &str = "2022-11-28";

/// GitHub REST API client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: &'a str,
}

#[derive(Deserialize)]
struct ContentResponse {
    sha: String,
}

#[derive(Serialize)]
struct PutContentRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Serialize)]
struct DeleteContentRequest<'a> {
    message: &'a str,
    sha: &'a str,
    branch: &'a str,
}

#[derive(Deserialize)]
struct CommitEnvelope {
    commit: CommitRef,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
}

impl GitHubClient {
    /// Create a client. Fails with [`ScmError::MissingToken`] when no token is configured.
    pub fn new(config: &ScmConfig, request_config: &RequestConfig) -> ScmResult<Self> {
        let token = config.token.as_deref().ok_or(ScmError::MissingToken)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("pipeline-healer/", env!("CARGO_PKG_VERSION"))),
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
            ScmError::InvalidResponse {
                message: format!("Token is not a valid header value: {}", e),
            }
        })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map a non-success response to [`ScmError::Api`].
async fn check(response: Response) -> ScmResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ScmError::Api {
        status: status.as_u16(),
        message: body,
    })
}

async fn parse<T: for<'de> Deserialize<'de>>(response: Response, what: &str) -> ScmResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| ScmError::InvalidResponse {
            message: format!("Failed to parse {}: {}", what, e),
        })
}

#[async_trait]
impl ScmClient for GitHubClient {
    async fn get_ref_sha(&self, repo: &str, branch: &str) -> ScmResult<String> {
        let url = self.url(&format!("/repos/{}/git/ref/heads/{}", repo, branch));
        let response = check(self.client.get(&url).send().await?).await?;
        let body: RefResponse = parse(response, "ref").await?;

        debug!(repo = %repo, branch = %branch, sha = %body.object.sha, "Resolved branch head");
        Ok(body.object.sha)
    }

    async fn create_ref(&self, repo: &str, branch: &str, sha: &str) -> ScmResult<()> {
        let url = self.url(&format!("/repos/{}/git/refs", repo));
        let request = CreateRefRequest {
            git_ref: format!("refs/heads/{}", branch),
            sha,
        };
        check(self.client.post(&url).json(&request).send().await?).await?;

        info!(repo = %repo, branch = %branch, "Created branch");
        Ok(())
    }

    async fn get_file_sha(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> ScmResult<Option<String>> {
        let url = self.url(&format!("/repos/{}/contents/{}", repo, path));
        let response = self
            .client
            .get(&url)
            .query(&[("ref", branch)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ContentResponse = parse(check(response).await?, "contents").await?;
        Ok(Some(body.sha))
    }

    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        sha: Option<String>,
    ) -> ScmResult<String> {
        let url = self.url(&format!("/repos/{}/contents/{}", repo, path));
        let request = PutContentRequest {
            message,
            content: STANDARD.encode(content.as_bytes()),
            branch,
            sha,
        };
        let response = check(self.client.put(&url).json(&request).send().await?).await?;
        let body: CommitEnvelope = parse(response, "commit").await?;

        debug!(repo = %repo, path = %path, commit = %body.commit.sha, "Wrote file");
        Ok(body.commit.sha)
    }

    async fn delete_file(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
        message: &str,
        sha: &str,
    ) -> ScmResult<String> {
        let url = self.url(&format!("/repos/{}/contents/{}", repo, path));
        let request = DeleteContentRequest {
            message,
            sha,
            branch,
        };
        let response = check(self.client.delete(&url).json(&request).send().await?).await?;
        let body: CommitEnvelope = parse(response, "commit").await?;

        debug!(repo = %repo, path = %path, commit = %body.commit.sha, "Deleted file");
        Ok(body.commit.sha)
    }

    async fn dispatch_workflow(
        &self,
        repo: &str,
        workflow_file: &str,
        git_ref: &str,
    ) -> ScmResult<()> {
        let url = self.url(&format!(
            "/repos/{}/actions/workflows/{}/dispatches",
            repo, workflow_file
        ));
        check(
            self.client
                .post(&url)
                .json(&DispatchRequest { git_ref })
                .send()
                .await?,
        )
        .await?;

        info!(repo = %repo, workflow = %workflow_file, git_ref = %git_ref, "Dispatched workflow");
        Ok(())
    }
}
