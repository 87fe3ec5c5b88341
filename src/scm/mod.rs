//! Source-hosting API port.
//!
//! The executor only needs a handful of git-data and contents operations,
//! expressed by [`ScmClient`]. [`GitHubClient`] implements them over the
//! GitHub REST API.

mod github;

pub use github::GitHubClient;

use async_trait::async_trait;

use crate::error::ScmResult;

/// Git operations used to publish a fix branch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScmClient: Send + Sync {
    /// Commit sha at the head of `branch`.
    async fn get_ref_sha(&self, repo: &str, branch: &str) -> ScmResult<String>;

    /// Create `branch` pointing at `sha`.
    async fn create_ref(&self, repo: &str, branch: &str, sha: &str) -> ScmResult<()>;

    /// Blob sha of `path` on `branch`, `None` when the file does not exist.
    async fn get_file_sha(&self, repo: &str, path: &str, branch: &str)
        -> ScmResult<Option<String>>;

    /// Create or replace a file in one commit. Returns the commit sha.
    ///
    /// `sha` must be the current blob sha when the file already exists.
    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        sha: Option<String>,
    ) -> ScmResult<String>;

    /// Delete a file in one commit. Returns the commit sha.
    async fn delete_file(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
        message: &str,
        sha: &str,
    ) -> ScmResult<String>;

    /// Start a `workflow_dispatch` run of `workflow_file` on `git_ref`.
    async fn dispatch_workflow(&self, repo: &str, workflow_file: &str, git_ref: &str)
        -> ScmResult<()>;
}
