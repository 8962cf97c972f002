//! Change-hosting capability: the git data and pull request operations the
//! engine needs, plus the change set a Run can hand back for publishing.

pub mod change_set;
pub mod github;
pub mod publish;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Repository;

pub use change_set::{ChangeSet, FileAction, FileChange};
pub use github::{GitHubClient, is_valid_github_token};
pub use publish::{PublishSettings, Published, branch_name, publish_change_set, sanitize};

/// Name and email for commit authorship and trailers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    /// `Co-authored-by: Name <email>`
    pub fn trailer(&self) -> String {
        format!("Co-authored-by: {} <{}>", self.name, self.email)
    }
}

/// One file in a tree created on top of a base tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
}

impl TreeEntry {
    /// A regular (non-executable) file pointing at a blob.
    pub fn file(path: &str, blob_sha: &str) -> Self {
        Self {
            path: path.to_string(),
            mode: "100644".to_string(),
            kind: "blob".to_string(),
            sha: blob_sha.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

/// One line of an open pull request listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSummary {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDetails {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub head: String,
    pub base: String,
    pub url: String,
}

/// Operations against the repository host. Nothing here retries.
#[async_trait]
pub trait ChangeHost: Send + Sync {
    /// Commit SHA at the tip of `branch`.
    async fn get_ref_sha(&self, repo: &Repository, branch: &str) -> Result<String>;

    async fn create_ref(&self, repo: &Repository, branch: &str, sha: &str) -> Result<()>;

    async fn delete_ref(&self, repo: &Repository, branch: &str) -> Result<()>;

    /// Store `content` as a blob, returning its SHA.
    async fn create_blob(&self, repo: &Repository, content: &str) -> Result<String>;

    /// Tree SHA of a commit.
    async fn get_commit_tree(&self, repo: &Repository, commit_sha: &str) -> Result<String>;

    async fn create_tree(
        &self,
        repo: &Repository,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String>;

    async fn create_commit(
        &self,
        repo: &Repository,
        message: &str,
        tree_sha: &str,
        parent_sha: &str,
        author: &Identity,
    ) -> Result<String>;

    async fn update_ref(&self, repo: &Repository, branch: &str, sha: &str) -> Result<()>;

    async fn create_pull_request(
        &self,
        repo: &Repository,
        request: &NewPullRequest,
    ) -> Result<PullRequest>;

    async fn list_open_pulls(
        &self,
        repo: &Repository,
        limit: usize,
    ) -> Result<Vec<PullRequestSummary>>;

    async fn pull_details(&self, repo: &Repository, number: u64) -> Result<PullRequestDetails>;

    /// Unified diff of a pull request.
    async fn pull_diff(&self, repo: &Repository, number: u64) -> Result<String>;
}
