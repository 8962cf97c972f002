use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    ChangeHost, Identity, NewPullRequest, PullRequest, PullRequestDetails, PullRequestSummary,
    TreeEntry,
};
use crate::domain::Repository;

const GITHUB_API_BASE: &str = "https://api.github.com";
const GITHUB_JSON: &str = "application/vnd.github+json";
const GITHUB_DIFF: &str = "application/vnd.github.v3.diff";

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Validate that a string looks like a GitHub token based on its prefix.
///
/// Format check only; it does not verify the token is active or scoped.
pub fn is_valid_github_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    GITHUB_TOKEN_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

#[derive(Debug, Deserialize)]
struct ShaObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: ShaObject,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    tree: ShaObject,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubBranchRef {
    #[serde(rename = "ref")]
    name: String,
}

/// A pull request as returned by the REST API (subset of fields).
#[derive(Debug, Deserialize)]
struct GitHubPull {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    html_url: String,
    user: GitHubUser,
    head: GitHubBranchRef,
    base: GitHubBranchRef,
}

impl From<GitHubPull> for PullRequestDetails {
    fn from(pull: GitHubPull) -> Self {
        Self {
            number: pull.number,
            title: pull.title,
            body: pull.body.unwrap_or_default(),
            author: pull.user.login,
            head: pull.head.name,
            base: pull.base.name,
            url: pull.html_url,
        }
    }
}

#[derive(Serialize)]
struct CreateRefBody<'a> {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: &'a str,
}

#[derive(Serialize)]
struct UpdateRefBody<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Serialize)]
struct CreateBlobBody<'a> {
    content: &'a str,
    encoding: &'static str,
}

#[derive(Serialize)]
struct CreateTreeBody<'a> {
    base_tree: &'a str,
    tree: &'a [TreeEntry],
}

#[derive(Serialize)]
struct CreateCommitBody<'a> {
    message: &'a str,
    tree: &'a str,
    parents: [&'a str; 1],
    author: &'a Identity,
    committer: &'a Identity,
}

#[derive(Serialize)]
struct CreatePullBody<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

/// GitHub REST client for the git data and pulls APIs.
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
}

impl GitHubClient {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_api_base(token, GITHUB_API_BASE)
    }

    pub fn with_api_base(token: &str, api_base: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("GitHub token contains characters not allowed in a header")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_JSON));
        headers.insert(USER_AGENT, HeaderValue::from_static("chatforge"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to build GitHub HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn repo_url(&self, repo: &Repository, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, repo.owner, repo.name, path
        )
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        request
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to GitHub", what))?
            .error_for_status()
            .with_context(|| format!("GitHub {} returned error status", what))?
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse {} response from GitHub", what))
    }

    async fn send_empty(&self, request: reqwest::RequestBuilder, what: &str) -> Result<()> {
        request
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to GitHub", what))?
            .error_for_status()
            .with_context(|| format!("GitHub {} returned error status", what))?;
        Ok(())
    }
}

#[async_trait]
impl ChangeHost for GitHubClient {
    async fn get_ref_sha(&self, repo: &Repository, branch: &str) -> Result<String> {
        let url = self.repo_url(repo, &format!("git/ref/heads/{}", branch));
        let resp: RefResponse = self.send_json(self.http.get(&url), "get ref").await?;
        Ok(resp.object.sha)
    }

    async fn create_ref(&self, repo: &Repository, branch: &str, sha: &str) -> Result<()> {
        let url = self.repo_url(repo, "git/refs");
        let body = CreateRefBody {
            git_ref: format!("refs/heads/{}", branch),
            sha,
        };
        self.send_empty(self.http.post(&url).json(&body), "create ref")
            .await
    }

    async fn delete_ref(&self, repo: &Repository, branch: &str) -> Result<()> {
        let url = self.repo_url(repo, &format!("git/refs/heads/{}", branch));
        self.send_empty(self.http.delete(&url), "delete ref").await
    }

    async fn create_blob(&self, repo: &Repository, content: &str) -> Result<String> {
        let url = self.repo_url(repo, "git/blobs");
        let body = CreateBlobBody {
            content,
            encoding: "utf-8",
        };
        let resp: ShaObject = self
            .send_json(self.http.post(&url).json(&body), "create blob")
            .await?;
        Ok(resp.sha)
    }

    async fn get_commit_tree(&self, repo: &Repository, commit_sha: &str) -> Result<String> {
        let url = self.repo_url(repo, &format!("git/commits/{}", commit_sha));
        let resp: CommitResponse = self.send_json(self.http.get(&url), "get commit").await?;
        Ok(resp.tree.sha)
    }

    async fn create_tree(
        &self,
        repo: &Repository,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String> {
        let url = self.repo_url(repo, "git/trees");
        let body = CreateTreeBody {
            base_tree,
            tree: entries,
        };
        let resp: ShaObject = self
            .send_json(self.http.post(&url).json(&body), "create tree")
            .await?;
        Ok(resp.sha)
    }

    async fn create_commit(
        &self,
        repo: &Repository,
        message: &str,
        tree_sha: &str,
        parent_sha: &str,
        author: &Identity,
    ) -> Result<String> {
        let url = self.repo_url(repo, "git/commits");
        let body = CreateCommitBody {
            message,
            tree: tree_sha,
            parents: [parent_sha],
            author,
            committer: author,
        };
        let resp: ShaObject = self
            .send_json(self.http.post(&url).json(&body), "create commit")
            .await?;
        Ok(resp.sha)
    }

    async fn update_ref(&self, repo: &Repository, branch: &str, sha: &str) -> Result<()> {
        let url = self.repo_url(repo, &format!("git/refs/heads/{}", branch));
        let body = UpdateRefBody { sha, force: false };
        self.send_empty(self.http.patch(&url).json(&body), "update ref")
            .await
    }

    async fn create_pull_request(
        &self,
        repo: &Repository,
        request: &NewPullRequest,
    ) -> Result<PullRequest> {
        let url = self.repo_url(repo, "pulls");
        let body = CreatePullBody {
            title: &request.title,
            body: &request.body,
            head: &request.head,
            base: &request.base,
        };
        self.send_json(self.http.post(&url).json(&body), "create pull request")
            .await
    }

    async fn list_open_pulls(
        &self,
        repo: &Repository,
        limit: usize,
    ) -> Result<Vec<PullRequestSummary>> {
        let url = self.repo_url(repo, "pulls");
        let per_page = limit.clamp(1, 100).to_string();
        let pulls: Vec<GitHubPull> = self
            .send_json(
                self.http
                    .get(&url)
                    .query(&[("state", "open"), ("per_page", per_page.as_str())]),
                "list pull requests",
            )
            .await?;
        Ok(pulls
            .into_iter()
            .take(limit)
            .map(|pull| PullRequestSummary {
                number: pull.number,
                title: pull.title,
                author: pull.user.login,
                head: pull.head.name,
            })
            .collect())
    }

    async fn pull_details(&self, repo: &Repository, number: u64) -> Result<PullRequestDetails> {
        let url = self.repo_url(repo, &format!("pulls/{}", number));
        let pull: GitHubPull = self.send_json(self.http.get(&url), "get pull request").await?;
        Ok(pull.into())
    }

    async fn pull_diff(&self, repo: &Repository, number: u64) -> Result<String> {
        let url = self.repo_url(repo, &format!("pulls/{}", number));
        self.http
            .get(&url)
            .header(ACCEPT, GITHUB_DIFF)
            .send()
            .await
            .context("Failed to send pull request diff request to GitHub")?
            .error_for_status()
            .context("GitHub pull request diff returned error status")?
            .text()
            .await
            .context("Failed to read pull request diff from GitHub")
    }
}
