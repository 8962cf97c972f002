//! Repository change transaction: publish a change set as a new branch,
//! one commit, and a pull request. A failure after the branch exists
//! deletes the branch before the error is returned. No step is retried.

use chrono::{DateTime, Utc};

use super::{ChangeHost, ChangeSet, Identity, NewPullRequest, PullRequest, TreeEntry};
use crate::domain::Repository;
use crate::errors::{PublishError, PublishStep};

pub const DEFAULT_BRANCH_PREFIX: &str = "chatforge/";
const TITLE_CAP: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSettings {
    pub branch_prefix: String,
    /// Author and committer of the commit.
    pub author: Identity,
    /// Credited with a `Co-authored-by` trailer.
    pub co_author: Identity,
}

/// A successfully published change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub branch: String,
    pub commit_sha: String,
    pub pull_request: PullRequest,
}

/// Lowercase, spaces to hyphens, drop everything outside `[a-z0-9-]`, cap
/// at `cap` characters.
pub fn sanitize(title: &str, cap: usize) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .take(cap)
        .collect()
}

/// `<prefix><YYYYMMDD-HHMMSS>-<sanitized title>`
pub fn branch_name(now: DateTime<Utc>, prefix: &str, title: &str) -> String {
    let stamp = now.format("%Y%m%d-%H%M%S");
    let slug = sanitize(title, TITLE_CAP);
    if slug.is_empty() {
        format!("{}{}", prefix, stamp)
    } else {
        format!("{}{}-{}", prefix, stamp, slug)
    }
}

fn commit_message(change: &ChangeSet, co_author: &Identity) -> String {
    let mut message = change.title.clone();
    if !change.body.trim().is_empty() {
        message.push_str("\n\n");
        message.push_str(change.body.trim());
    }
    message.push_str("\n\n");
    message.push_str(&co_author.trailer());
    message
}

type StepResult<T> = Result<T, (PublishStep, anyhow::Error)>;

trait AtStep<T> {
    fn at(self, step: PublishStep) -> StepResult<T>;
}

impl<T> AtStep<T> for anyhow::Result<T> {
    fn at(self, step: PublishStep) -> StepResult<T> {
        self.map_err(|e| (step, e))
    }
}

/// Publish `change` against `repo`'s default branch.
pub async fn publish_change_set(
    host: &dyn ChangeHost,
    repo: &Repository,
    change: &ChangeSet,
    settings: &PublishSettings,
) -> Result<Published, PublishError> {
    let base_sha = host
        .get_ref_sha(repo, &repo.default_branch)
        .await
        .map_err(|source| PublishError {
            step: PublishStep::ReadBaseRef,
            branch: None,
            compensated: false,
            source,
        })?;

    let branch = branch_name(Utc::now(), &settings.branch_prefix, &change.title);
    host.create_ref(repo, &branch, &base_sha)
        .await
        .map_err(|source| PublishError {
            step: PublishStep::CreateBranch,
            branch: None,
            compensated: false,
            source,
        })?;
    tracing::info!(repository = %repo.key(), branch = %branch, base = %base_sha, "created branch");

    match commit_and_open(host, repo, change, settings, &branch, &base_sha).await {
        Ok(published) => {
            tracing::info!(
                repository = %repo.key(),
                branch = %published.branch,
                pull_request = published.pull_request.number,
                "published change set"
            );
            Ok(published)
        }
        Err((step, source)) => {
            tracing::warn!(repository = %repo.key(), branch = %branch, step = %step, error = %format!("{:#}", source), "publish failed; deleting branch");
            let compensated = match host.delete_ref(repo, &branch).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(repository = %repo.key(), branch = %branch, error = %format!("{:#}", e), "failed to delete branch after publish failure");
                    false
                }
            };
            Err(PublishError {
                step,
                branch: Some(branch),
                compensated,
                source,
            })
        }
    }
}

async fn commit_and_open(
    host: &dyn ChangeHost,
    repo: &Repository,
    change: &ChangeSet,
    settings: &PublishSettings,
    branch: &str,
    base_sha: &str,
) -> StepResult<Published> {
    let mut entries = Vec::with_capacity(change.files.len());
    for file in &change.files {
        let blob_sha = host
            .create_blob(repo, &file.content)
            .await
            .at(PublishStep::CreateBlob)?;
        entries.push(TreeEntry::file(&file.path, &blob_sha));
    }

    let base_tree = host
        .get_commit_tree(repo, base_sha)
        .await
        .at(PublishStep::ReadBaseCommit)?;
    let tree_sha = host
        .create_tree(repo, &base_tree, &entries)
        .await
        .at(PublishStep::CreateTree)?;

    let message = commit_message(change, &settings.co_author);
    let commit_sha = host
        .create_commit(repo, &message, &tree_sha, base_sha, &settings.author)
        .await
        .at(PublishStep::CreateCommit)?;
    host.update_ref(repo, branch, &commit_sha)
        .await
        .at(PublishStep::UpdateBranch)?;

    let pull_request = host
        .create_pull_request(
            repo,
            &NewPullRequest {
                title: change.title.clone(),
                body: change.body.clone(),
                head: branch.to_string(),
                base: repo.default_branch.clone(),
            },
        )
        .await
        .at(PublishStep::OpenPullRequest)?;

    Ok(Published {
        branch: branch.to_string(),
        commit_sha,
        pull_request,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::hosting::{FileAction, FileChange};
    use crate::testing::FakeHost;

    fn settings() -> PublishSettings {
        PublishSettings {
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            author: Identity::new("chatforge", "bot@example.com"),
            co_author: Identity::new("Claude", "noreply+claude@anthropic.com"),
        }
    }

    fn change_set() -> ChangeSet {
        ChangeSet {
            title: "Add health endpoint".to_string(),
            body: "Adds GET /health.".to_string(),
            files: vec![
                FileChange {
                    path: "src/health.rs".to_string(),
                    content: "pub fn ok() {}\n".to_string(),
                    action: FileAction::Create,
                },
                FileChange {
                    path: "src/lib.rs".to_string(),
                    content: "pub mod health;\n".to_string(),
                    action: FileAction::Update,
                },
            ],
        }
    }

    fn repo() -> Repository {
        Repository::new("acme", "api", "main")
    }

    #[test]
    fn test_sanitize_keeps_only_allowed_characters() {
        let slug = sanitize("Fix Bug #42!!", TITLE_CAP);
        assert_eq!(slug, "fix-bug-42");
        assert!(
            slug.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
    }

    #[test]
    fn test_sanitize_respects_cap() {
        let slug = sanitize(&"Very Long Title ".repeat(10), TITLE_CAP);
        assert_eq!(slug.chars().count(), TITLE_CAP);
        assert_eq!(sanitize("ヘルスチェック追加", TITLE_CAP), "");
    }

    #[test]
    fn test_branch_name_format() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(
            branch_name(now, "chatforge/", "Add health endpoint"),
            "chatforge/20260304-050607-add-health-endpoint"
        );
        assert_eq!(
            branch_name(now, "claude/", "ヘルスチェック"),
            "claude/20260304-050607"
        );
    }

    #[test]
    fn test_commit_message_has_trailer() {
        let message = commit_message(&change_set(), &settings().co_author);
        assert_eq!(
            message,
            "Add health endpoint\n\nAdds GET /health.\n\nCo-authored-by: Claude <noreply+claude@anthropic.com>"
        );
    }

    #[tokio::test]
    async fn test_publish_runs_every_step_in_order() {
        let host = FakeHost::default();
        let published = publish_change_set(&host, &repo(), &change_set(), &settings())
            .await
            .unwrap();

        assert!(published.branch.starts_with("chatforge/"));
        assert!(published.branch.ends_with("-add-health-endpoint"));
        assert_eq!(published.pull_request.number, 1);

        let ops: Vec<String> = host.calls().into_iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            [
                "get_ref",
                "create_ref",
                "create_blob",
                "create_blob",
                "get_commit",
                "create_tree",
                "create_commit",
                "update_ref",
                "create_pull"
            ]
        );
    }

    #[tokio::test]
    async fn test_commit_failure_deletes_branch_and_opens_no_pull_request() {
        let host = FakeHost::failing_at("create_commit");
        let err = publish_change_set(&host, &repo(), &change_set(), &settings())
            .await
            .unwrap_err();

        assert_eq!(err.step, PublishStep::CreateCommit);
        assert!(err.compensated);
        let branch = err.branch.clone().unwrap();
        let calls = host.calls();
        let ops: Vec<&str> = calls.iter().map(|c| c.op.as_str()).collect();
        assert_eq!(ops.last(), Some(&"delete_ref"));
        assert_eq!(calls.last().unwrap().detail, branch);
        assert!(!ops.contains(&"create_pull"));
        assert!(!ops.contains(&"update_ref"));
    }

    #[tokio::test]
    async fn test_failed_branch_deletion_is_not_reported_as_compensated() {
        let host = FakeHost::failing_at("create_commit").also_failing_at("delete_ref");
        let err = publish_change_set(&host, &repo(), &change_set(), &settings())
            .await
            .unwrap_err();

        assert_eq!(err.step, PublishStep::CreateCommit);
        assert!(err.branch.is_some());
        assert!(!err.compensated);
        assert_eq!(host.calls().last().unwrap().op, "delete_ref");
    }

    #[tokio::test]
    async fn test_pull_request_failure_also_compensates() {
        let host = FakeHost::failing_at("create_pull");
        let err = publish_change_set(&host, &repo(), &change_set(), &settings())
            .await
            .unwrap_err();
        assert_eq!(err.step, PublishStep::OpenPullRequest);
        assert_eq!(host.calls().last().unwrap().op, "delete_ref");
    }

    #[tokio::test]
    async fn test_failure_before_branch_creation_needs_no_compensation() {
        let host = FakeHost::failing_at("get_ref");
        let err = publish_change_set(&host, &repo(), &change_set(), &settings())
            .await
            .unwrap_err();
        assert_eq!(err.step, PublishStep::ReadBaseRef);
        assert!(err.branch.is_none());
        assert!(!err.compensated);
        assert_eq!(host.calls().len(), 1);

        let host = FakeHost::failing_at("create_ref");
        let err = publish_change_set(&host, &repo(), &change_set(), &settings())
            .await
            .unwrap_err();
        assert_eq!(err.step, PublishStep::CreateBranch);
        assert!(!host.calls().iter().any(|c| c.op == "delete_ref"));
    }
}
