use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

static JSON_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*\n(.*?)\n\s*```").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    /// Full file content, not a diff.
    pub content: String,
    pub action: FileAction,
}

/// A multi-file change to publish as one branch, commit, and pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub title: String,
    pub body: String,
    pub files: Vec<FileChange>,
}

#[derive(Debug, Deserialize)]
struct RawChangeSet {
    pr_title: Option<String>,
    #[serde(default)]
    pr_body: String,
    files: Option<Vec<RawFileChange>>,
}

#[derive(Debug, Deserialize)]
struct RawFileChange {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    action: String,
}

impl ChangeSet {
    /// Find a change set in a Run's result text: a fenced `json` block, or
    /// the whole text when it is a bare JSON object.
    ///
    /// `Ok(None)` means the text carries no change set. A candidate that names
    /// `pr_title` or `files` but fails validation is an error.
    pub fn extract(raw: &str) -> Result<Option<ChangeSet>> {
        let (candidate, fenced) = match JSON_BLOCK_REGEX.captures(raw).and_then(|c| c.get(1)) {
            Some(block) => (block.as_str().trim(), true),
            None => (raw.trim(), false),
        };
        if !candidate.starts_with('{') {
            return Ok(None);
        }

        let parsed: RawChangeSet = match serde_json::from_str(candidate) {
            Ok(parsed) => parsed,
            Err(e) if fenced => {
                return Err(e).context("Change set block is not valid JSON");
            }
            Err(_) => return Ok(None),
        };
        if parsed.pr_title.is_none() && parsed.files.is_none() {
            return Ok(None);
        }
        parsed.validate().map(Some)
    }
}

impl RawChangeSet {
    fn validate(self) -> Result<ChangeSet> {
        let title = self.pr_title.unwrap_or_default().trim().to_string();
        if title.is_empty() {
            bail!("pr_title is empty");
        }
        let raw_files = self.files.unwrap_or_default();
        if raw_files.is_empty() {
            bail!("no files in change set");
        }

        let mut files = Vec::with_capacity(raw_files.len());
        for (i, file) in raw_files.into_iter().enumerate() {
            let path = file.path.trim().trim_start_matches("./").to_string();
            if path.is_empty() {
                bail!("file[{}] has an empty path", i);
            }
            if path.starts_with('/') || path.split('/').any(|part| part == "..") {
                bail!("file[{}] ({}) must be a relative path inside the repository", i, path);
            }
            if file.content.is_empty() {
                bail!("file[{}] ({}) has empty content", i, path);
            }
            let action = match file.action.as_str() {
                "create" => FileAction::Create,
                "update" => FileAction::Update,
                other => bail!("file[{}] ({}) has invalid action: {}", i, path, other),
            };
            files.push(FileChange {
                path,
                content: file.content,
                action,
            });
        }

        Ok(ChangeSet {
            title,
            body: self.pr_body,
            files,
        })
    }
}
