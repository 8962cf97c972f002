use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::Serialize;

/// An addressable code repository. Immutable once loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
}

impl Repository {
    pub fn new(owner: &str, name: &str, default_branch: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            default_branch: default_branch.to_string(),
        }
    }

    /// The unique `owner/name` key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Parse a comma-separated `owner/name[:branch]` list.
///
/// Entries without a branch get `default_branch`. Empty entries are skipped.
pub fn parse_repositories(list: &str, default_branch: &str) -> Result<Vec<Repository>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_repository(entry, default_branch))
        .collect()
}

/// Parse a single `owner/name[:branch]` entry.
pub fn parse_repository(entry: &str, default_branch: &str) -> Result<Repository> {
    let (path, branch) = match entry.split_once(':') {
        Some((path, branch)) => (path.trim(), branch.trim()),
        None => (entry.trim(), default_branch),
    };

    let parts: Vec<&str> = path.split('/').map(str::trim).collect();
    if parts.len() != 2 {
        bail!("Invalid repository '{}' (expected owner/name)", entry);
    }
    if parts[0].is_empty() || parts[1].is_empty() {
        bail!(
            "Invalid repository '{}' (owner and name cannot be empty)",
            entry
        );
    }
    if branch.is_empty() {
        bail!("Invalid repository '{}' (branch cannot be empty)", entry);
    }

    Ok(Repository::new(parts[0], parts[1], branch))
}

/// The fixed set of repositories known at startup, plus the default one
/// new sessions are seeded with.
#[derive(Debug, Clone)]
pub struct RepositoryCatalog {
    repositories: Vec<Arc<Repository>>,
    default_index: usize,
}

impl RepositoryCatalog {
    /// Build a catalog. `default_key` selects the default; when absent the
    /// first repository is the default.
    pub fn new(repositories: Vec<Repository>, default_key: Option<&str>) -> Result<Self> {
        if repositories.is_empty() {
            bail!("At least one repository must be configured");
        }
        let mut seen = HashSet::new();
        for repo in &repositories {
            if !seen.insert(repo.key()) {
                bail!("Repository '{}' is configured more than once", repo.key());
            }
        }
        let default_index = match default_key {
            Some(key) => match repositories.iter().position(|r| r.key() == key) {
                Some(index) => index,
                None => bail!(
                    "Default repository '{}' is not in the configured repositories",
                    key
                ),
            },
            None => 0,
        };
        Ok(Self {
            repositories: repositories.into_iter().map(Arc::new).collect(),
            default_index,
        })
    }

    pub fn default_repository(&self) -> Arc<Repository> {
        Arc::clone(&self.repositories[self.default_index])
    }

    pub fn find(&self, key: &str) -> Option<Arc<Repository>> {
        self.repositories.iter().find(|r| r.key() == key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.repositories.iter().map(|r| r.key()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Repository>> {
        self.repositories.iter()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}
