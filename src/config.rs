//! Layered configuration for chatforge.
//!
//! Values come from, in increasing priority:
//! - built-in defaults
//! - a TOML file (`--config`, `./chatforge.toml`, or `<config dir>/chatforge/config.toml`)
//! - environment variables (a `.env` file in the working directory is loaded first)
//! - CLI flags, applied by the binary
//!
//! ```toml
//! [repositories]
//! list = "acme/api,acme/web:develop"
//! default = "acme/api"
//! default_branch = "main"
//!
//! [generator]
//! command = "claude"
//! workspace = "/workspace"
//! max_concurrent = 5
//! timeout_secs = 1800
//!
//! [server]
//! port = 8080
//!
//! [slack]
//! bot_token = "xoxb-..."
//! delivery_mode = "edit"
//!
//! [github]
//! token = "ghp_..."
//! branch_prefix = "chatforge/"
//!
//! [identity]
//! author_name = "chatforge"
//! author_email = "chatforge@users.noreply.github.com"
//!
//! [logging]
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::domain::{RepositoryCatalog, parse_repositories};
use crate::engine::dispatcher::DEFAULT_LIST_LIMIT;
use crate::engine::gate::DEFAULT_SLOTS_PER_REPOSITORY;
use crate::engine::{DeliveryMode, DispatcherSettings, DriverSettings, ProgressSettings};
use crate::hosting::Identity;
use crate::hosting::publish::{DEFAULT_BRANCH_PREFIX, PublishSettings};
use crate::stream::parser::DEFAULT_MAX_FRAME_BYTES;

pub const CONFIG_FILE_NAME: &str = "chatforge.toml";

const REDACTED: &str = "***";

/// Log output format for the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Repositories the bot may work on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoriesSection {
    /// Comma-separated `owner/name[:branch]` entries.
    pub list: String,
    /// Key of the default repository; the first entry when unset.
    pub default: Option<String>,
    /// Branch for entries that do not name one.
    pub default_branch: String,
}

impl Default for RepositoriesSection {
    fn default() -> Self {
        Self {
            list: String::new(),
            default: None,
            default_branch: "main".to_string(),
        }
    }
}

/// The code generator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSection {
    pub command: String,
    /// Extra arguments placed before the instruction.
    pub extra_args: Vec<String>,
    /// Directory holding one checkout per repository name.
    pub workspace: PathBuf,
    /// Concurrent Runs per repository.
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    pub max_frame_bytes: usize,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            extra_args: Vec::new(),
            workspace: PathBuf::from("/workspace"),
            max_concurrent: DEFAULT_SLOTS_PER_REPOSITORY,
            timeout_secs: 30 * 60,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackSection {
    pub bot_token: Option<String>,
    pub delivery_mode: DeliveryMode,
    /// Minimum seconds between text-only progress edits.
    pub update_interval_secs: u64,
}

impl Default for SlackSection {
    fn default() -> Self {
        Self {
            bot_token: None,
            delivery_mode: DeliveryMode::default(),
            update_interval_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    pub token: Option<String>,
    pub branch_prefix: String,
    pub api_base: Option<String>,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            token: None,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            api_base: None,
        }
    }
}

/// Commit author and the co-author credited in trailers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub author_name: String,
    pub author_email: String,
    pub co_author_name: String,
    pub co_author_email: String,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            author_name: "chatforge".to_string(),
            author_email: "chatforge@users.noreply.github.com".to_string(),
            co_author_name: "Claude".to_string(),
            co_author_email: "noreply+claude@anthropic.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
}

/// Root of `chatforge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatforgeConfig {
    pub repositories: RepositoriesSection,
    pub generator: GeneratorSection,
    pub server: ServerSection,
    pub slack: SlackSection,
    pub github: GitHubSection,
    pub identity: IdentitySection,
    pub logging: LoggingSection,
}

impl ChatforgeConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse chatforge.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Locate the config file: an explicit path must exist; otherwise the
    /// working directory is tried, then the user config directory.
    pub fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            return Ok(Some(path.to_path_buf()));
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok(Some(local));
        }
        Ok(dirs::config_dir()
            .map(|dir| dir.join("chatforge").join("config.toml"))
            .filter(|path| path.exists()))
    }

    /// Defaults, then the config file, then the process environment.
    /// Returns the config and the file it was read from.
    pub fn load_layered(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            return Err(e).context("Failed to load .env file");
        }

        let source = Self::locate(explicit)?;
        let mut config = match &source {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok((config, source))
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("REPOSITORIES") {
            self.repositories.list = v;
        }
        if let Some(v) = get("DEFAULT_REPOSITORY") {
            self.repositories.default = Some(v);
        }
        if let Some(v) = get("DEFAULT_BRANCH") {
            self.repositories.default_branch = v;
        }
        if let Some(v) = get("CLAUDE_CMD") {
            self.generator.command = v;
        }
        if let Some(v) = get("WORKSPACE_PATH") {
            self.generator.workspace = PathBuf::from(v);
        }
        if let Some(v) = get("MAX_CONCURRENT") {
            self.generator.max_concurrent = v
                .trim()
                .parse()
                .with_context(|| format!("MAX_CONCURRENT must be a number, got '{}'", v))?;
        }
        if let Some(v) = get("PORT") {
            self.server.port = v
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a port number, got '{}'", v))?;
        }
        if let Some(v) = get("SLACK_BOT_TOKEN") {
            self.slack.bot_token = Some(v);
        }
        if let Some(v) = get("GITHUB_TOKEN").or_else(|| get("GITHUB_PAT")) {
            self.github.token = Some(v);
        }
        if let Some(v) = get("AUTHOR_NAME") {
            self.identity.author_name = v;
        }
        if let Some(v) = get("AUTHOR_EMAIL") {
            self.identity.author_email = v;
        }
        if let Some(v) = get("CO_AUTHOR_NAME") {
            self.identity.co_author_name = v;
        }
        if let Some(v) = get("CO_AUTHOR_EMAIL") {
            self.identity.co_author_email = v;
        }
        if let Some(v) = get("DELIVERY_MODE") {
            self.slack.delivery_mode = v.parse()?;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = v.parse()?;
        }
        Ok(())
    }

    /// Build the repository catalog; fails when the list is empty or malformed.
    pub fn catalog(&self) -> Result<RepositoryCatalog> {
        let repositories =
            parse_repositories(&self.repositories.list, &self.repositories.default_branch)
                .context("Invalid repositories list")?;
        RepositoryCatalog::new(repositories, self.repositories.default.as_deref())
    }

    /// Check everything except secrets.
    pub fn validate(&self) -> Result<()> {
        self.catalog()?;
        if self.generator.max_concurrent == 0 {
            bail!("generator.max_concurrent must be at least 1");
        }
        if self.generator.timeout_secs == 0 {
            bail!("generator.timeout_secs must be at least 1");
        }
        if self.generator.command.trim().is_empty() {
            bail!("generator.command cannot be empty");
        }
        if self.generator.max_frame_bytes < DEFAULT_MAX_FRAME_BYTES {
            bail!(
                "generator.max_frame_bytes must be at least {} (got {})",
                DEFAULT_MAX_FRAME_BYTES,
                self.generator.max_frame_bytes
            );
        }
        Ok(())
    }

    /// Secrets needed to serve: the Slack bot token and a GitHub token.
    pub fn require_secrets(&self) -> Result<(&str, &str)> {
        let slack = self
            .slack
            .bot_token
            .as_deref()
            .context("SLACK_BOT_TOKEN is not set")?;
        let github = self
            .github
            .token
            .as_deref()
            .context("GITHUB_TOKEN (or GITHUB_PAT) is not set")?;
        Ok((slack, github))
    }

    /// A copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.slack.bot_token = copy.slack.bot_token.map(|_| REDACTED.to_string());
        copy.github.token = copy.github.token.map(|_| REDACTED.to_string());
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn co_author(&self) -> Identity {
        Identity::new(&self.identity.co_author_name, &self.identity.co_author_email)
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            timeout: Duration::from_secs(self.generator.timeout_secs),
            max_frame_bytes: self.generator.max_frame_bytes,
            workspace: self.generator.workspace.clone(),
            co_author: self.co_author(),
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            delivery: self.slack.delivery_mode,
            progress: ProgressSettings {
                update_interval: Duration::from_secs(self.slack.update_interval_secs),
                ..ProgressSettings::default()
            },
            publish: PublishSettings {
                branch_prefix: self.github.branch_prefix.clone(),
                author: Identity::new(&self.identity.author_name, &self.identity.author_email),
                co_author: self.co_author(),
            },
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }
}
