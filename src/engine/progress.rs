//! Progress aggregation: accumulates generator output for one Run and
//! decides when, and what, to tell the thread.

use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::chat::ChatTransport;
use crate::domain::Session;
use crate::stream::{ProgressEvent, RunResult};

static HEADING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[\s&&[^\n]]*#{1,6}[ \t]+").unwrap());
static EMPHASIS_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*{2,}").unwrap());

const DIVIDER: &str = "───";

/// How status updates reach the thread. One mode per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Edit one status message in place.
    #[default]
    Edit,
    /// Post a new message at every tool checkpoint.
    Post,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Post => "post",
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "edit" => Ok(Self::Edit),
            "post" => Ok(Self::Post),
            other => anyhow::bail!("Unknown delivery mode '{}' (expected edit or post)", other),
        }
    }
}

/// Tunables for progress updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSettings {
    /// Minimum gap between text-triggered updates.
    pub update_interval: Duration,
    /// Tool lines shown in a progress update.
    pub tool_window: usize,
    /// Characters of the text buffer shown in a progress update.
    pub text_tail_chars: usize,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(3),
            tool_window: 8,
            text_tail_chars: 2000,
        }
    }
}

/// One entry of the ordered tool history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEntry {
    pub name: String,
    pub summary: String,
}

/// Why an update is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Text,
    Tool,
}

/// Accumulated progress of one Run.
#[derive(Debug)]
pub struct ProgressTracker {
    settings: ProgressSettings,
    text: String,
    tools: Vec<ToolEntry>,
    result: Option<RunResult>,
    last_update: Instant,
}

impl ProgressTracker {
    pub fn new(settings: ProgressSettings, started: Instant) -> Self {
        Self {
            settings,
            text: String::new(),
            tools: Vec::new(),
            result: None,
            last_update: started,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tools(&self) -> &[ToolEntry] {
        &self.tools
    }

    pub fn result(&self) -> Option<&RunResult> {
        self.result.as_ref()
    }

    /// Fold one event in. Returns the trigger when an update should go out now.
    pub fn observe(&mut self, event: ProgressEvent, now: Instant) -> Option<Trigger> {
        match event {
            ProgressEvent::Text(text) => {
                self.text.push_str(&text);
                if now.duration_since(self.last_update) >= self.settings.update_interval {
                    self.last_update = now;
                    Some(Trigger::Text)
                } else {
                    None
                }
            }
            ProgressEvent::ToolUse { name, summary } => {
                self.tools.push(ToolEntry { name, summary });
                self.last_update = now;
                Some(Trigger::Tool)
            }
            ProgressEvent::Completed(result) => {
                self.result = Some(result);
                None
            }
        }
    }

    /// Body of an in-place progress update.
    pub fn render_progress(&self) -> String {
        let mut lines = Vec::new();
        match self.tools.last() {
            Some(latest) => lines.push(format!(":gear: Working: {}", latest.summary)),
            None => lines.push(":thought_balloon: Thinking...".to_string()),
        }

        let window = self.settings.tool_window.max(1);
        let start = self.tools.len().saturating_sub(window);
        if !self.tools.is_empty() {
            lines.push(String::new());
            let last = self.tools.len() - 1;
            for (i, tool) in self.tools.iter().enumerate().skip(start) {
                let marker = if i == last {
                    ":hourglass_flowing_sand:"
                } else {
                    ":white_check_mark:"
                };
                lines.push(format!("{} {}", marker, tool.summary));
            }
        }

        let tail = tail_chars(&self.text, self.settings.text_tail_chars);
        if !tail.trim().is_empty() {
            lines.push(String::new());
            lines.push(format_for_chat(&tail));
        }
        lines.join("\n")
    }

    /// Body of a per-checkpoint post.
    pub fn render_checkpoint(&self) -> Option<String> {
        self.tools
            .last()
            .map(|latest| format!(":wrench: {}", latest.summary))
    }

    /// The message that closes a Run: final text, then the execution log and stats.
    pub fn render_final(&self, elapsed: Duration) -> String {
        let mut sections = Vec::new();

        if let Some(result) = &self.result
            && result.is_error
        {
            sections.push(format!(
                ":warning: The generator reported an error: {}",
                result.text.trim()
            ));
        } else {
            let final_text = if self.text.trim().is_empty() {
                self.result.as_ref().map(|r| r.text.as_str()).unwrap_or("")
            } else {
                self.text.as_str()
            };
            let formatted = format_for_chat(final_text);
            if !formatted.is_empty() {
                sections.push(formatted);
            }
        }

        sections.push(self.render_summary(elapsed));
        sections.join("\n\n")
    }

    /// The message for a Run that ended without a result. Keeps whatever
    /// progress was already reported.
    pub fn render_failure(&self, headline: &str, elapsed: Duration) -> String {
        let mut message = headline.to_string();
        if !self.tools.is_empty() {
            message.push_str("\n\n");
            message.push_str(&self.render_summary(elapsed));
        }
        message
    }

    fn render_summary(&self, elapsed: Duration) -> String {
        let mut out = String::new();
        out.push_str(DIVIDER);
        out.push('\n');
        if !self.tools.is_empty() {
            out.push_str(":clipboard: *Execution log:*\n");
            for (i, tool) in self.tools.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, tool.summary));
            }
        }

        let mut stats = vec![format!(":stopwatch: {}", format_elapsed(elapsed))];
        if let Some(result) = &self.result {
            if result.num_turns > 0 {
                let unit = if result.num_turns == 1 { "turn" } else { "turns" };
                stats.push(format!("{} {}", result.num_turns, unit));
            }
            if result.total_cost_usd > 0.0 {
                stats.push(format!("${:.4}", result.total_cost_usd));
            }
        }
        out.push_str(&stats.join("  |  "));
        out
    }
}

/// `Ns` below a minute, `Mm Ns` from there.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// Normalize generator markdown for the chat platform.
///
/// Heading markers and emphasis runs become a single `*`, runs of more than
/// two blank lines shrink to two, and the result is trimmed. Applying it twice
/// gives the same text as applying it once.
pub fn format_for_chat(text: &str) -> String {
    let text = HEADING_REGEX.replace_all(text, "*");
    let text = EMPHASIS_REGEX.replace_all(&text, "*");

    let mut lines = Vec::new();
    let mut blank_run = 0usize;
    for line in text.split('\n') {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run <= 2 {
                lines.push("");
            }
        } else {
            blank_run = 0;
            lines.push(line);
        }
    }
    lines.join("\n").trim().to_string()
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", tail)
}

/// Delivers progress for one Run to its thread.
pub struct StatusChannel {
    chat: Arc<dyn ChatTransport>,
    session: Arc<Session>,
    mode: DeliveryMode,
}

impl StatusChannel {
    pub fn new(chat: Arc<dyn ChatTransport>, session: Arc<Session>, mode: DeliveryMode) -> Self {
        Self {
            chat,
            session,
            mode,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Send an intermediate update. Chat failures are logged, never fatal.
    pub async fn update(&self, tracker: &ProgressTracker, trigger: Trigger) {
        match self.mode {
            DeliveryMode::Edit => {
                let body = tracker.render_progress();
                self.edit_or_post(&body).await;
            }
            DeliveryMode::Post => {
                if trigger != Trigger::Tool {
                    return;
                }
                if let Some(body) = tracker.render_checkpoint() {
                    self.post(&body).await;
                }
            }
        }
    }

    /// Send the closing message of a Run.
    pub async fn finish(&self, body: &str) {
        match self.mode {
            DeliveryMode::Edit => self.edit_or_post(body).await,
            DeliveryMode::Post => self.post(body).await,
        }
    }

    async fn post(&self, body: &str) {
        if let Err(e) = self
            .chat
            .post_message(self.session.channel(), self.session.thread(), body)
            .await
        {
            tracing::warn!(thread = %self.session.thread(), error = %format!("{:#}", e), "failed to post status");
        }
    }

    async fn edit_or_post(&self, body: &str) {
        if let Some(handle) = self.session.status_handle() {
            match self.chat.update_message(&handle, body).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(thread = %self.session.thread(), error = %format!("{:#}", e), "failed to edit status message; posting a new one");
                }
            }
        }
        match self
            .chat
            .post_message_returning_handle(self.session.channel(), self.session.thread(), body)
            .await
        {
            Ok(handle) => self.session.set_status_handle(Some(handle)),
            Err(e) => {
                tracing::warn!(thread = %self.session.thread(), error = %format!("{:#}", e), "failed to post status");
            }
        }
    }
}

/// Consume progress events until the sender side closes, delivering updates
/// as they become due. Returns the final tracker state.
pub async fn aggregate(
    mut events: mpsc::Receiver<ProgressEvent>,
    mut tracker: ProgressTracker,
    status: &StatusChannel,
) -> ProgressTracker {
    while let Some(event) = events.recv().await {
        if let Some(trigger) = tracker.observe(event, Instant::now()) {
            status.update(&tracker, trigger).await;
        }
    }
    tracker
}
