//! Routes inbound chat events: classify, resolve the session, apply control
//! commands, and start Runs.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::driver::{ExecutionDriver, RunRequest};
use super::gate::rejection_message;
use super::progress::{self, DeliveryMode, ProgressSettings, ProgressTracker, StatusChannel};
use super::prompt::review_change_prompt;
use crate::chat::{ChatTransport, InboundEvent};
use crate::domain::{
    Command, ExecutionPolicy, Lookup, Mode, Repository, RepositoryCatalog, RunTicket, Session,
    SessionRegistry, classify,
};
use crate::errors::ExecutionError;
use crate::hosting::{ChangeHost, ChangeSet, PublishSettings, publish_change_set};
use crate::stream::RunResult;

static MENTION_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@[UW][A-Z0-9]+>").unwrap());

/// Progress events buffered between the parser and the aggregator.
const PROGRESS_BUFFER: usize = 256;

pub const DEFAULT_LIST_LIMIT: usize = 10;

const HELP_TEXT: &str = "*:books: Available commands*

*Basics:*
• `@bot <task>` - run a task in this thread
• `end` / `終了` / `おわり` - end the session

*Modes:*
• `review` / `レビュー` - switch to review mode
• `implement` / `実装` - switch to implementation mode (default)
• `sync` / `順次` - one task at a time; new requests are refused while busy
• `async` / `並列` - parallel mode (default); start another thread to run more

*Repositories:*
• `repos` / `repositories` / `リポジトリ` - list available repositories
• `switch owner/repo` / `切り替え owner/repo` - switch repository

*Pull requests:*
• `list-prs` / `prs` / `PR一覧` / `pr list` - list open pull requests
• `review-pr <number>` / `PRレビュー <number>` - review a pull request

*Help:*
• `help` / `ヘルプ` / `?` - show this help

*Examples:*
```
@bot add user authentication
@bot switch myorg/frontend
@bot list-prs
@bot review-pr 123
```";

/// Remove bot mention markup and surrounding whitespace.
pub fn strip_mentions(text: &str) -> String {
    MENTION_REGEX.replace_all(text, "").trim().to_string()
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub delivery: DeliveryMode,
    pub progress: ProgressSettings,
    pub publish: PublishSettings,
    /// Open pull requests shown by `list-prs`.
    pub list_limit: usize,
}

/// What handling an event did.
#[derive(Debug)]
pub enum Dispatch {
    /// No response: the thread's session was ended.
    Ignored,
    /// Answered in-thread without starting a Run.
    Replied,
    /// A Run was admitted and is executing on this task.
    RunStarted(JoinHandle<()>),
}

/// What a Run executes.
enum RunInput {
    Instruction(String),
    ReviewChange(u64),
}

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    catalog: Arc<RepositoryCatalog>,
    chat: Arc<dyn ChatTransport>,
    host: Arc<dyn ChangeHost>,
    driver: Arc<ExecutionDriver>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        catalog: Arc<RepositoryCatalog>,
        chat: Arc<dyn ChatTransport>,
        host: Arc<dyn ChangeHost>,
        driver: Arc<ExecutionDriver>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            registry,
            catalog,
            chat,
            host,
            driver,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle one inbound event. Returns once control commands are applied
    /// and any Run has been spawned.
    pub async fn handle(self: &Arc<Self>, event: InboundEvent) -> Dispatch {
        let text = strip_mentions(&event.text);
        let command = classify(&text);

        match self.registry.lookup(&event.thread) {
            Lookup::Ended => {
                tracing::debug!(thread = %event.thread, "ignoring message to ended session");
                Dispatch::Ignored
            }
            Lookup::Active(session) => self.handle_in_session(session, command, text, &event).await,
            Lookup::Absent => self.handle_without_session(command, text, &event).await,
        }
    }

    async fn handle_without_session(
        self: &Arc<Self>,
        command: Command,
        text: String,
        event: &InboundEvent,
    ) -> Dispatch {
        match &command {
            Command::ListRepositories => {
                self.reply(event, &self.repository_listing(None)).await;
                return Dispatch::Replied;
            }
            Command::Help => {
                self.reply(event, HELP_TEXT).await;
                return Dispatch::Replied;
            }
            Command::ListOpenChanges => {
                let repo = self.catalog.default_repository();
                self.list_open_changes(event, &repo).await;
                return Dispatch::Replied;
            }
            Command::End => {
                self.reply(event, "There is no active session in this thread.")
                    .await;
                return Dispatch::Replied;
            }
            Command::MissingArgument(kind) => {
                self.reply(event, &format!(":warning: Usage: `{}`", kind.usage()))
                    .await;
                return Dispatch::Replied;
            }
            Command::SwitchRepository(key) if self.catalog.find(key).is_none() => {
                self.reply(event, &self.unknown_repository(key)).await;
                return Dispatch::Replied;
            }
            Command::FreeText if text.is_empty() => {
                self.reply(
                    event,
                    "The instruction is empty. Mention me with what you want implemented.",
                )
                .await;
                return Dispatch::Replied;
            }
            _ => {}
        }

        let Some((session, created)) = self.registry.create(
            &event.thread,
            &event.channel,
            self.catalog.default_repository(),
        ) else {
            return Dispatch::Ignored;
        };
        if created {
            tracing::info!(
                thread = %event.thread,
                channel = %event.channel,
                user = %event.user,
                repository = %session.repository().key(),
                "new session"
            );
            if let Err(e) = self
                .chat
                .add_reaction(&event.channel, &event.thread, "eyes")
                .await
            {
                tracing::warn!(thread = %event.thread, error = %format!("{:#}", e), "failed to add reaction");
            }
        }
        self.handle_in_session(session, command, text, event).await
    }

    async fn handle_in_session(
        self: &Arc<Self>,
        session: Arc<Session>,
        command: Command,
        text: String,
        event: &InboundEvent,
    ) -> Dispatch {
        match command {
            Command::End => {
                self.end_session(&session, event).await;
                Dispatch::Replied
            }
            Command::SwitchToReview => {
                session.set_mode(Mode::Review);
                self.reply(event, ":mag: Switched to review mode.").await;
                Dispatch::Replied
            }
            Command::SwitchToImplementation => {
                session.set_mode(Mode::Implementation);
                self.reply(event, ":hammer_and_wrench: Switched to implementation mode.")
                    .await;
                Dispatch::Replied
            }
            Command::SwitchRepository(key) => {
                match self.catalog.find(&key) {
                    Some(repo) => {
                        session.set_repository(Arc::clone(&repo));
                        tracing::info!(thread = %session.thread(), repository = %repo.key(), "switched repository");
                        self.reply(
                            event,
                            &format!(":arrows_counterclockwise: Switched repository to {}.", repo.key()),
                        )
                        .await;
                    }
                    None => self.reply(event, &self.unknown_repository(&key)).await,
                }
                Dispatch::Replied
            }
            Command::ListRepositories => {
                let current = session.repository();
                self.reply(event, &self.repository_listing(Some(current.as_ref())))
                    .await;
                Dispatch::Replied
            }
            Command::SetSync => {
                session.set_policy(ExecutionPolicy::Sync);
                self.reply(
                    event,
                    ":arrow_forward: Switched to sync mode: one task at a time, busy requests are refused.",
                )
                .await;
                Dispatch::Replied
            }
            Command::SetAsync => {
                session.set_policy(ExecutionPolicy::Async);
                self.reply(
                    event,
                    ":fast_forward: Switched to async mode: start another thread to run tasks in parallel.",
                )
                .await;
                Dispatch::Replied
            }
            Command::ListOpenChanges => {
                self.list_open_changes(event, &session.repository()).await;
                Dispatch::Replied
            }
            Command::ReviewChange(number) => {
                self.start_run(session, RunInput::ReviewChange(number), event)
                    .await
            }
            Command::Help => {
                self.reply(event, HELP_TEXT).await;
                Dispatch::Replied
            }
            Command::MissingArgument(kind) => {
                self.reply(event, &format!(":warning: Usage: `{}`", kind.usage()))
                    .await;
                Dispatch::Replied
            }
            Command::FreeText if text.is_empty() => {
                self.reply(event, "The instruction is empty.").await;
                Dispatch::Replied
            }
            Command::FreeText => {
                self.start_run(session, RunInput::Instruction(text), event)
                    .await
            }
        }
    }

    async fn end_session(&self, session: &Arc<Session>, event: &InboundEvent) {
        let cancelled = match session.end() {
            Ok(cancelled) => cancelled,
            Err(e) => {
                tracing::debug!(thread = %session.thread(), error = %e, "session already ended");
                false
            }
        };
        self.registry.remove(session.thread());
        tracing::info!(thread = %session.thread(), user = %event.user, cancelled, "ended session");

        let message = if cancelled {
            ":wave: Session ended. The running task was cancelled."
        } else {
            ":wave: Session ended."
        };
        self.reply(event, message).await;
    }

    async fn start_run(
        self: &Arc<Self>,
        session: Arc<Session>,
        input: RunInput,
        event: &InboundEvent,
    ) -> Dispatch {
        let ticket = match session.try_begin_run() {
            Ok(ticket) => ticket,
            Err(rejection) => {
                tracing::info!(thread = %session.thread(), ?rejection, "instruction not admitted");
                return match rejection_message(rejection) {
                    Some(message) => {
                        self.reply(event, message).await;
                        Dispatch::Replied
                    }
                    None => Dispatch::Ignored,
                };
            }
        };

        let starting = format!(
            ":hourglass_flowing_sand: Starting task... (repository: {}, mode: {}, policy: {})",
            ticket.repository.key(),
            match &input {
                RunInput::ReviewChange(_) => Mode::Review,
                RunInput::Instruction(_) => ticket.mode,
            },
            session.policy()
        );
        match self
            .chat
            .post_message_returning_handle(session.channel(), session.thread(), &starting)
            .await
        {
            Ok(handle) => session.set_status_handle(Some(handle)),
            Err(e) => {
                session.set_status_handle(None);
                tracing::warn!(thread = %session.thread(), error = %format!("{:#}", e), "failed to post starting status");
            }
        }

        let span = tracing::info_span!(
            "run",
            run_id = %Uuid::new_v4(),
            thread = %session.thread(),
            repository = %ticket.repository.key(),
        );
        let this = Arc::clone(self);
        Dispatch::RunStarted(tokio::spawn(this.execute(ticket, input).instrument(span)))
    }

    async fn execute(self: Arc<Self>, ticket: RunTicket, input: RunInput) {
        let RunTicket {
            guard,
            cancel,
            mode,
            resume_token,
            repository,
        } = ticket;
        let session = Arc::clone(guard.session());
        let started = Instant::now();
        let status = StatusChannel::new(
            Arc::clone(&self.chat),
            Arc::clone(&session),
            self.settings.delivery,
        );

        let (prompt, mode) = match input {
            RunInput::Instruction(prompt) => (prompt, mode),
            RunInput::ReviewChange(number) => match self.review_prompt(&repository, number).await {
                Ok(prompt) => (prompt, Mode::Review),
                Err(e) => {
                    tracing::warn!(number, error = %format!("{:#}", e), "failed to fetch pull request");
                    status
                        .finish(&format!(
                            ":x: Failed to fetch pull request #{}: {:#}",
                            number, e
                        ))
                        .await;
                    return;
                }
            },
        };
        tracing::info!(mode = %mode, resume = resume_token.is_some(), "run started");

        let request = RunRequest {
            prompt,
            mode,
            resume_token,
            repository: Arc::clone(&repository),
        };
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let tracker = ProgressTracker::new(self.settings.progress, started);
        let (outcome, tracker) = tokio::join!(
            self.driver.run(request, cancel, tx),
            progress::aggregate(rx, tracker, &status)
        );
        let elapsed = started.elapsed();

        match outcome {
            Ok(outcome) => {
                status.finish(&tracker.render_final(elapsed)).await;
                if outcome.result.is_error {
                    tracing::warn!(turns = outcome.result.num_turns, "run finished with an error result");
                } else {
                    if mode == Mode::Implementation {
                        self.publish_if_requested(&session, &repository, &outcome.result)
                            .await;
                    }
                    if let Err(e) = self
                        .chat
                        .add_reaction(session.channel(), session.thread(), "white_check_mark")
                        .await
                    {
                        tracing::warn!(error = %format!("{:#}", e), "failed to add reaction");
                    }
                }
                tracing::info!(
                    turns = outcome.result.num_turns,
                    cost_usd = outcome.result.total_cost_usd,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "run completed"
                );
                guard.complete(outcome.resume_token);
            }
            Err(e) => {
                tracing::error!(error = %e, elapsed_ms = elapsed.as_millis() as u64, "run failed");
                let headline = failure_headline(&e);
                status
                    .finish(&tracker.render_failure(&headline, elapsed))
                    .await;
            }
        }
    }

    async fn review_prompt(&self, repo: &Repository, number: u64) -> anyhow::Result<String> {
        let details = self.host.pull_details(repo, number).await?;
        let diff = self.host.pull_diff(repo, number).await?;
        Ok(review_change_prompt(&details, &diff))
    }

    async fn publish_if_requested(&self, session: &Session, repo: &Repository, result: &RunResult) {
        let change = match ChangeSet::extract(&result.text) {
            Ok(Some(change)) => change,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "result carried an invalid change set");
                self.post(
                    session,
                    &format!(":warning: The change set in the result could not be used: {:#}", e),
                )
                .await;
                return;
            }
        };

        self.post(
            session,
            &format!(
                ":rocket: Publishing \"{}\" ({} file(s)) to {}...",
                change.title,
                change.files.len(),
                repo.key()
            ),
        )
        .await;
        match publish_change_set(self.host.as_ref(), repo, &change, &self.settings.publish).await {
            Ok(published) => {
                self.post(
                    session,
                    &format!(
                        ":white_check_mark: Pull request opened: {} (branch `{}`)",
                        published.pull_request.html_url, published.branch
                    ),
                )
                .await;
            }
            Err(e) => {
                tracing::error!(step = %e.step, error = %e, "publish failed");
                let mut message = format!(":x: {}", e);
                match (&e.branch, e.compensated) {
                    (Some(branch), true) => {
                        message.push_str(&format!(" (branch `{}` was deleted)", branch));
                    }
                    (Some(branch), false) => {
                        message.push_str(&format!(
                            " (branch `{}` could not be deleted; remove it manually)",
                            branch
                        ));
                    }
                    (None, _) => {}
                }
                self.post(session, &message).await;
            }
        }
    }

    async fn list_open_changes(&self, event: &InboundEvent, repo: &Repository) {
        let message = match self
            .host
            .list_open_pulls(repo, self.settings.list_limit)
            .await
        {
            Ok(pulls) if pulls.is_empty() => {
                format!(":information_source: {} has no open pull requests.", repo.key())
            }
            Ok(pulls) => {
                let lines: Vec<String> = pulls
                    .iter()
                    .map(|p| format!("• #{} {} (`{}` by {})", p.number, p.title, p.head, p.author))
                    .collect();
                format!(
                    ":mag: *Open pull requests in {}:*\n{}\n\nTo review one: `review-pr <number>`",
                    repo.key(),
                    lines.join("\n")
                )
            }
            Err(e) => {
                tracing::warn!(repository = %repo.key(), error = %format!("{:#}", e), "failed to list pull requests");
                format!(":x: Failed to list pull requests: {:#}", e)
            }
        };
        self.reply(event, &message).await;
    }

    fn repository_listing(&self, current: Option<&Repository>) -> String {
        let default_key = self.catalog.default_repository().key();
        let current_key = current.map(|r| r.key());
        let lines: Vec<String> = self
            .catalog
            .iter()
            .map(|repo| {
                let key = repo.key();
                let marker = match &current_key {
                    Some(current) if *current == key => " :point_left: *current*",
                    None if key == default_key => " _(default)_",
                    _ => "",
                };
                format!("• {} (branch: {}){}", key, repo.default_branch, marker)
            })
            .collect();
        format!(
            ":books: *Available repositories:*\n{}\n\nTo switch: `switch owner/repo`",
            lines.join("\n")
        )
    }

    fn unknown_repository(&self, key: &str) -> String {
        let lines: Vec<String> = self
            .catalog
            .keys()
            .into_iter()
            .map(|k| format!("• {}", k))
            .collect();
        format!(
            ":x: Repository `{}` not found. Available repositories:\n{}",
            key,
            lines.join("\n")
        )
    }

    async fn reply(&self, event: &InboundEvent, text: &str) {
        if let Err(e) = self
            .chat
            .post_message(&event.channel, &event.thread, text)
            .await
        {
            tracing::warn!(thread = %event.thread, error = %format!("{:#}", e), "failed to reply");
        }
    }

    async fn post(&self, session: &Session, text: &str) {
        if let Err(e) = self
            .chat
            .post_message(session.channel(), session.thread(), text)
            .await
        {
            tracing::warn!(thread = %session.thread(), error = %format!("{:#}", e), "failed to post");
        }
    }
}

fn failure_headline(error: &ExecutionError) -> String {
    match error {
        ExecutionError::Cancelled => ":stop_sign: The task was cancelled.".to_string(),
        ExecutionError::TimedOut { after } => format!(
            ":alarm_clock: The task timed out after {}.",
            progress::format_elapsed(*after)
        ),
        other => format!(":x: The task failed: {}", other),
    }
}
