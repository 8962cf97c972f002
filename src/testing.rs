//! Test doubles for the engine's collaborators.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::chat::{ChatTransport, MessageHandle};
use crate::domain::Repository;
use crate::engine::generator::{
    CodeGenerator, ExitReport, GeneratorInvocation, GeneratorProcess, OutputStream,
};
use crate::errors::ExecutionError;
use crate::hosting::{
    ChangeHost, Identity, NewPullRequest, PullRequest, PullRequestDetails, PullRequestSummary,
    TreeEntry,
};

// ── Chat ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCall {
    Post {
        channel: String,
        thread: String,
        text: String,
    },
    PostWithHandle {
        channel: String,
        thread: String,
        text: String,
    },
    Update {
        handle: MessageHandle,
        text: String,
    },
    Reaction {
        channel: String,
        ts: String,
        emoji: String,
    },
}

impl ChatCall {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Post { text, .. } | Self::PostWithHandle { text, .. } | Self::Update { text, .. } => {
                Some(text.as_str())
            }
            Self::Reaction { .. } => None,
        }
    }
}

/// Records every outbound chat call.
#[derive(Debug, Default)]
pub struct RecordingChat {
    calls: Mutex<Vec<ChatCall>>,
    next_ts: AtomicU64,
}

impl RecordingChat {
    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Texts of posts and edits, in order.
    pub fn texts(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.text().map(str::to_string))
            .collect()
    }

    pub fn reactions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ChatCall::Reaction { emoji, .. } => Some(emoji),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ChatCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatTransport for RecordingChat {
    async fn post_message(&self, channel: &str, thread: &str, text: &str) -> Result<()> {
        self.record(ChatCall::Post {
            channel: channel.to_string(),
            thread: thread.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn post_message_returning_handle(
        &self,
        channel: &str,
        thread: &str,
        text: &str,
    ) -> Result<MessageHandle> {
        self.record(ChatCall::PostWithHandle {
            channel: channel.to_string(),
            thread: thread.to_string(),
            text: text.to_string(),
        });
        let n = self.next_ts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessageHandle::new(channel, &format!("1700000000.{:06}", n)))
    }

    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        self.record(ChatCall::Update {
            handle: handle.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn add_reaction(&self, channel: &str, ts: &str, emoji: &str) -> Result<()> {
        self.record(ChatCall::Reaction {
            channel: channel.to_string(),
            ts: ts.to_string(),
            emoji: emoji.to_string(),
        });
        Ok(())
    }
}

// ── Change host ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCall {
    pub op: String,
    pub detail: String,
}

/// In-memory change host that records calls and can fail chosen operations.
#[derive(Debug, Default)]
pub struct FakeHost {
    calls: Mutex<Vec<HostCall>>,
    fail_at: Vec<&'static str>,
    pulls: Vec<PullRequestSummary>,
    diff: String,
}

impl FakeHost {
    pub fn failing_at(op: &'static str) -> Self {
        Self {
            fail_at: vec![op],
            ..Self::default()
        }
    }

    pub fn also_failing_at(mut self, op: &'static str) -> Self {
        self.fail_at.push(op);
        self
    }

    pub fn with_pulls(pulls: Vec<PullRequestSummary>, diff: &str) -> Self {
        Self {
            pulls,
            diff: diff.to_string(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, detail: &str) -> Result<()> {
        self.calls.lock().unwrap().push(HostCall {
            op: op.to_string(),
            detail: detail.to_string(),
        });
        if self.fail_at.iter().any(|f| *f == op) {
            bail!("injected failure at {}", op);
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeHost for FakeHost {
    async fn get_ref_sha(&self, _repo: &Repository, branch: &str) -> Result<String> {
        self.record("get_ref", branch)?;
        Ok("base-sha".to_string())
    }

    async fn create_ref(&self, _repo: &Repository, branch: &str, _sha: &str) -> Result<()> {
        self.record("create_ref", branch)
    }

    async fn delete_ref(&self, _repo: &Repository, branch: &str) -> Result<()> {
        self.record("delete_ref", branch)
    }

    async fn create_blob(&self, _repo: &Repository, content: &str) -> Result<String> {
        self.record("create_blob", content)?;
        Ok(format!("blob-{}", content.len()))
    }

    async fn get_commit_tree(&self, _repo: &Repository, commit_sha: &str) -> Result<String> {
        self.record("get_commit", commit_sha)?;
        Ok("base-tree".to_string())
    }

    async fn create_tree(
        &self,
        _repo: &Repository,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String> {
        self.record("create_tree", &format!("{}+{}", base_tree, entries.len()))?;
        Ok("tree-sha".to_string())
    }

    async fn create_commit(
        &self,
        _repo: &Repository,
        message: &str,
        _tree_sha: &str,
        _parent_sha: &str,
        _author: &Identity,
    ) -> Result<String> {
        self.record("create_commit", message)?;
        Ok("commit-sha".to_string())
    }

    async fn update_ref(&self, _repo: &Repository, branch: &str, _sha: &str) -> Result<()> {
        self.record("update_ref", branch)
    }

    async fn create_pull_request(
        &self,
        repo: &Repository,
        request: &NewPullRequest,
    ) -> Result<PullRequest> {
        self.record("create_pull", &request.head)?;
        Ok(PullRequest {
            number: 1,
            html_url: format!("https://github.com/{}/pull/1", repo.key()),
        })
    }

    async fn list_open_pulls(
        &self,
        _repo: &Repository,
        limit: usize,
    ) -> Result<Vec<PullRequestSummary>> {
        self.record("list_pulls", &limit.to_string())?;
        Ok(self.pulls.iter().take(limit).cloned().collect())
    }

    async fn pull_details(&self, repo: &Repository, number: u64) -> Result<PullRequestDetails> {
        self.record("pull_details", &number.to_string())?;
        let Some(pull) = self.pulls.iter().find(|p| p.number == number) else {
            bail!("pull request #{} not found", number);
        };
        Ok(PullRequestDetails {
            number,
            title: pull.title.clone(),
            body: String::new(),
            author: pull.author.clone(),
            head: pull.head.clone(),
            base: repo.default_branch.clone(),
            url: format!("https://github.com/{}/pull/{}", repo.key(), number),
        })
    }

    async fn pull_diff(&self, _repo: &Repository, number: u64) -> Result<String> {
        self.record("pull_diff", &number.to_string())?;
        Ok(self.diff.clone())
    }
}

// ── Code generator ───────────────────────────────────────────────────

/// Stream frames in the generator's wire format.
pub mod frames {
    use serde_json::json;

    pub fn init(session_id: &str) -> String {
        json!({"type": "system", "subtype": "init", "session_id": session_id}).to_string()
    }

    pub fn tool_use(name: &str, file_path: &str) -> String {
        json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "tu", "name": name, "input": {"file_path": file_path}}
            ]}
        })
        .to_string()
    }

    pub fn bash(command: &str) -> String {
        json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "tu", "name": "Bash", "input": {"command": command}}
            ]}
        })
        .to_string()
    }

    pub fn text(text: &str) -> String {
        json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    pub fn result(turns: u32, cost: f64) -> String {
        result_with_text(turns, cost, "Done.")
    }

    pub fn result_with_text(turns: u32, cost: f64, text: &str) -> String {
        json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "result": text,
            "num_turns": turns,
            "total_cost_usd": cost,
            "duration_ms": 1200,
            "session_id": "sess-1"
        })
        .to_string()
    }

    /// init, one file write, a text block, and a result.
    pub fn success(turns: u32, cost: f64) -> Vec<String> {
        vec![
            init("sess-1"),
            tool_use("Write", "/repo/src/routes/health.rs"),
            text("Added the endpoint."),
            result(turns, cost),
        ]
    }
}

#[derive(Debug, Default)]
struct Script {
    frames: Vec<String>,
    code: Option<i32>,
    stderr: String,
    hang: bool,
}

/// Generator that replays canned frames instead of spawning a process.
///
/// `hanging()` keeps stdout open after the frames until the process is
/// killed. `gated()` holds each process's output until the test adds a
/// permit to the gate.
pub struct ScriptedGenerator {
    script: Script,
    gate: Option<Arc<Semaphore>>,
    invocations: Mutex<Vec<GeneratorInvocation>>,
    killed: Arc<AtomicBool>,
}

impl ScriptedGenerator {
    pub fn new(frames: Vec<String>) -> Self {
        Self {
            script: Script {
                frames,
                code: Some(0),
                ..Script::default()
            },
            gate: None,
            invocations: Mutex::new(Vec::new()),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn exiting_with(mut self, code: Option<i32>, stderr: &str) -> Self {
        self.script.code = code;
        self.script.stderr = stderr.to_string();
        self
    }

    pub fn hanging(mut self) -> Self {
        self.script.hang = true;
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn invocations(&self) -> Vec<GeneratorInvocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl CodeGenerator for ScriptedGenerator {
    fn start(
        &self,
        invocation: &GeneratorInvocation,
    ) -> Result<Box<dyn GeneratorProcess>, ExecutionError> {
        self.invocations.lock().unwrap().push(invocation.clone());

        let mut bytes = self.script.frames.join("\n").into_bytes();
        bytes.push(b'\n');
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        let gate = self.gate.clone();
        let hang = self.script.hang;
        let feeder = tokio::spawn(async move {
            if let Some(gate) = gate
                && let Ok(permit) = gate.acquire().await
            {
                permit.forget();
            }
            let _ = writer.write_all(&bytes).await;
            if hang {
                std::future::pending::<()>().await;
            }
        });

        Ok(Box::new(ScriptedProcess {
            stdout: Some(Box::new(reader)),
            feeder,
            code: self.script.code,
            stderr: self.script.stderr.clone(),
            killed: Arc::clone(&self.killed),
        }))
    }
}

struct ScriptedProcess {
    stdout: Option<OutputStream>,
    feeder: JoinHandle<()>,
    code: Option<i32>,
    stderr: String,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl GeneratorProcess for ScriptedProcess {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    async fn wait(&mut self) -> Result<ExitReport, ExecutionError> {
        Ok(ExitReport {
            code: self.code,
            success: self.code == Some(0),
            stderr: self.stderr.clone(),
        })
    }

    async fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        self.feeder.abort();
    }
}
