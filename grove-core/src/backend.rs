use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{GroveError, Result};
use crate::job::Job;
use crate::plan::Plan;

/// Ambient cancellation, fan-out friendly: the orchestrator holds the
/// handle, every executor clones a token.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token with no handle; never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        CancelToken { rx }
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One completion call's worth of inputs. The prompt is the assembled
/// briefing; attachment paths travel separately so backends that support
/// uploads can use them and subprocess backends can ignore them.
pub struct CompletionRequest<'a> {
    pub job: &'a Job,
    pub plan: &'a Plan,
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub work_dir: &'a Path,
    pub context_files: &'a [PathBuf],
    pub prompt_source_files: &'a [PathBuf],
}

/// Inputs for spawning an interactive or headless agent in a worktree.
pub struct AgentRunRequest<'a> {
    pub job: &'a Job,
    pub plan: &'a Plan,
    pub prompt: &'a str,
    pub worktree: &'a Path,
    pub env: Vec<(String, String)>,
    pub interactive: bool,
}

/// The pluggable LLM/agent capability. Implementations own transport,
/// retries, and model routing; the core only sequences calls and persists
/// their results.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String>;
    async fn run_agent(&self, request: AgentRunRequest<'_>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub prompt: String,
}

/// Resolves a template name to a system-prompt body.
pub trait TemplateStore: Send + Sync {
    fn find_template(&self, name: &str) -> Result<Template>;
}

/// In-memory template store; the embedding application supplies a real
/// one.
#[derive(Debug, Default)]
pub struct StaticTemplateStore {
    templates: HashMap<String, String>,
}

impl StaticTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, prompt: impl Into<String>) {
        self.templates.insert(name.into(), prompt.into());
    }
}

impl TemplateStore for StaticTemplateStore {
    fn find_template(&self, name: &str) -> Result<Template> {
        self.templates
            .get(name)
            .map(|prompt| Template {
                name: name.to_string(),
                prompt: prompt.clone(),
            })
            .ok_or_else(|| GroveError::other(format!("unknown template `{name}`")))
    }
}

/// What a scripted backend saw for one call; used by the test suites to
/// assert call counts and prompt contents.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub job_id: String,
    pub prompt: String,
    pub model: Option<String>,
    pub agent_run: bool,
}

/// Scripted backend for tests and dry-runs: pops canned responses in
/// order, falls back to a fixed default, optionally sleeps to simulate
/// latency, and records every call. Tracks the peak number of overlapping
/// calls so tests can assert fan-out bounds without timing games.
#[derive(Default)]
pub struct MockBackend {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: std::sync::atomic::AtomicUsize,
    peak_in_flight: std::sync::atomic::AtomicUsize,
    pub delay: Option<Duration>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        MockBackend {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().push_back(Ok(response.into()));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.responses.lock().push_back(Err(message.into()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn enter(&self) {
        use std::sync::atomic::Ordering;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn next_response(&self) -> Result<String> {
        match self.responses.lock().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(GroveError::BackendFailure(message)),
            None => Ok("ok".to_string()),
        }
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String> {
        self.enter();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(RecordedCall {
            job_id: request.job.id.clone(),
            prompt: request.prompt.to_string(),
            model: request.model.map(str::to_string),
            agent_run: false,
        });
        self.exit();
        self.next_response()
    }

    async fn run_agent(&self, request: AgentRunRequest<'_>) -> Result<()> {
        self.enter();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(RecordedCall {
            job_id: request.job.id.clone(),
            prompt: request.prompt.to_string(),
            model: None,
            agent_run: true,
        });
        self.exit();
        self.next_response().map(|_| ())
    }
}
