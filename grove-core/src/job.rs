use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;

use crate::error::{GroveError, Result};
use crate::frontmatter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Oneshot,
    Agent,
    HeadlessAgent,
    InteractiveAgent,
    Shell,
    Chat,
    #[serde(rename = "generate-recipe")]
    GenerateRecipe,
}

impl JobType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "oneshot" => Some(JobType::Oneshot),
            "agent" => Some(JobType::Agent),
            "headless_agent" => Some(JobType::HeadlessAgent),
            "interactive_agent" => Some(JobType::InteractiveAgent),
            "shell" => Some(JobType::Shell),
            "chat" => Some(JobType::Chat),
            "generate-recipe" => Some(JobType::GenerateRecipe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Oneshot => "oneshot",
            JobType::Agent => "agent",
            JobType::HeadlessAgent => "headless_agent",
            JobType::InteractiveAgent => "interactive_agent",
            JobType::Shell => "shell",
            JobType::Chat => "chat",
            JobType::GenerateRecipe => "generate-recipe",
        }
    }

    /// Agent-family jobs run in a working tree and read dependency files
    /// from disk rather than having them inlined.
    pub fn is_agent_family(self) -> bool {
        matches!(
            self,
            JobType::Agent | JobType::HeadlessAgent | JobType::InteractiveAgent
        )
    }

    /// Whether the executor needs an interactive stdin.
    pub fn is_interactive(self) -> bool {
        matches!(self, JobType::Agent | JobType::InteractiveAgent)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
    NeedsReview,
    PendingUser,
    PendingLlm,
    Hold,
    Todo,
    Abandoned,
}

impl JobStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "blocked" => Some(JobStatus::Blocked),
            "needs_review" => Some(JobStatus::NeedsReview),
            "pending_user" => Some(JobStatus::PendingUser),
            "pending_llm" => Some(JobStatus::PendingLlm),
            "hold" => Some(JobStatus::Hold),
            "todo" => Some(JobStatus::Todo),
            "abandoned" => Some(JobStatus::Abandoned),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Blocked => "blocked",
            JobStatus::NeedsReview => "needs_review",
            JobStatus::PendingUser => "pending_user",
            JobStatus::PendingLlm => "pending_llm",
            JobStatus::Hold => "hold",
            JobStatus::Todo => "todo",
            JobStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Start states from which an executor may pick the job up. `pending`
    /// for every type; chat jobs additionally start from `pending_user`.
    pub fn is_start_state(self, job_type: JobType) -> bool {
        match self {
            JobStatus::Pending => true,
            JobStatus::PendingUser => job_type == JobType::Chat,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    File,
    Commit,
    None,
    GenerateJobs,
    #[default]
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OutputSpec {
    #[serde(rename = "type", default)]
    pub kind: OutputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetadata {
    pub execution_time: Option<f64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// One scheduled unit, backed by a single `NN-slug.md` file.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub filename: String,
    pub file_path: PathBuf,
    pub title: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Declared references, verbatim from frontmatter.
    pub depends_on: Vec<String>,
    /// Resolved job ids, same length as `depends_on`; `None` marks a
    /// reference that matched neither an id nor a filename.
    pub dependencies: Vec<Option<String>>,
    pub prompt_source: Option<String>,
    pub source_block: Option<String>,
    pub prepend_dependencies: Option<bool>,
    pub template: Option<String>,
    pub model: Option<String>,
    pub worktree: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub agent_continue: bool,
    pub on_complete_status: Option<String>,
    pub rules_file: Option<String>,
    pub note_ref: Option<String>,
    pub output: OutputSpec,
    pub prompt_body: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub metadata: JobMetadata,
}

impl Job {
    pub fn display_name(&self) -> &str {
        if self.title.is_empty() { &self.id } else { &self.title }
    }

    pub fn is_chat(&self) -> bool {
        self.job_type == JobType::Chat
    }
}

/// Serde view of the recognized frontmatter keys. Reading goes through
/// this; writing always goes through the frontmatter merge so unknown
/// operator keys survive.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawFrontmatter {
    id: String,
    title: String,
    status: String,
    #[serde(deserialize_with = "string_or_list")]
    depends_on: Vec<String>,
    prompt_source: Option<String>,
    source_block: Option<String>,
    prepend_dependencies: Option<bool>,
    template: Option<String>,
    model: Option<String>,
    worktree: Option<String>,
    repository: Option<String>,
    branch: Option<String>,
    agent_continue: Option<bool>,
    on_complete_status: Option<String>,
    rules_file: Option<String>,
    note_ref: Option<String>,
    output: Option<OutputSpec>,
    #[serde(deserialize_with = "lenient_datetime")]
    created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient_datetime")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient_datetime")]
    started_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient_datetime")]
    completed_at: Option<DateTime<Utc>>,
    summary: Option<String>,
    #[serde(deserialize_with = "lenient_seconds")]
    execution_time: Option<f64>,
    retry_count: Option<u32>,
    last_error: Option<String>,
}

fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(OneOrMany::One(value)) => Ok(vec![value]),
        Some(OneOrMany::Many(values)) => Ok(values),
    }
}

/// Seconds as a bare number, tolerating a trailing `s` suffix from
/// operator-edited files.
fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Number(seconds)) => Some(seconds),
        Some(Raw::Text(text)) => text.trim().trim_end_matches('s').parse().ok(),
    })
}

fn lenient_datetime<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
        .map(|value| value.with_timezone(&Utc)))
}

/// Classify and load one file. `NotAJob` for files with no `type` key or
/// an unrecognized `type` value; `InvalidJob` for job files with missing
/// or invalid required fields.
pub fn load_job(path: &Path) -> Result<Job> {
    let bytes = fs::read(path)?;
    load_job_from_bytes(path, &bytes)
}

pub fn load_job_from_bytes(path: &Path, bytes: &[u8]) -> Result<Job> {
    let (mapping, body) = frontmatter::parse(bytes).map_err(|err| match err {
        GroveError::UnterminatedFrontmatter(_) => {
            GroveError::UnterminatedFrontmatter(path.to_path_buf())
        }
        other => other,
    })?;

    let job_type = match mapping.get("type") {
        None => return Err(GroveError::NotAJob(path.to_path_buf())),
        Some(Value::String(value)) => match JobType::parse(value) {
            Some(job_type) => job_type,
            None => return Err(GroveError::NotAJob(path.to_path_buf())),
        },
        Some(_) => return Err(GroveError::NotAJob(path.to_path_buf())),
    };

    let raw: RawFrontmatter = serde_yaml::from_value(Value::Mapping(mapping))
        .map_err(|err| GroveError::InvalidJob {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

    let invalid = |reason: &str| GroveError::InvalidJob {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if raw.id.trim().is_empty() {
        return Err(invalid("missing required field `id`"));
    }
    if raw.title.trim().is_empty() {
        return Err(invalid("missing required field `title`"));
    }
    if raw.status.trim().is_empty() {
        return Err(invalid("missing required field `status`"));
    }
    let status = JobStatus::parse(raw.status.trim())
        .ok_or_else(|| invalid(&format!("unknown status `{}`", raw.status.trim())))?;

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let depends_on: Vec<String> = raw
        .depends_on
        .into_iter()
        .map(|reference| reference.trim().to_string())
        .filter(|reference| !reference.is_empty())
        .collect();
    let slots = depends_on.len();

    Ok(Job {
        id: raw.id.trim().to_string(),
        filename,
        file_path: path.to_path_buf(),
        title: raw.title.trim().to_string(),
        job_type,
        status,
        depends_on,
        dependencies: vec![None; slots],
        prompt_source: raw.prompt_source,
        source_block: raw.source_block,
        prepend_dependencies: raw.prepend_dependencies,
        template: raw.template,
        model: raw.model,
        worktree: raw.worktree,
        repository: raw.repository,
        branch: raw.branch,
        agent_continue: raw.agent_continue.unwrap_or(false),
        on_complete_status: raw.on_complete_status,
        rules_file: raw.rules_file,
        note_ref: raw.note_ref,
        output: raw.output.unwrap_or_default(),
        prompt_body: body,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        start_time: raw.started_at,
        end_time: raw.completed_at,
        summary: raw.summary,
        metadata: JobMetadata {
            execution_time: raw.execution_time,
            retry_count: raw.retry_count.unwrap_or(0),
            last_error: raw.last_error,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(contents: &str) -> Result<Job> {
        load_job_from_bytes(Path::new("01-test.md"), contents.as_bytes())
    }

    #[test]
    fn loads_a_minimal_job() {
        let job = load("---\nid: alpha-3f\ntitle: Alpha\nstatus: pending\ntype: oneshot\n---\nDo the thing.\n").unwrap();
        assert_eq!(job.id, "alpha-3f");
        assert_eq!(job.job_type, JobType::Oneshot);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.prompt_body, "Do the thing.\n");
        assert!(job.depends_on.is_empty());
    }

    #[test]
    fn missing_type_is_not_a_job() {
        let err = load("---\nid: a\ntitle: A\nstatus: pending\n---\nbody\n").unwrap_err();
        assert!(err.is_not_a_job());
    }

    #[test]
    fn unknown_type_is_not_a_job() {
        let err = load("---\nid: a\ntitle: A\nstatus: pending\ntype: carrier_pigeon\n---\n")
            .unwrap_err();
        assert!(err.is_not_a_job());
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let err = load("---\nid: a\nstatus: pending\ntype: oneshot\n---\n").unwrap_err();
        assert!(matches!(err, GroveError::InvalidJob { .. }));
    }

    #[test]
    fn bad_status_is_invalid() {
        let err = load("---\nid: a\ntitle: A\nstatus: cromulent\ntype: oneshot\n---\n")
            .unwrap_err();
        assert!(matches!(err, GroveError::InvalidJob { .. }));
    }

    #[test]
    fn depends_on_accepts_scalar_and_list() {
        let scalar =
            load("---\nid: a\ntitle: A\nstatus: pending\ntype: shell\ndepends_on: b\n---\n")
                .unwrap();
        assert_eq!(scalar.depends_on, vec!["b".to_string()]);
        assert_eq!(scalar.dependencies, vec![None]);

        let list = load(
            "---\nid: a\ntitle: A\nstatus: pending\ntype: shell\ndepends_on:\n  - b\n  - c\n---\n",
        )
        .unwrap();
        assert_eq!(list.depends_on, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn output_block_parses() {
        let job = load(
            "---\nid: a\ntitle: A\nstatus: pending\ntype: oneshot\noutput:\n  type: generate_jobs\n---\n",
        )
        .unwrap();
        assert_eq!(job.output.kind, OutputType::GenerateJobs);
    }

    #[test]
    fn chat_start_states() {
        assert!(JobStatus::PendingUser.is_start_state(JobType::Chat));
        assert!(!JobStatus::PendingUser.is_start_state(JobType::Oneshot));
        assert!(JobStatus::Pending.is_start_state(JobType::Agent));
    }
}
