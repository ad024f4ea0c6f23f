use std::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, GroveError>;

#[derive(Debug)]
pub enum GroveError {
    /// A Markdown file without a `type` frontmatter key. The plan loader
    /// skips these silently; the job loader reports them so callers can
    /// decide.
    NotAJob(PathBuf),
    /// A file that declares a job `type` but is missing required fields or
    /// carries a bad enum value.
    InvalidJob { path: PathBuf, reason: String },
    /// Two job files in one plan share an id.
    DuplicateId { id: String, first: PathBuf, second: PathBuf },
    /// A `depends_on` reference that resolves to neither an id nor a
    /// filename. Recorded per-slot at load time; never fatal on its own.
    DependencyMissing { job: String, reference: String },
    /// A cycle in the resolved dependency edges. Fatal at load time.
    CircularDependency { path: String },
    /// Another writer holds the sentinel lock for a job file.
    Locked { path: PathBuf, holder: String },
    /// The atomic rename failed; in-memory state was rolled back.
    WriteConflict { path: PathBuf, source: io::Error },
    /// The completion backend returned an error.
    BackendFailure(String),
    /// Ambient cancellation fired while a job was in flight.
    Canceled,
    /// The orchestrator has neither running nor runnable jobs but the plan
    /// is not done.
    BlockedPlan { pending: Vec<String> },
    /// The step-limit safeguard tripped.
    StepLimitExceeded { steps: u64 },
    /// Frontmatter that opens a `---` block and never closes it.
    UnterminatedFrontmatter(PathBuf),
    Yaml(serde_yaml::Error),
    Json(serde_json::Error),
    Io(io::Error),
    Git(git2::Error),
    /// Anything that does not fit a tag above (missing template, bad
    /// source-block reference, ...). Carries a human-readable message.
    Other(String),
}

impl fmt::Display for GroveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroveError::NotAJob(path) => {
                write!(f, "{} is not a job file (no `type` in frontmatter)", path.display())
            }
            GroveError::InvalidJob { path, reason } => {
                write!(f, "invalid job file {}: {}", path.display(), reason)
            }
            GroveError::DuplicateId { id, first, second } => {
                write!(
                    f,
                    "duplicate job id `{id}`: declared by both {} and {}",
                    first.display(),
                    second.display()
                )
            }
            GroveError::DependencyMissing { job, reference } => {
                write!(f, "job `{job}` depends on unknown reference `{reference}`")
            }
            GroveError::CircularDependency { path } => {
                write!(f, "circular dependency: {path}")
            }
            GroveError::Locked { path, holder } => {
                write!(f, "{} is locked by {holder}", path.display())
            }
            GroveError::WriteConflict { path, source } => {
                write!(f, "failed replacing {}: {source}", path.display())
            }
            GroveError::BackendFailure(message) => {
                write!(f, "completion backend failed: {message}")
            }
            GroveError::Canceled => write!(f, "canceled"),
            GroveError::BlockedPlan { pending } => {
                write!(
                    f,
                    "plan is blocked: no job is runnable and nothing is running (pending: {})",
                    pending.join(", ")
                )
            }
            GroveError::StepLimitExceeded { steps } => {
                write!(f, "orchestrator exceeded {steps} consecutive steps; aborting as a safeguard")
            }
            GroveError::UnterminatedFrontmatter(path) => {
                write!(f, "{} opens a frontmatter block that never closes", path.display())
            }
            GroveError::Yaml(err) => write!(f, "YAML error: {err}"),
            GroveError::Json(err) => write!(f, "JSON error: {err}"),
            GroveError::Io(err) => write!(f, "I/O error: {err}"),
            GroveError::Git(err) => write!(f, "git error: {err}"),
            GroveError::Other(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for GroveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GroveError::WriteConflict { source, .. } => Some(source),
            GroveError::Yaml(err) => Some(err),
            GroveError::Json(err) => Some(err),
            GroveError::Io(err) => Some(err),
            GroveError::Git(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for GroveError {
    fn from(err: io::Error) -> Self {
        GroveError::Io(err)
    }
}

impl From<serde_yaml::Error> for GroveError {
    fn from(err: serde_yaml::Error) -> Self {
        GroveError::Yaml(err)
    }
}

impl From<serde_json::Error> for GroveError {
    fn from(err: serde_json::Error) -> Self {
        GroveError::Json(err)
    }
}

impl From<git2::Error> for GroveError {
    fn from(err: git2::Error) -> Self {
        GroveError::Git(err)
    }
}

impl GroveError {
    /// True for load-time classifications that the plan loader skips
    /// instead of surfacing.
    pub fn is_not_a_job(&self) -> bool {
        matches!(self, GroveError::NotAJob(_))
    }

    pub fn other(message: impl Into<String>) -> Self {
        GroveError::Other(message.into())
    }
}
