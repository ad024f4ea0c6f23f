use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const PLAN_CONFIG_FILE: &str = ".grove-plan.yml";

pub const DEFAULT_MAX_PARALLEL_JOBS: usize = 4;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_CONSECUTIVE_STEPS: u64 = 200;
/// A lock file untouched for this long is considered abandoned.
pub const STALE_LOCK_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Plan-wide defaults loaded from `.grove-plan.yml`. Every field is
/// optional; job frontmatter wins over plan config, plan config wins over
/// built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanConfig {
    pub model: Option<String>,
    pub worktree: Option<String>,
    pub repositories: Vec<String>,
    pub prepend_dependencies: Option<bool>,
    pub max_parallel_jobs: Option<usize>,
    pub check_interval_secs: Option<u64>,
    pub max_consecutive_steps: Option<u64>,
    /// Per-job wall-clock deadline in seconds; absent means no deadline.
    pub job_timeout_secs: Option<u64>,
    pub hooks: Hooks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Hooks {
    /// External command that prints an agent session transcript for a job
    /// id, one JSON line per event.
    pub agent_logs: Option<String>,
    /// Command run after a job with `output.type: commit` completes.
    pub on_commit: Option<String>,
}

impl PlanConfig {
    /// Load the plan config if the file exists; a missing file is an empty
    /// config, not an error.
    pub fn load(plan_dir: &Path) -> Result<PlanConfig> {
        let path = plan_dir.join(PLAN_CONFIG_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PlanConfig::default());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn max_parallel_jobs(&self) -> usize {
        self.max_parallel_jobs
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_PARALLEL_JOBS)
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CHECK_INTERVAL)
    }

    pub fn max_consecutive_steps(&self) -> u64 {
        self.max_consecutive_steps
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_CONSECUTIVE_STEPS)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = PlanConfig::load(dir.path()).unwrap();
        assert_eq!(config, PlanConfig::default());
        assert_eq!(config.max_parallel_jobs(), DEFAULT_MAX_PARALLEL_JOBS);
    }

    #[test]
    fn loads_defaults_and_hooks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PLAN_CONFIG_FILE),
            "model: small-fast\nprepend_dependencies: true\nmax_parallel_jobs: 2\nhooks:\n  agent_logs: agent-logs\n",
        )
        .unwrap();

        let config = PlanConfig::load(dir.path()).unwrap();
        assert_eq!(config.model.as_deref(), Some("small-fast"));
        assert_eq!(config.prepend_dependencies, Some(true));
        assert_eq!(config.max_parallel_jobs(), 2);
        assert_eq!(config.hooks.agent_logs.as_deref(), Some("agent-logs"));
    }
}
