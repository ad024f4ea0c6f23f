use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use chrono::Utc;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::error::{GroveError, Result};
use crate::plan::Plan;

/// Everything an execution leaves behind lives under `.artifacts/`:
/// briefings at the top level (named by job and turn/timestamp), and a
/// per-job directory owning the log, metadata, and transcript. The
/// executor holding the job's lock owns that directory for the duration.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn for_plan(plan: &Plan) -> ArtifactStore {
        ArtifactStore {
            root: plan.artifacts_dir(),
        }
    }

    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(job_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn job_log_path(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id).join("job.log")
    }

    /// Append one timestamped line to the per-job log.
    pub fn append_job_log(&self, job_id: &str, line: &str) -> Result<()> {
        let dir = self.job_dir(job_id)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("job.log"))?;
        writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), line)?;
        Ok(())
    }

    /// Persist a briefing for audit. `suffix` is a timestamp for one-shot
    /// briefings and the 6-hex turn id for chat turns, giving chat
    /// briefings a 1-to-1 correspondence with embedded directives.
    pub fn write_briefing(&self, job_id: &str, suffix: &str, xml: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(format!("briefing-{job_id}-{suffix}.xml"));
        fs::write(&path, xml)?;
        Ok(path)
    }

    pub fn write_metadata(&self, job_id: &str, metadata: &serde_json::Value) -> Result<PathBuf> {
        let dir = self.job_dir(job_id)?;
        let path = dir.join("metadata.json");
        fs::write(&path, serde_json::to_vec_pretty(metadata)?)?;
        Ok(path)
    }

    pub fn transcript_path(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id).join("transcript.jsonl")
    }

    pub fn write_transcript(&self, job_id: &str, transcript: &str) -> Result<PathBuf> {
        let dir = self.job_dir(job_id)?;
        let path = dir.join("transcript.jsonl");
        fs::write(&path, transcript)?;
        Ok(path)
    }

    /// Archive the session registry entry for an agent run.
    pub fn archive_session(&self, job_id: &str, exit_status: Option<i32>) -> Result<()> {
        let metadata = json!({
            "job_id": job_id,
            "archived_at": Utc::now().to_rfc3339(),
            "exit_status": exit_status,
        });
        self.write_metadata(job_id, &metadata)?;
        Ok(())
    }
}

/// Read an agent session transcript through the configured external
/// `agent-logs` command. The command receives the job id as its argument
/// and prints one JSON event per line.
pub async fn fetch_agent_transcript(command: &str, job_id: &str) -> Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(format!("{command} {job_id}"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GroveError::other(format!(
            "agent-logs command failed for job {job_id}: {}",
            stderr.trim()
        )));
    }
    debug!(job = job_id, "fetched agent transcript");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore {
            root: dir.path().join(".artifacts"),
        };
        (dir, store)
    }

    #[test]
    fn briefing_filename_carries_job_and_suffix() {
        let (_dir, store) = store();
        let path = store.write_briefing("alpha-1f", "3fa2bc", "<prompt/>").unwrap();
        assert!(path.ends_with("briefing-alpha-1f-3fa2bc.xml"));
        assert_eq!(fs::read_to_string(path).unwrap(), "<prompt/>");
    }

    #[test]
    fn job_log_appends_lines() {
        let (_dir, store) = store();
        store.append_job_log("a", "started").unwrap();
        store.append_job_log("a", "finished").unwrap();
        let log = fs::read_to_string(store.job_log_path("a")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("started"));
    }

    #[tokio::test]
    async fn transcript_command_output_is_captured() {
        let transcript = fetch_agent_transcript("echo transcript-for", "job-1")
            .await
            .unwrap();
        assert_eq!(transcript.trim(), "transcript-for job-1");

        assert!(fetch_agent_transcript("false", "job-1").await.is_err());
    }
}
