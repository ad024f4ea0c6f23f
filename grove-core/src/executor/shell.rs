use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::artifacts::ArtifactStore;
use crate::error::GroveError;
use crate::executor::{ExecutorContext, Outcome};
use crate::job::Job;
use crate::persist::JobLock;
use crate::workdir;

/// The job body is the script: piped into `sh` in the resolved working
/// directory, exit code drives success. Output streams land in the job
/// log and a tail of stdout is folded back into the job file.
pub(super) async fn execute(
    ctx: &ExecutorContext,
    lock: &JobLock,
    job: &mut Job,
    artifacts: &ArtifactStore,
) -> std::result::Result<Outcome, GroveError> {
    let work_dir = workdir::resolve_work_dir(job, &ctx.plan)?;
    debug!(job = %job.id, dir = %work_dir.display(), "spawning shell job");

    let mut child = Command::new("sh")
        .current_dir(&work_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(job.prompt_body.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stdout.lines() {
        artifacts.append_job_log(&job.id, &format!("stdout: {line}"))?;
    }
    for line in stderr.lines() {
        artifacts.append_job_log(&job.id, &format!("stderr: {line}"))?;
    }

    if !output.status.success() {
        return Err(GroveError::other(format!(
            "shell job exited with {}: {}",
            output
                .status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            tail(&stderr, 5),
        )));
    }

    let summary = tail(&stdout, 20);
    if !summary.is_empty() {
        ctx.persister.append_job_output_locked(lock, job, &summary)?;
    }
    Ok(Outcome::Completed)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n").trim().to_string()
}
