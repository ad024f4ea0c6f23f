use std::process::Stdio;

use async_trait::async_trait;
use grove_core::backend::{AgentRunRequest, CompletionBackend, CompletionRequest};
use grove_core::error::{GroveError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const COMPLETE_CMD_ENV: &str = "GROVE_COMPLETE_CMD";
pub const AGENT_CMD_ENV: &str = "GROVE_AGENT_CMD";

/// Backend that shells out to operator-configured commands: the
/// completion command reads the briefing on stdin and prints the
/// response; the agent command runs inside the worktree with the job
/// environment. This is the CLI's concrete collaborator; the core only
/// sees the `CompletionBackend` capability.
pub struct CommandBackend {
    complete_cmd: Option<String>,
    agent_cmd: Option<String>,
}

impl CommandBackend {
    pub fn from_env() -> Self {
        CommandBackend {
            complete_cmd: std::env::var(COMPLETE_CMD_ENV).ok().filter(|v| !v.is_empty()),
            agent_cmd: std::env::var(AGENT_CMD_ENV).ok().filter(|v| !v.is_empty()),
        }
    }
}

#[async_trait]
impl CompletionBackend for CommandBackend {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String> {
        let command = self.complete_cmd.as_deref().ok_or_else(|| {
            GroveError::BackendFailure(format!(
                "no completion command configured; set {COMPLETE_CMD_ENV}"
            ))
        })?;
        debug!(job = %request.job.id, command, "invoking completion command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(request.work_dir)
            .env("JOB_ID", &request.job.id)
            .env("PLAN_NAME", &request.plan.name)
            .env("MODEL", request.model.unwrap_or_default())
            .env(
                "PROMPT_FILES",
                request
                    .prompt_source_files
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| GroveError::BackendFailure(err.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|err| GroveError::BackendFailure(err.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| GroveError::BackendFailure(err.to_string()))?;

        if !output.status.success() {
            return Err(GroveError::BackendFailure(format!(
                "completion command exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_agent(&self, request: AgentRunRequest<'_>) -> Result<()> {
        let command = self.agent_cmd.as_deref().ok_or_else(|| {
            GroveError::BackendFailure(format!(
                "no agent command configured; set {AGENT_CMD_ENV}"
            ))
        })?;
        debug!(job = %request.job.id, command, "spawning agent");

        // The prompt travels via file rather than stdin so interactive
        // agents keep the terminal.
        let prompt_path = request.worktree.join(".grove-briefing.xml");
        tokio::fs::write(&prompt_path, request.prompt)
            .await
            .map_err(|err| GroveError::BackendFailure(err.to_string()))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(request.worktree)
            .env("BRIEFING_PATH", &prompt_path)
            .stdin(if request.interactive {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| GroveError::BackendFailure(err.to_string()))?;
        let status = child
            .wait()
            .await
            .map_err(|err| GroveError::BackendFailure(err.to_string()))?;
        let _ = tokio::fs::remove_file(&prompt_path).await;

        if !status.success() {
            return Err(GroveError::BackendFailure(format!(
                "agent exited with {:?}",
                status.code()
            )));
        }
        Ok(())
    }
}
