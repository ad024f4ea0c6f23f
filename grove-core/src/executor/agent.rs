use std::fs;

use tracing::{debug, warn};

use crate::artifacts::{self, ArtifactStore};
use crate::backend::AgentRunRequest;
use crate::error::GroveError;
use crate::executor::{ExecutorContext, Outcome, briefing_timestamp};
use crate::frontmatter;
use crate::job::Job;
use crate::persist::{self, JobLock};
use crate::prompt::PromptAssembler;
use crate::workdir;

const TRANSCRIPT_HEADER: &str = "# Agent Chat Transcript";

/// Spawn the external agent in the job's working tree. The process learns
/// its identity from the environment; after it returns, the session is
/// archived and the transcript (read through the agent-logs hook) is
/// folded into the job file.
pub(super) async fn execute(
    ctx: &ExecutorContext,
    _lock: &JobLock,
    job: &mut Job,
    artifacts: &ArtifactStore,
) -> std::result::Result<Outcome, GroveError> {
    let work_dir = workdir::resolve_work_dir(job, &ctx.plan)?;
    let assembler = PromptAssembler::new(&ctx.plan, ctx.templates.as_ref());
    let briefing = assembler.assemble(job, &work_dir)?;
    artifacts.write_briefing(&job.id, &briefing_timestamp(), &briefing.xml)?;

    let env = vec![
        ("JOB_ID".to_string(), job.id.clone()),
        (
            "JOB_PATH".to_string(),
            job.file_path.display().to_string(),
        ),
        ("PLAN_NAME".to_string(), ctx.plan.name.clone()),
        ("JOB_TITLE".to_string(), job.title.clone()),
    ];

    ctx.backend
        .run_agent(AgentRunRequest {
            job,
            plan: &ctx.plan,
            prompt: &briefing.xml,
            worktree: &work_dir,
            env,
            interactive: job.job_type.is_interactive(),
        })
        .await
        .map_err(|err| match err {
            GroveError::BackendFailure(_) | GroveError::Canceled => err,
            other => GroveError::BackendFailure(other.to_string()),
        })?;

    artifacts.archive_session(&job.id, Some(0))?;

    match &ctx.plan.config.hooks.agent_logs {
        Some(command) => match artifacts::fetch_agent_transcript(command, &job.id).await {
            Ok(transcript) => {
                artifacts.write_transcript(&job.id, &transcript)?;
                append_transcript(job, &transcript)?;
            }
            Err(err) => {
                // A lost transcript is an observability gap, not a failed
                // job.
                warn!(job = %job.id, "could not read agent transcript: {err}");
            }
        },
        None => debug!(job = %job.id, "no agent-logs hook configured; skipping transcript"),
    }

    Ok(Outcome::Completed)
}

/// Put the transcript under `# Agent Chat Transcript`, replacing any
/// section from a previous run instead of stacking a duplicate.
fn append_transcript(job: &mut Job, transcript: &str) -> std::result::Result<(), GroveError> {
    let bytes = fs::read(&job.file_path)?;
    let (mapping, body) = frontmatter::parse(&bytes)?;

    let mut kept = match body.lines().position(|line| line.trim_end() == TRANSCRIPT_HEADER) {
        Some(index) => body
            .lines()
            .take(index)
            .map(|line| format!("{line}\n"))
            .collect::<String>(),
        None => body,
    };
    if !kept.is_empty() && !kept.ends_with('\n') {
        kept.push('\n');
    }
    kept.push_str(&format!("\n{TRANSCRIPT_HEADER}\n\n{}\n", transcript.trim_end()));

    let rewritten = frontmatter::render(&mapping, &kept)?;
    persist::atomic_write(&job.file_path, rewritten.as_bytes())?;
    job.prompt_body = kept;
    Ok(())
}
