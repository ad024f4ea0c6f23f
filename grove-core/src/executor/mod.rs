use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::artifacts::ArtifactStore;
use crate::backend::{CancelToken, CompletionBackend, TemplateStore};
use crate::chat;
use crate::error::{GroveError, Result};
use crate::job::{Job, JobStatus, JobType};
use crate::persist::{JobLock, StatePersister};
use crate::plan::Plan;

mod agent;
mod chat_job;
mod oneshot;
mod shell;

/// Shared context for one job execution. The orchestrator builds one per
/// dispatch; everything in it is cheap to clone across tasks.
#[derive(Clone)]
pub struct ExecutorContext {
    pub plan: Arc<Plan>,
    pub backend: Arc<dyn CompletionBackend>,
    pub templates: Arc<dyn TemplateStore>,
    pub persister: Arc<StatePersister>,
    pub cancel: CancelToken,
    pub timeout: Option<Duration>,
}

/// What a type-specific executor decided the job's terminal status is.
/// Chat jobs suspend back to `pending_user` instead of completing.
enum Outcome {
    Completed,
    Suspended(JobStatus),
}

/// Run one job to a terminal (or suspended) state.
///
/// The skeleton every executor shares: take the file lock, flip to
/// `running`, do the type-specific work under cancellation and deadline,
/// then record the outcome. All status traffic goes through the persister
/// while the lock is held.
pub async fn execute_job(ctx: &ExecutorContext, job: &mut Job) -> Result<()> {
    let lock = ctx.persister.lock_job(job)?;
    let artifacts = ArtifactStore::for_plan(&ctx.plan);

    // Chat jobs pre-flight their turn state before any status churn: a
    // conversation waiting on the operator records `pending_user` and
    // never reaches the backend.
    if job.job_type == JobType::Chat {
        let turns = chat::parse_conversation(&job.prompt_body);
        let action = chat::trailing_user_directive(&turns)
            .and_then(|directive| directive.action.as_deref());
        if !chat::conversation_is_ready(&turns) && action != Some(chat::ACTION_COMPLETE) {
            if job.status != JobStatus::PendingUser {
                ctx.persister
                    .update_job_status_locked(&lock, job, JobStatus::PendingUser)?;
            }
            debug!(job = %job.id, "chat job is awaiting user input");
            return Ok(());
        }
    }

    ctx.persister
        .update_job_status_locked(&lock, job, JobStatus::Running)?;
    artifacts.append_job_log(&job.id, &format!("running as {}", job.job_type))?;

    let started = Instant::now();
    let worked = run_with_limits(ctx, &lock, job, &artifacts).await;
    let elapsed = started.elapsed().as_secs_f64();

    match worked {
        Ok(Outcome::Completed) => {
            let mut meta = job.metadata.clone();
            meta.execution_time = Some(elapsed);
            meta.last_error = None;
            ctx.persister.update_job_metadata_locked(&lock, job, &meta)?;
            ctx.persister
                .update_job_status_locked(&lock, job, JobStatus::Completed)?;
            artifacts.append_job_log(&job.id, "completed")?;
            Ok(())
        }
        Ok(Outcome::Suspended(status)) => {
            ctx.persister.update_job_status_locked(&lock, job, status)?;
            artifacts.append_job_log(&job.id, &format!("suspended as {status}"))?;
            Ok(())
        }
        Err(err) => {
            let mut meta = job.metadata.clone();
            meta.execution_time = Some(elapsed);
            meta.retry_count += 1;
            meta.last_error = Some(match &err {
                GroveError::Canceled => "canceled".to_string(),
                other => other.to_string(),
            });
            if let Err(meta_err) = ctx.persister.update_job_metadata_locked(&lock, job, &meta) {
                warn!(job = %job.id, "failed recording job metadata: {meta_err}");
            }
            ctx.persister
                .update_job_status_locked(&lock, job, JobStatus::Failed)?;
            artifacts.append_job_log(&job.id, &format!("failed: {err}"))?;
            Err(err)
        }
    }
}

async fn run_with_limits(
    ctx: &ExecutorContext,
    lock: &JobLock,
    job: &mut Job,
    artifacts: &ArtifactStore,
) -> std::result::Result<Outcome, GroveError> {
    let cancel = ctx.cancel.clone();
    let work = dispatch(ctx, lock, job, artifacts);

    tokio::select! {
        _ = cancel.canceled() => Err(GroveError::Canceled),
        outcome = async {
            match ctx.timeout {
                Some(deadline) => tokio::time::timeout(deadline, work)
                    .await
                    .map_err(|_| GroveError::other(format!(
                        "job exceeded its {}s deadline",
                        deadline.as_secs()
                    )))?,
                None => work.await,
            }
        } => outcome,
    }
}

async fn dispatch(
    ctx: &ExecutorContext,
    lock: &JobLock,
    job: &mut Job,
    artifacts: &ArtifactStore,
) -> std::result::Result<Outcome, GroveError> {
    match job.job_type {
        JobType::Oneshot | JobType::GenerateRecipe => {
            oneshot::execute(ctx, lock, job, artifacts).await
        }
        JobType::Agent | JobType::HeadlessAgent | JobType::InteractiveAgent => {
            agent::execute(ctx, lock, job, artifacts).await
        }
        JobType::Chat => chat_job::execute(ctx, lock, job, artifacts).await,
        JobType::Shell => shell::execute(ctx, lock, job, artifacts).await,
    }
}

/// Timestamp suffix for briefing artifacts of non-chat jobs.
pub(crate) fn briefing_timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// The model a job's completion should use: frontmatter wins, then plan
/// config.
pub(crate) fn resolve_model<'a>(job: &'a Job, plan: &'a Plan) -> Option<&'a str> {
    job.model.as_deref().or(plan.config.model.as_deref())
}
