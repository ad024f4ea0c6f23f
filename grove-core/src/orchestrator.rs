use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backend::{CancelToken, CompletionBackend, TemplateStore};
use crate::error::{GroveError, Result};
use crate::executor::{self, ExecutorContext};
use crate::graph::{DependencyGraph, is_runnable};
use crate::job::JobStatus;
use crate::persist::StatePersister;
use crate::plan::{self, Plan};

/// Pause between dispatch rounds, distinct from the longer
/// `check_interval` used while foreign writers hold `running` jobs.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanStatus {
    pub total: usize,
    /// Runnable `pending` jobs.
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    /// `pending` jobs whose dependencies do not (yet) allow dispatch.
    pub blocked: usize,
    /// Completed share of the whole plan, in percent.
    pub progress: f64,
}

/// Drives a plan directory to completion. The plan is reloaded from disk
/// on every iteration; the files are the only state that survives between
/// rounds, which is what makes an interrupted run resumable.
pub struct Orchestrator {
    plan_dir: PathBuf,
    backend: Arc<dyn CompletionBackend>,
    templates: Arc<dyn TemplateStore>,
    persister: Arc<StatePersister>,
    cancel: CancelToken,
    max_parallel_jobs: Option<usize>,
    check_interval: Option<Duration>,
    max_consecutive_steps: Option<u64>,
    job_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        plan_dir: impl Into<PathBuf>,
        backend: Arc<dyn CompletionBackend>,
        templates: Arc<dyn TemplateStore>,
    ) -> Self {
        Orchestrator {
            plan_dir: plan_dir.into(),
            backend,
            templates,
            persister: Arc::new(StatePersister::new()),
            cancel: CancelToken::never(),
            max_parallel_jobs: None,
            check_interval: None,
            max_consecutive_steps: None,
            job_timeout: None,
        }
    }

    /// Overrides win over `.grove-plan.yml`, which wins over built-ins.
    pub fn with_max_parallel_jobs(mut self, jobs: usize) -> Self {
        self.max_parallel_jobs = Some(jobs);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    pub fn with_max_consecutive_steps(mut self, steps: u64) -> Self {
        self.max_consecutive_steps = Some(steps);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn load(&self) -> Result<Plan> {
        plan::load_plan(&self.plan_dir)
    }

    fn context(&self, plan: Arc<Plan>) -> ExecutorContext {
        ExecutorContext {
            timeout: self.job_timeout.or_else(|| plan.config.job_timeout()),
            plan,
            backend: self.backend.clone(),
            templates: self.templates.clone(),
            persister: self.persister.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run until every job is `completed`, a job fails with nothing left
    /// to run, the plan blocks, or the step safeguard trips.
    pub async fn run_all(&self) -> Result<()> {
        let mut steps: u64 = 0;
        loop {
            if self.cancel.is_canceled() {
                return Err(GroveError::Canceled);
            }

            let plan = Arc::new(self.load()?);
            let max_parallel = self
                .max_parallel_jobs
                .unwrap_or_else(|| plan.config.max_parallel_jobs());
            let max_steps = self
                .max_consecutive_steps
                .unwrap_or_else(|| plan.config.max_consecutive_steps());
            let check_interval = self
                .check_interval
                .unwrap_or_else(|| plan.config.check_interval());

            let pending = count(&plan, JobStatus::Pending);
            let running = count(&plan, JobStatus::Running);
            let failed = count(&plan, JobStatus::Failed);

            if pending == 0 && running == 0 {
                if failed > 0 {
                    let failed_ids: Vec<String> = plan
                        .jobs
                        .iter()
                        .filter(|job| job.status == JobStatus::Failed)
                        .map(|job| job.id.clone())
                        .collect();
                    return Err(GroveError::other(format!(
                        "{failed} job(s) failed: {}",
                        failed_ids.join(", ")
                    )));
                }
                info!(plan = %plan.name, "plan complete");
                return Ok(());
            }

            let graph = DependencyGraph::build(&plan);
            let mut runnable: Vec<String> = graph
                .runnable_jobs()
                .into_iter()
                .map(|job| job.id.clone())
                .collect();
            runnable.truncate(max_parallel);

            if runnable.is_empty() {
                if running > 0 {
                    debug!(running, "nothing runnable; waiting on running jobs");
                    tokio::time::sleep(check_interval).await;
                } else {
                    let pending_ids: Vec<String> = plan
                        .jobs
                        .iter()
                        .filter(|job| job.status == JobStatus::Pending)
                        .map(|job| job.id.clone())
                        .collect();
                    return Err(GroveError::BlockedPlan {
                        pending: pending_ids,
                    });
                }
            } else {
                let errors = self.dispatch(plan.clone(), &runnable, max_parallel).await;
                for (job_id, err) in &errors {
                    warn!(job = %job_id, "job failed: {err}");
                }
            }

            steps += 1;
            if steps >= max_steps {
                return Err(GroveError::StepLimitExceeded { steps });
            }
            tokio::time::sleep(TICK).await;
        }
    }

    /// Dispatch one round concurrently, bounded by a semaphore of
    /// `max_parallel` slots, and join everything before returning. Job
    /// failures are collected, not propagated: the round's other jobs
    /// keep running and the loop decides what failure means.
    async fn dispatch(
        &self,
        plan: Arc<Plan>,
        runnable: &[String],
        max_parallel: usize,
    ) -> Vec<(String, GroveError)> {
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut set = JoinSet::new();

        for job_id in runnable {
            let Some(job) = plan.job(job_id) else {
                continue;
            };
            let mut job = job.clone();
            let ctx = self.context(plan.clone());
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("dispatch semaphore never closes");
                let result = executor::execute_job(&ctx, &mut job).await;
                (job.id, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((job_id, Err(err))) => errors.push((job_id, err)),
                Err(join_err) => errors.push((
                    "<task>".to_string(),
                    GroveError::other(format!("dispatched task panicked: {join_err}")),
                )),
            }
        }
        errors
    }

    /// Run one specific job file, regardless of what else the plan holds.
    pub async fn run_job(&self, file: &Path) -> Result<()> {
        let plan = Arc::new(self.load()?);
        let filename = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let job = plan
            .job_by_filename(&filename)
            .ok_or_else(|| GroveError::other(format!("no job file named `{filename}` in plan")))?;

        if !is_runnable(job, &plan) && job.job_type != crate::job::JobType::Chat {
            return Err(GroveError::other(format!(
                "job `{}` is not runnable (status {}, unsatisfied dependencies)",
                job.id, job.status
            )));
        }

        let mut job = job.clone();
        let ctx = self.context(plan);
        executor::execute_job(&ctx, &mut job).await
    }

    /// Run the first runnable job, if any; returns its id.
    pub async fn run_next(&self) -> Result<Option<String>> {
        let plan = Arc::new(self.load()?);
        let graph = DependencyGraph::build(&plan);
        let Some(job) = graph.runnable_jobs().into_iter().next() else {
            return Ok(None);
        };
        let mut job = job.clone();
        let ctx = self.context(plan);
        executor::execute_job(&ctx, &mut job).await?;
        Ok(Some(job.id))
    }

    pub fn status(&self) -> Result<PlanStatus> {
        let plan = self.load()?;
        Ok(plan_status(&plan))
    }
}

pub fn plan_status(plan: &Plan) -> PlanStatus {
    let total = plan.jobs.len();
    let completed = count(plan, JobStatus::Completed);
    let mut status = PlanStatus {
        total,
        running: count(plan, JobStatus::Running),
        completed,
        failed: count(plan, JobStatus::Failed),
        progress: if total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / total as f64
        },
        ..Default::default()
    };
    for job in plan
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Pending)
    {
        if is_runnable(job, plan) {
            status.pending += 1;
        } else {
            status.blocked += 1;
        }
    }
    status
}

fn count(plan: &Plan, status: JobStatus) -> usize {
    plan.jobs.iter().filter(|job| job.status == status).count()
}
