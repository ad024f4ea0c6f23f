use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::error::{GroveError, Result};
use crate::job::{Job, JobStatus, JobType};
use crate::plan::Plan;

/// A layered view of the plan: jobs in one stage may run in parallel, and
/// every job in stage `k` depends only on jobs in stages before `k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub stages: Vec<Vec<String>>,
}

/// Derived from a plan; edges carry resolved dependencies only. Unresolved
/// references are absent from the edges but still block runnability, which
/// inspects `Job::dependencies` directly.
pub struct DependencyGraph<'a> {
    plan: &'a Plan,
    edges: HashMap<String, Vec<String>>,
}

impl<'a> DependencyGraph<'a> {
    pub fn build(plan: &'a Plan) -> Self {
        let edges = plan
            .jobs
            .iter()
            .map(|job| {
                let deps: Vec<String> = job.dependencies.iter().flatten().cloned().collect();
                (job.id.clone(), deps)
            })
            .collect();
        DependencyGraph { plan, edges }
    }

    pub fn edges(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check for self-loops and cycles (fatal) and collect unresolved
    /// references (returned as human-readable warnings, never fatal).
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        for job in &self.plan.jobs {
            for (reference, slot) in job.depends_on.iter().zip(&job.dependencies) {
                if slot.is_none() {
                    warnings.push(
                        GroveError::DependencyMissing {
                            job: job.id.clone(),
                            reference: reference.clone(),
                        }
                        .to_string(),
                    );
                }
            }
            if self.edges(&job.id).iter().any(|dep| dep == &job.id) {
                return Err(GroveError::CircularDependency {
                    path: format!("{id} → {id}", id = job.id),
                });
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(GroveError::CircularDependency {
                path: cycle.join(" → "),
            });
        }
        Ok(warnings)
    }

    /// DFS over resolved edges with an explicit path stack; the returned
    /// cycle closes on its first element (`A → B → A` comes back as
    /// `[A, B, A]`).
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum VisitState {
            Visiting,
            Visited,
        }

        fn dfs(
            node: &str,
            edges: &HashMap<String, Vec<String>>,
            states: &mut HashMap<String, VisitState>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            states.insert(node.to_string(), VisitState::Visiting);
            stack.push(node.to_string());

            if let Some(dependencies) = edges.get(node) {
                for dependency in dependencies {
                    if let Some(pos) = stack.iter().position(|value| value == dependency) {
                        let mut cycle = stack[pos..].to_vec();
                        cycle.push(dependency.clone());
                        return Some(cycle);
                    }
                    if !matches!(states.get(dependency), Some(VisitState::Visited))
                        && let Some(cycle) = dfs(dependency, edges, states, stack)
                    {
                        return Some(cycle);
                    }
                }
            }

            stack.pop();
            states.insert(node.to_string(), VisitState::Visited);
            None
        }

        let mut states = HashMap::new();
        for job in &self.plan.jobs {
            if matches!(states.get(&job.id), Some(VisitState::Visited)) {
                continue;
            }
            let mut stack = Vec::new();
            if let Some(cycle) = dfs(&job.id, &self.edges, &mut states, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// All jobs satisfying the runnability predicate, in plan order.
    pub fn runnable_jobs(&self) -> Vec<&Job> {
        self.plan
            .jobs
            .iter()
            .filter(|job| is_runnable(job, self.plan))
            .collect()
    }

    /// Topological sort (dependencies first), then greedy layering: each
    /// stage is the maximal set of unprocessed jobs whose resolved deps
    /// are all processed. Jobs already `completed` are absorbed into the
    /// processed set without being emitted.
    pub fn execution_plan(&self) -> Result<ExecutionPlan> {
        if let Some(cycle) = self.find_cycle() {
            return Err(GroveError::CircularDependency {
                path: cycle.join(" → "),
            });
        }

        let order: Vec<&Job> = self.plan.jobs.iter().collect();
        let mut processed: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&Job> = order;
        let mut stages = Vec::new();

        while !remaining.is_empty() {
            let (ready, rest): (Vec<&Job>, Vec<&Job>) = remaining.into_iter().partition(|job| {
                self.edges(&job.id)
                    .iter()
                    .all(|dep| processed.contains(dep.as_str()))
            });
            if ready.is_empty() {
                // Jobs whose resolved deps never complete (cycle already
                // excluded above, so this is unreachable in practice).
                break;
            }
            for job in &ready {
                processed.insert(job.id.as_str());
            }
            let stage: Vec<String> = ready
                .iter()
                .filter(|job| job.status != JobStatus::Completed)
                .map(|job| job.id.clone())
                .collect();
            if !stage.is_empty() {
                stages.push(stage);
            }
            remaining = rest;
        }

        Ok(ExecutionPlan { stages })
    }

    /// `graph TD` export with one node per job (label `id (status)`), one
    /// edge per resolved dependency, and a styling class per status.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");
        for job in &self.plan.jobs {
            let _ = writeln!(
                out,
                "    {}[\"{} ({})\"]",
                node_ref(&job.id),
                job.id,
                job.status
            );
        }
        for job in &self.plan.jobs {
            for dep in self.edges(&job.id) {
                let _ = writeln!(out, "    {} --> {}", node_ref(dep), node_ref(&job.id));
            }
        }

        let mut seen = HashSet::new();
        for job in &self.plan.jobs {
            if seen.insert(job.status) {
                let _ = writeln!(
                    out,
                    "    classDef {status} fill:{fill},stroke:#333\n    class {nodes} {status}",
                    status = job.status,
                    fill = status_fill(job.status),
                    nodes = self
                        .plan
                        .jobs
                        .iter()
                        .filter(|other| other.status == job.status)
                        .map(|other| node_ref(&other.id))
                        .collect::<Vec<_>>()
                        .join(",")
                );
            }
        }
        out
    }
}

/// Mermaid node identifiers cannot carry every character a job id can;
/// keep alphanumerics and dashes and flatten the rest.
fn node_ref(id: &str) -> String {
    id.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn status_fill(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending | JobStatus::Todo => "#ddd",
        JobStatus::Running => "#ffd966",
        JobStatus::Completed => "#b6d7a8",
        JobStatus::Failed => "#ea9999",
        JobStatus::Blocked | JobStatus::Hold | JobStatus::Abandoned => "#cccccc",
        JobStatus::NeedsReview | JobStatus::PendingUser | JobStatus::PendingLlm => "#a4c2f4",
    }
}

/// The runnability predicate: the job's own status is a valid start state
/// and every dependency slot is satisfied. A missing (`None`) slot never
/// satisfies. Interactive and plain agent jobs may treat a `chat`
/// dependency sitting in `pending_user` as satisfied.
pub fn is_runnable(job: &Job, plan: &Plan) -> bool {
    if !job.status.is_start_state(job.job_type) {
        return false;
    }
    job.dependencies.iter().all(|slot| match slot {
        None => false,
        Some(dep_id) => match plan.job(dep_id) {
            None => false,
            Some(dep) => {
                dep.status == JobStatus::Completed
                    || (matches!(job.job_type, JobType::Agent | JobType::InteractiveAgent)
                        && dep.job_type == JobType::Chat
                        && dep.status == JobStatus::PendingUser)
            }
        },
    })
}
