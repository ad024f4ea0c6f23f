use std::path::{Path, PathBuf};

use git2::Repository;
use tracing::debug;

use crate::error::{GroveError, Result};
use crate::job::Job;
use crate::plan::Plan;

/// Resolve where a job runs: its declared worktree if any, else the git
/// repository enclosing the plan, else the plan directory itself. A
/// `repository` selector scopes the result to a sub-project directory.
pub fn resolve_work_dir(job: &Job, plan: &Plan) -> Result<PathBuf> {
    let worktree = job
        .worktree
        .as_deref()
        .or(plan.config.worktree.as_deref());

    let mut base = match worktree {
        Some(selector) => resolve_worktree(selector, &plan.directory)?,
        None => project_root(&plan.directory),
    };

    if let Some(repository) = &job.repository {
        let scoped = base.join(repository);
        if !scoped.is_dir() {
            return Err(GroveError::other(format!(
                "repository `{repository}` not found under {}",
                base.display()
            )));
        }
        base = scoped;
    }

    Ok(base)
}

/// A worktree selector is either a git worktree name registered on the
/// enclosing repository or a plain directory path (absolute, or relative
/// to the plan directory). Worktree *creation* belongs to an external
/// collaborator; here we only locate.
fn resolve_worktree(selector: &str, plan_dir: &Path) -> Result<PathBuf> {
    if let Ok(repo) = Repository::discover(plan_dir)
        && let Ok(worktree) = repo.find_worktree(selector)
    {
        return Ok(worktree.path().to_path_buf());
    }

    let as_path = Path::new(selector);
    let candidate = if as_path.is_absolute() {
        as_path.to_path_buf()
    } else {
        plan_dir.join(as_path)
    };
    if candidate.is_dir() {
        return Ok(candidate);
    }

    Err(GroveError::other(format!(
        "worktree `{selector}` is neither a registered git worktree nor an existing directory"
    )))
}

/// The git workdir enclosing `plan_dir`, or the plan directory when the
/// plan lives outside any repository.
pub fn project_root(plan_dir: &Path) -> PathBuf {
    match Repository::discover(plan_dir) {
        Ok(repo) => repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| plan_dir.to_path_buf()),
        Err(err) => {
            debug!(plan = %plan_dir.display(), "no enclosing git repository: {err}");
            plan_dir.to_path_buf()
        }
    }
}
