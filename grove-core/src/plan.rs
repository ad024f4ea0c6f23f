use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PlanConfig;
use crate::error::{GroveError, Result};
use crate::frontmatter;
use crate::graph::DependencyGraph;
use crate::job::{self, Job, JobStatus, JobType};

pub const SPEC_FILE: &str = "spec.md";
pub const ARTIFACTS_DIR: &str = ".artifacts";

/// A plan is a directory of `NN-slug.md` job files plus optional config
/// and spec. The directory is the source of truth; a `Plan` value is a
/// cache rebuilt on every load.
#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub directory: PathBuf,
    /// Insertion order mirrors filename order.
    pub jobs: Vec<Job>,
    pub jobs_by_id: HashMap<String, usize>,
    pub spec_file: Option<PathBuf>,
    pub config: PlanConfig,
}

impl Plan {
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs_by_id.get(id).map(|&index| &self.jobs[index])
    }

    pub fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        let index = *self.jobs_by_id.get(id)?;
        Some(&mut self.jobs[index])
    }

    pub fn job_by_filename(&self, filename: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.filename == filename)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.directory.join(ARTIFACTS_DIR)
    }
}

/// `NN-` prefix, two decimal digits, `.md` suffix. Lock files and other
/// siblings never match.
pub fn is_job_filename(name: &str) -> bool {
    let bytes = name.as_bytes();
    name.len() > 5
        && bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && bytes[2] == b'-'
        && name.ends_with(".md")
}

/// Walk a plan directory, load every job file, resolve dependencies, and
/// check the resolved edges for cycles.
pub fn load_plan(directory: &Path) -> Result<Plan> {
    let directory = directory.to_path_buf();
    let mut filenames: Vec<String> = fs::read_dir(&directory)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ty| ty.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_job_filename(name))
        .collect();
    filenames.sort();

    let mut jobs: Vec<Job> = Vec::with_capacity(filenames.len());
    let mut jobs_by_id: HashMap<String, usize> = HashMap::new();

    for filename in filenames {
        let path = directory.join(&filename);
        let job = match job::load_job(&path) {
            Ok(job) => job,
            Err(err) if err.is_not_a_job() => {
                debug!(file = %path.display(), "skipping non-job markdown file");
                continue;
            }
            Err(err) => return Err(err),
        };

        if let Some(&existing) = jobs_by_id.get(&job.id) {
            return Err(GroveError::DuplicateId {
                id: job.id,
                first: jobs[existing].file_path.clone(),
                second: path,
            });
        }
        jobs_by_id.insert(job.id.clone(), jobs.len());
        jobs.push(job);
    }

    resolve_dependencies(&mut jobs, &jobs_by_id);

    let config = PlanConfig::load(&directory)?;
    let spec_path = directory.join(SPEC_FILE);
    let plan = Plan {
        name: directory
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        directory,
        jobs,
        jobs_by_id,
        spec_file: spec_path.exists().then_some(spec_path),
        config,
    };

    let graph = DependencyGraph::build(&plan);
    for unresolved in graph.validate()? {
        warn!("{unresolved}");
    }

    Ok(plan)
}

/// Fill each job's resolved slots: a reference matches another job's id
/// first, then its filename. Misses stay `None` and block runnability
/// without failing the load.
fn resolve_dependencies(jobs: &mut [Job], jobs_by_id: &HashMap<String, usize>) {
    let by_filename: HashMap<String, String> = jobs
        .iter()
        .map(|job| (job.filename.clone(), job.id.clone()))
        .collect();

    for job in jobs.iter_mut() {
        job.dependencies = job
            .depends_on
            .iter()
            .map(|reference| {
                if jobs_by_id.contains_key(reference) {
                    Some(reference.clone())
                } else {
                    by_filename.get(reference).cloned()
                }
            })
            .collect();
    }
}

/// Materialize a plan directory: the directory itself, its artifacts
/// subdirectory, and optionally an operator spec copied in as `spec.md`.
pub fn init_plan(directory: &Path, spec_file: Option<&Path>) -> Result<()> {
    fs::create_dir_all(directory)?;
    fs::create_dir_all(directory.join(ARTIFACTS_DIR))?;
    if let Some(spec) = spec_file {
        fs::copy(spec, directory.join(SPEC_FILE))?;
    }
    Ok(())
}

/// Inputs for creating a new job file.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub job_type: JobType,
    pub body: String,
    pub depends_on: Vec<String>,
    pub template: Option<String>,
    pub model: Option<String>,
    pub output: Option<crate::job::OutputSpec>,
}

impl NewJob {
    pub fn new(title: impl Into<String>, job_type: JobType) -> Self {
        NewJob {
            title: title.into(),
            job_type,
            body: String::new(),
            depends_on: Vec::new(),
            template: None,
            model: None,
            output: None,
        }
    }
}

/// Create the next `NN-slug.md` file in the plan directory and return the
/// loaded job. Numbering continues from the highest existing ordinal.
pub fn add_job(plan: &Plan, new_job: NewJob) -> Result<Job> {
    let ordinal = next_ordinal(plan);
    let slug = slugify(&new_job.title);
    let id = format!("{slug}-{}", short_suffix());
    let filename = format!("{ordinal:02}-{slug}.md");
    let path = plan.directory.join(&filename);
    if path.exists() {
        return Err(GroveError::other(format!(
            "refusing to overwrite existing job file {filename}"
        )));
    }

    let contents = render_job_file(&id, &new_job)?;
    fs::write(&path, contents)?;
    job::load_job(&path)
}

fn next_ordinal(plan: &Plan) -> u32 {
    plan.jobs
        .iter()
        .filter_map(|job| job.filename.get(0..2))
        .filter_map(|prefix| prefix.parse::<u32>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}

pub fn render_job_file(id: &str, new_job: &NewJob) -> Result<String> {
    let mut mapping = Mapping::new();
    let mut put = |key: &str, value: Value| {
        mapping.insert(Value::String(key.to_string()), value);
    };
    put("id", Value::String(id.to_string()));
    put("title", Value::String(new_job.title.clone()));
    put("status", Value::String(JobStatus::Pending.as_str().to_string()));
    put("type", Value::String(new_job.job_type.as_str().to_string()));
    if !new_job.depends_on.is_empty() {
        put(
            "depends_on",
            Value::Sequence(
                new_job
                    .depends_on
                    .iter()
                    .map(|dep| Value::String(dep.clone()))
                    .collect(),
            ),
        );
    }
    if let Some(template) = &new_job.template {
        put("template", Value::String(template.clone()));
    }
    if let Some(model) = &new_job.model {
        put("model", Value::String(model.clone()));
    }
    if let Some(output) = &new_job.output {
        put("output", serde_yaml::to_value(output)?);
    }
    put("created_at", Value::String(Utc::now().to_rfc3339()));

    let body = if new_job.body.is_empty() {
        String::new()
    } else if new_job.body.ends_with('\n') {
        format!("\n{}", new_job.body)
    } else {
        format!("\n{}\n", new_job.body)
    };
    frontmatter::render(&mapping, &body)
}

/// Rename a job: new slug in the filename (ordinal preserved), new title
/// in the frontmatter, and every other job's `depends_on` reference to the
/// old filename rewritten to the new one.
pub fn rename_job(plan: &Plan, job_id: &str, new_title: &str) -> Result<PathBuf> {
    let job = plan
        .job(job_id)
        .ok_or_else(|| GroveError::other(format!("no job with id `{job_id}`")))?;

    let ordinal = job
        .filename
        .get(0..2)
        .unwrap_or("01")
        .to_string();
    let old_filename = job.filename.clone();
    let new_filename = format!("{ordinal}-{}.md", slugify(new_title));
    let new_path = plan.directory.join(&new_filename);
    if new_filename != old_filename && new_path.exists() {
        return Err(GroveError::other(format!(
            "refusing to overwrite existing job file {new_filename}"
        )));
    }

    // Rewrite the renamed job's own title first.
    let bytes = fs::read(&job.file_path)?;
    let mut updates = Mapping::new();
    updates.insert(
        Value::String("title".into()),
        Value::String(new_title.to_string()),
    );
    updates.insert(
        Value::String("updated_at".into()),
        Value::String(Utc::now().to_rfc3339()),
    );
    let rewritten = frontmatter::merge_buffer(&bytes, updates)?;
    fs::write(&job.file_path, rewritten)?;

    if new_filename != old_filename {
        fs::rename(&job.file_path, &new_path)?;

        for other in &plan.jobs {
            if other.id == job_id || !other.depends_on.iter().any(|dep| dep == &old_filename) {
                continue;
            }
            let bytes = fs::read(&other.file_path)?;
            let (mut mapping, body) = frontmatter::parse(&bytes)?;
            let key = Value::String("depends_on".into());
            if let Some(Value::Sequence(deps)) = mapping.get_mut(&key) {
                for dep in deps.iter_mut() {
                    if dep.as_str() == Some(old_filename.as_str()) {
                        *dep = Value::String(new_filename.clone());
                    }
                }
            } else if let Some(Value::String(dep)) = mapping.get_mut(&key)
                && *dep == old_filename
            {
                *dep = new_filename.clone();
            }
            fs::write(&other.file_path, frontmatter::render(&mapping, &body)?)?;
        }
    }

    Ok(new_path)
}

pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut previous_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            previous_dash = false;
        } else if !previous_dash && !slug.is_empty() {
            slug.push('-');
            previous_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() { "job".to_string() } else { slug }
}

/// Short random suffix appended to generated job ids so slugs never
/// collide across regenerated plans.
pub fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}
