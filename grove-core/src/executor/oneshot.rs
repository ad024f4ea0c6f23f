use std::collections::HashMap;
use std::fs;

use serde::Deserialize;
use tracing::{debug, info};

use crate::artifacts::ArtifactStore;
use crate::backend::CompletionRequest;
use crate::error::{GroveError, Result};
use crate::executor::{ExecutorContext, Outcome, briefing_timestamp, resolve_model};
use crate::job::{Job, JobType, OutputSpec, OutputType};
use crate::persist::JobLock;
use crate::plan::{self, NewJob};
use crate::prompt::{self, PromptAssembler};
use crate::workdir;

/// One completion call; the response lands under `## Output` and the
/// declared output policy decides what else happens with it.
pub(super) async fn execute(
    ctx: &ExecutorContext,
    lock: &JobLock,
    job: &mut Job,
    artifacts: &ArtifactStore,
) -> std::result::Result<Outcome, GroveError> {
    let work_dir = workdir::resolve_work_dir(job, &ctx.plan)?;
    let assembler = PromptAssembler::new(&ctx.plan, ctx.templates.as_ref());
    let briefing = assembler.assemble(job, &work_dir)?;

    let briefing_path =
        artifacts.write_briefing(&job.id, &briefing_timestamp(), &briefing.xml)?;
    artifacts.append_job_log(
        &job.id,
        &format!("briefing written to {}", briefing_path.display()),
    )?;

    let context_files = prompt::find_context_files(&work_dir);
    let response = ctx
        .backend
        .complete(CompletionRequest {
            job,
            plan: &ctx.plan,
            prompt: &briefing.xml,
            model: resolve_model(job, &ctx.plan),
            work_dir: &work_dir,
            context_files: &context_files,
            prompt_source_files: &briefing.files_to_upload,
        })
        .await
        .map_err(|err| match err {
            GroveError::BackendFailure(_) => err,
            other => GroveError::BackendFailure(other.to_string()),
        })?;

    ctx.persister.append_job_output_locked(lock, job, &response)?;

    match job.output.kind {
        OutputType::File => {
            let path = job.output.path.as_deref().ok_or_else(|| {
                GroveError::other("output.type is `file` but output.path is missing")
            })?;
            let target = work_dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &response)?;
            artifacts.append_job_log(&job.id, &format!("wrote output file {}", target.display()))?;
        }
        OutputType::Commit => {
            // The core never mutates git history; record the intent and
            // leave the commit to the configured hook.
            artifacts.write_metadata(
                &job.id,
                &serde_json::json!({
                    "output": "commit",
                    "message": job.output.message,
                }),
            )?;
            if let Some(hook) = &ctx.plan.config.hooks.on_commit {
                debug!(job = %job.id, hook, "commit output delegated to hook");
            }
        }
        OutputType::GenerateJobs => {
            let created = generate_jobs(&ctx.plan, &response)?;
            info!(job = %job.id, count = created.len(), "generated follow-up jobs");
            artifacts.append_job_log(
                &job.id,
                &format!("generated {} follow-up job file(s)", created.len()),
            )?;
        }
        OutputType::None | OutputType::Default => {}
    }

    Ok(Outcome::Completed)
}

/// One entry of a `generate_jobs` response payload.
#[derive(Debug, Deserialize)]
struct GeneratedJob {
    title: String,
    #[serde(rename = "type")]
    job_type: Option<String>,
    #[serde(default, alias = "body")]
    prompt: String,
    #[serde(default)]
    depends_on: Vec<String>,
    template: Option<String>,
    model: Option<String>,
    output: Option<OutputSpec>,
}

/// Parse the completion response as a JSON array of job definitions and
/// materialize each as the next `NN-slug.md` file. A `depends_on` entry
/// naming another generated job's title resolves to that job's filename;
/// anything else passes through verbatim (it may reference an existing
/// job id).
fn generate_jobs(plan: &crate::plan::Plan, response: &str) -> Result<Vec<String>> {
    let payload = extract_json_array(response)?;
    let definitions: Vec<GeneratedJob> = serde_json::from_str(payload)?;
    if definitions.is_empty() {
        return Ok(Vec::new());
    }

    let next = plan
        .jobs
        .iter()
        .filter_map(|job| job.filename.get(0..2))
        .filter_map(|prefix| prefix.parse::<u32>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1);

    // First pass: fix filenames so titles can be resolved into edges.
    let filenames: HashMap<String, String> = definitions
        .iter()
        .enumerate()
        .map(|(index, def)| {
            let ordinal = next + index as u32;
            let filename = format!("{ordinal:02}-{}.md", plan::slugify(&def.title));
            (def.title.clone(), filename)
        })
        .collect();

    let mut created = Vec::with_capacity(definitions.len());
    for (index, def) in definitions.into_iter().enumerate() {
        let job_type = match &def.job_type {
            None => JobType::Oneshot,
            Some(value) => JobType::parse(value).ok_or_else(|| {
                GroveError::other(format!("generated job `{}` has unknown type `{value}`", def.title))
            })?,
        };
        let depends_on = def
            .depends_on
            .iter()
            .map(|reference| {
                filenames
                    .get(reference)
                    .cloned()
                    .unwrap_or_else(|| reference.clone())
            })
            .collect();

        let ordinal = next + index as u32;
        let filename = format!("{ordinal:02}-{}.md", plan::slugify(&def.title));
        let id = format!("{}-{}", plan::slugify(&def.title), plan::short_suffix());
        let new_job = NewJob {
            title: def.title,
            job_type,
            body: def.prompt,
            depends_on,
            template: def.template,
            model: def.model,
            output: def.output,
        };
        let contents = plan::render_job_file(&id, &new_job)?;
        let path = plan.directory.join(&filename);
        if path.exists() {
            return Err(GroveError::other(format!(
                "generated job collides with existing file {filename}"
            )));
        }
        fs::write(&path, contents)?;
        created.push(filename);
    }
    Ok(created)
}

/// Backends often wrap JSON in prose or a code fence; take the outermost
/// array literal.
fn extract_json_array(response: &str) -> Result<&str> {
    let start = response.find('[').ok_or_else(|| {
        GroveError::other("generate_jobs response contains no JSON array")
    })?;
    let end = response.rfind(']').ok_or_else(|| {
        GroveError::other("generate_jobs response contains no closing bracket")
    })?;
    if end < start {
        return Err(GroveError::other("generate_jobs response is malformed"));
    }
    Ok(&response[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_array_is_extracted_from_prose() {
        let wrapped = "Here you go:\n```json\n[{\"title\":\"A\"}]\n```\nDone.";
        assert_eq!(extract_json_array(wrapped).unwrap(), "[{\"title\":\"A\"}]");
        assert!(extract_json_array("no array here").is_err());
    }

    #[test]
    fn generated_jobs_resolve_titles_to_filenames() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("01-seed.md"),
            "---\nid: seed\ntitle: Seed\nstatus: completed\ntype: oneshot\n---\n",
        )
        .unwrap();
        let plan = crate::plan::load_plan(dir.path()).unwrap();

        let response = r#"[
            {"title": "Write parser", "prompt": "parse"},
            {"title": "Test parser", "prompt": "test", "depends_on": ["Write parser"]}
        ]"#;
        let created = generate_jobs(&plan, response).unwrap();
        assert_eq!(created, vec!["02-write-parser.md", "03-test-parser.md"]);

        let reloaded = crate::plan::load_plan(dir.path()).unwrap();
        assert_eq!(reloaded.jobs.len(), 3);
        let test_job = reloaded
            .job_by_filename("03-test-parser.md")
            .expect("generated job loads");
        assert_eq!(test_job.depends_on, vec!["02-write-parser.md".to_string()]);
        // the edge resolves against the sibling generated job
        let writer = reloaded.job_by_filename("02-write-parser.md").unwrap();
        assert_eq!(test_job.dependencies, vec![Some(writer.id.clone())]);
    }

    #[test]
    fn unknown_generated_type_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("01-seed.md"),
            "---\nid: seed\ntitle: Seed\nstatus: completed\ntype: oneshot\n---\n",
        )
        .unwrap();
        let plan = crate::plan::load_plan(dir.path()).unwrap();

        let response = r#"[{"title": "Bad", "type": "carrier_pigeon"}]"#;
        assert!(generate_jobs(&plan, response).is_err());
    }
}
