use std::fs;

use chrono::Utc;
use tracing::debug;

use crate::artifacts::ArtifactStore;
use crate::backend::CompletionRequest;
use crate::chat::{self, ACTION_COMPLETE};
use crate::error::GroveError;
use crate::executor::{ExecutorContext, Outcome, resolve_model};
use crate::frontmatter;
use crate::job::{Job, JobStatus};
use crate::persist::{self, JobLock};
use crate::prompt::{self, PromptAssembler};
use crate::workdir;

/// Run exactly one chat turn. The dispatch skeleton has already verified
/// the conversation ends in a non-empty user turn (or carries a
/// `complete` action); this builds the conversation briefing, makes one
/// completion call, appends the assistant segment under a fresh 6-hex
/// turn id, and suspends back to `pending_user`. Chat jobs never
/// self-complete without an operator action.
pub(super) async fn execute(
    ctx: &ExecutorContext,
    _lock: &JobLock,
    job: &mut Job,
    artifacts: &ArtifactStore,
) -> std::result::Result<Outcome, GroveError> {
    let turns = chat::parse_conversation(&job.prompt_body);
    let directive = chat::trailing_user_directive(&turns);

    if directive.and_then(|d| d.action.as_deref()) == Some(ACTION_COMPLETE) {
        debug!(job = %job.id, "chat closed by operator action");
        return Ok(Outcome::Completed);
    }

    // The directive on the trailing user turn routes this response: its
    // template names the persona, its model overrides the job's.
    let directive_template = directive
        .and_then(|d| d.template.clone())
        .filter(|t| !t.is_empty() && t != "default");
    let template = directive_template.or_else(|| job.template.clone());
    let directive_model = directive.and_then(|d| d.model.clone());

    let work_dir = workdir::resolve_work_dir(job, &ctx.plan)?;
    let turn_id = prompt::new_turn_id();
    let conversation = chat::format_conversation_xml(&turns);

    let mut briefing_subject = job.clone();
    briefing_subject.template = template.clone();
    let assembler = PromptAssembler::new(&ctx.plan, ctx.templates.as_ref());
    let briefing = assembler.assemble_conversation(&briefing_subject, &work_dir, &conversation)?;

    // Briefing filename and embedded directive share the turn id; the
    // audit trail is bidirectional.
    artifacts.write_briefing(&job.id, &turn_id, &briefing.xml)?;

    let context_files = prompt::find_context_files(&work_dir);
    let response = ctx
        .backend
        .complete(CompletionRequest {
            job,
            plan: &ctx.plan,
            prompt: &briefing.xml,
            model: directive_model
                .as_deref()
                .or_else(|| resolve_model(job, &ctx.plan)),
            work_dir: &work_dir,
            context_files: &context_files,
            prompt_source_files: &briefing.files_to_upload,
        })
        .await
        .map_err(|err| match err {
            GroveError::BackendFailure(_) | GroveError::Canceled => err,
            other => GroveError::BackendFailure(other.to_string()),
        })?;

    let segment = chat::render_assistant_segment(
        &turn_id,
        &response,
        Utc::now(),
        template.as_deref().unwrap_or("default"),
    );
    append_segment(job, &segment)?;
    artifacts.append_job_log(&job.id, &format!("appended assistant turn {turn_id}"))?;

    Ok(Outcome::Suspended(JobStatus::PendingUser))
}

fn append_segment(job: &mut Job, segment: &str) -> std::result::Result<(), GroveError> {
    let bytes = fs::read(&job.file_path)?;
    let (mapping, mut body) = frontmatter::parse(&bytes)?;
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(segment);
    let rewritten = frontmatter::render(&mapping, &body)?;
    persist::atomic_write(&job.file_path, rewritten.as_bytes())?;
    job.prompt_body = body;
    Ok(())
}
