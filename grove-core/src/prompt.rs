use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use git2::{Repository, StatusOptions};
use tracing::debug;
use uuid::Uuid;

use crate::backend::TemplateStore;
use crate::chat::{self, escape_xml};
use crate::error::{GroveError, Result};
use crate::frontmatter;
use crate::job::Job;
use crate::plan::Plan;

/// Files longer than this are referenced with a nudge toward grep-style
/// access instead of a full read.
const LARGE_FILE_LINES: usize = 5_000;

pub const CONTEXT_DIR: &str = ".grove/context";
pub const CLAUDE_FILE: &str = "CLAUDE.md";

/// The assembled prompt: a briefing document for the backend plus the
/// attachment paths that travel beside it.
#[derive(Debug, Clone)]
pub struct Briefing {
    pub xml: String,
    pub files_to_upload: Vec<PathBuf>,
}

/// Fresh 6-hex turn identifier. One id per chat turn, used for both the
/// briefing artifact filename and the appended assistant directive.
pub fn new_turn_id() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}

pub struct PromptAssembler<'a> {
    pub plan: &'a Plan,
    pub templates: &'a dyn TemplateStore,
}

impl<'a> PromptAssembler<'a> {
    pub fn new(plan: &'a Plan, templates: &'a dyn TemplateStore) -> Self {
        PromptAssembler { plan, templates }
    }

    /// Build the briefing for a non-chat job: template instructions,
    /// context section, and the job body as the user request.
    pub fn assemble(&self, job: &Job, work_dir: &Path) -> Result<Briefing> {
        let body = job.prompt_body.trim();
        let request = (!body.is_empty())
            .then(|| format!("  <user_request priority=\"high\">{}</user_request>\n", escape_xml(body)));
        self.build(job, work_dir, request.as_deref())
    }

    /// Build the briefing for one chat turn. The conversation XML takes
    /// the place of the user request.
    pub fn assemble_conversation(
        &self,
        job: &Job,
        work_dir: &Path,
        conversation_xml: &str,
    ) -> Result<Briefing> {
        let request = indent(conversation_xml, "  ");
        self.build(job, work_dir, Some(&request))
    }

    fn build(&self, job: &Job, work_dir: &Path, request: Option<&str>) -> Result<Briefing> {
        let mut files_to_upload = Vec::new();
        let mut xml = String::from("<prompt>\n");

        if let Some(name) = &job.template {
            let template = self.templates.find_template(name)?;
            let _ = writeln!(
                xml,
                "  <system_instructions template=\"{}\">{}</system_instructions>",
                escape_xml(name),
                escape_xml(template.prompt.trim()),
            );
        }

        xml.push_str("  <context>\n");
        if let Some(changes) = git_changes(work_dir) {
            let _ = writeln!(xml, "    <git_changes>{}</git_changes>", escape_xml(&changes));
        }
        self.push_dependencies(job, &mut xml, &mut files_to_upload)?;
        self.push_source_files(job, work_dir, &mut xml, &mut files_to_upload)?;
        self.push_source_block(job, &mut xml)?;
        self.push_context_files(job, work_dir, &mut xml, &mut files_to_upload)?;
        xml.push_str("  </context>\n");

        if let Some(request) = request {
            xml.push_str(request);
            if !request.ends_with('\n') {
                xml.push('\n');
            }
        }
        xml.push_str("</prompt>\n");

        Ok(Briefing {
            xml,
            files_to_upload,
        })
    }

    fn prepend_dependencies(&self, job: &Job) -> bool {
        job.prepend_dependencies
            .or(self.plan.config.prepend_dependencies)
            .unwrap_or(false)
    }

    fn push_dependencies(
        &self,
        job: &Job,
        xml: &mut String,
        files_to_upload: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let prepend = self.prepend_dependencies(job);
        for slot in &job.dependencies {
            let Some(dep_id) = slot else {
                // unresolved slots block runnability upstream; nothing to
                // reference here
                continue;
            };
            let Some(dep) = self.plan.job(dep_id) else {
                continue;
            };

            if prepend {
                let _ = writeln!(
                    xml,
                    "    <prepended_dependency file=\"{}\">{}</prepended_dependency>",
                    escape_xml(&dep.filename),
                    escape_xml(dep.prompt_body.trim()),
                );
                continue;
            }

            let description = dep.summary.as_deref().unwrap_or(&dep.title);
            if job.job_type.is_agent_family() {
                let _ = writeln!(
                    xml,
                    "    <local_dependency file=\"{}\" path=\"{}\" n_lines=\"{}\" description=\"{}\"/>",
                    escape_xml(&dep.filename),
                    escape_xml(&dep.file_path.display().to_string()),
                    dep.prompt_body.lines().count(),
                    escape_xml(description),
                );
            } else {
                let _ = writeln!(
                    xml,
                    "    <inlined_dependency file=\"{}\" description=\"{}\"/>",
                    escape_xml(&dep.filename),
                    escape_xml(description),
                );
            }
            files_to_upload.push(dep.file_path.clone());
        }
        Ok(())
    }

    fn push_source_files(
        &self,
        job: &Job,
        work_dir: &Path,
        xml: &mut String,
        files_to_upload: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let Some(sources) = &job.prompt_source else {
            return Ok(());
        };
        for source in sources.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let path = resolve_relative(source, work_dir, &self.plan.directory);
            if !path.is_file() {
                return Err(GroveError::other(format!(
                    "prompt_source `{source}` does not exist"
                )));
            }
            push_file_reference(
                xml,
                files_to_upload,
                &path,
                source,
                job.job_type.is_agent_family(),
                "source_file",
                "prompt source",
            )?;
        }
        Ok(())
    }

    /// `source_block: path#id1,id2` pulls tagged blocks out of a chat
    /// file; the blocks are inlined joined by a divider. A missing block
    /// id fails assembly.
    fn push_source_block(&self, job: &Job, xml: &mut String) -> Result<()> {
        let Some(reference) = &job.source_block else {
            return Ok(());
        };
        let (path_part, ids_part) = reference.split_once('#').ok_or_else(|| {
            GroveError::other(format!(
                "source_block `{reference}` must look like path#id1,id2"
            ))
        })?;
        let ids: Vec<&str> = ids_part
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect();
        if ids.is_empty() {
            return Err(GroveError::other(format!(
                "source_block `{reference}` names no block ids"
            )));
        }

        let path = resolve_relative(path_part, &self.plan.directory, &self.plan.directory);
        let bytes = fs::read(&path)?;
        let (_, body) = frontmatter::parse(&bytes)?;
        let blocks = chat::extract_blocks(&body, &ids)?;

        let _ = writeln!(
            xml,
            "    <inlined_source_block from_file=\"{}\" blocks=\"{}\">{}</inlined_source_block>",
            escape_xml(path_part),
            escape_xml(&ids.join(",")),
            escape_xml(&blocks.join("\n\n---\n\n")),
        );
        Ok(())
    }

    fn push_context_files(
        &self,
        job: &Job,
        work_dir: &Path,
        xml: &mut String,
        files_to_upload: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for path in find_context_files(work_dir) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            push_file_reference(
                xml,
                files_to_upload,
                &path,
                &name,
                job.job_type.is_agent_family(),
                "context_file",
                "project context",
            )?;
        }
        Ok(())
    }
}

/// Shared rendering for source and context references: agent-family jobs
/// get `local_*` elements (the agent reads from its working tree), other
/// jobs get `inlined_*`; both push onto the upload list.
fn push_file_reference(
    xml: &mut String,
    files_to_upload: &mut Vec<PathBuf>,
    path: &Path,
    label: &str,
    agent_family: bool,
    element_suffix: &str,
    kind: &str,
) -> Result<()> {
    let contents = fs::read_to_string(path)?;
    let n_lines = contents.lines().count();
    let description = if n_lines > LARGE_FILE_LINES {
        format!("{kind}; large file ({n_lines} lines), prefer grep-style targeted reads over reading it whole")
    } else {
        kind.to_string()
    };

    if agent_family {
        let _ = writeln!(
            xml,
            "    <local_{element_suffix} file=\"{}\" path=\"{}\" n_lines=\"{n_lines}\" description=\"{}\"/>",
            escape_xml(label),
            escape_xml(&path.display().to_string()),
            escape_xml(&description),
        );
    } else {
        let _ = writeln!(
            xml,
            "    <inlined_{element_suffix} file=\"{}\" description=\"{}\"/>",
            escape_xml(label),
            escape_xml(&description),
        );
    }
    files_to_upload.push(path.to_path_buf());
    Ok(())
}

/// Context files the backend should always see: everything under
/// `.grove/context/` plus a root `CLAUDE.md`, in stable order.
pub fn find_context_files(work_dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let context_dir = work_dir.join(CONTEXT_DIR);
    if let Ok(entries) = fs::read_dir(&context_dir) {
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        found.extend(files);
    }
    let claude = work_dir.join(CLAUDE_FILE);
    if claude.is_file() {
        found.push(claude);
    }
    found
}

fn resolve_relative(value: &str, primary: &Path, fallback: &Path) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let candidate = primary.join(path);
    if candidate.exists() {
        candidate
    } else {
        fallback.join(path)
    }
}

/// A short dirty-tree summary for the context section; absent when the
/// working directory is clean or not a repository.
fn git_changes(work_dir: &Path) -> Option<String> {
    let repo = Repository::discover(work_dir).ok()?;
    let mut options = StatusOptions::new();
    options.include_untracked(true);
    let statuses = repo.statuses(Some(&mut options)).ok()?;
    if statuses.is_empty() {
        return None;
    }
    let mut lines = Vec::new();
    for entry in statuses.iter() {
        let status = entry.status();
        let tag = if status.is_wt_new() || status.is_index_new() {
            "A"
        } else if status.is_wt_deleted() || status.is_index_deleted() {
            "D"
        } else {
            "M"
        };
        if let Some(path) = entry.path() {
            lines.push(format!("{tag} {path}"));
        }
    }
    if lines.is_empty() {
        debug!(dir = %work_dir.display(), "git status reported entries without paths");
        return None;
    }
    Some(lines.join("\n"))
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticTemplateStore;
    use std::fs;

    fn templates() -> StaticTemplateStore {
        let mut store = StaticTemplateStore::new();
        store.insert("builder", "You build things carefully.");
        store
    }

    fn write_plan(dir: &Path, files: &[(&str, &str)]) -> Plan {
        for (name, contents) in files {
            fs::write(dir.join(name), contents).unwrap();
        }
        crate::plan::load_plan(dir).unwrap()
    }

    #[test]
    fn briefing_carries_template_and_request() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(
            dir.path(),
            &[(
                "01-a.md",
                "---\nid: a\ntitle: A\nstatus: pending\ntype: oneshot\ntemplate: builder\n---\nBuild it.\n",
            )],
        );
        let store = templates();
        let assembler = PromptAssembler::new(&plan, &store);

        let briefing = assembler
            .assemble(plan.job("a").unwrap(), dir.path())
            .unwrap();
        assert!(briefing.xml.starts_with("<prompt>"));
        assert!(briefing.xml.contains(
            "<system_instructions template=\"builder\">You build things carefully.</system_instructions>"
        ));
        assert!(briefing.xml.contains("<user_request priority=\"high\">Build it.</user_request>"));
        assert!(briefing.files_to_upload.is_empty());
    }

    #[test]
    fn unknown_template_fails_assembly() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(
            dir.path(),
            &[(
                "01-a.md",
                "---\nid: a\ntitle: A\nstatus: pending\ntype: oneshot\ntemplate: ghost\n---\n",
            )],
        );
        let store = templates();
        let assembler = PromptAssembler::new(&plan, &store);
        assert!(assembler.assemble(plan.job("a").unwrap(), dir.path()).is_err());
    }

    #[test]
    fn prepended_dependencies_inline_without_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(
            dir.path(),
            &[
                (
                    "01-a.md",
                    "---\nid: a\ntitle: A\nstatus: completed\ntype: oneshot\n---\nupstream findings\n",
                ),
                (
                    "02-b.md",
                    "---\nid: b\ntitle: B\nstatus: pending\ntype: oneshot\ndepends_on: [a]\nprepend_dependencies: true\n---\nuse them\n",
                ),
            ],
        );
        let store = templates();
        let assembler = PromptAssembler::new(&plan, &store);

        let briefing = assembler
            .assemble(plan.job("b").unwrap(), dir.path())
            .unwrap();
        assert!(briefing.xml.contains(
            "<prepended_dependency file=\"01-a.md\">upstream findings</prepended_dependency>"
        ));
        assert!(briefing.files_to_upload.is_empty());
    }

    #[test]
    fn dependency_references_vary_by_job_family() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(
            dir.path(),
            &[
                (
                    "01-a.md",
                    "---\nid: a\ntitle: Findings\nstatus: completed\ntype: oneshot\n---\nfindings\n",
                ),
                (
                    "02-b.md",
                    "---\nid: b\ntitle: B\nstatus: pending\ntype: oneshot\ndepends_on: [a]\n---\n",
                ),
                (
                    "03-c.md",
                    "---\nid: c\ntitle: C\nstatus: pending\ntype: headless_agent\ndepends_on: [a]\n---\n",
                ),
            ],
        );
        let store = templates();
        let assembler = PromptAssembler::new(&plan, &store);

        let oneshot = assembler.assemble(plan.job("b").unwrap(), dir.path()).unwrap();
        assert!(oneshot.xml.contains("<inlined_dependency file=\"01-a.md\""));
        assert_eq!(oneshot.files_to_upload.len(), 1);

        let agent = assembler.assemble(plan.job("c").unwrap(), dir.path()).unwrap();
        assert!(agent.xml.contains("<local_dependency file=\"01-a.md\""));
        assert!(agent.xml.contains("n_lines=\"1\""));
        assert_eq!(agent.files_to_upload.len(), 1);
    }

    #[test]
    fn source_block_inlines_matching_turns() {
        let dir = tempfile::tempdir().unwrap();
        let chat_body = "---\nid: talk\ntitle: Talk\nstatus: pending_user\ntype: chat\n---\nintro\n\n<!-- grove: {\"id\":\"blk1\"} -->\n\nalpha findings\n\n<!-- grove: {\"id\":\"blk2\"} -->\n\nbeta findings\n";
        let plan = write_plan(
            dir.path(),
            &[
                ("01-talk.md", chat_body),
                (
                    "02-b.md",
                    "---\nid: b\ntitle: B\nstatus: pending\ntype: oneshot\nsource_block: \"01-talk.md#blk1,blk2\"\n---\n",
                ),
            ],
        );
        let store = templates();
        let assembler = PromptAssembler::new(&plan, &store);

        let briefing = assembler.assemble(plan.job("b").unwrap(), dir.path()).unwrap();
        assert!(briefing.xml.contains("alpha findings\n\n---\n\nbeta findings"));

        // missing block id fails the assembly
        let plan2 = write_plan(
            dir.path(),
            &[(
                "03-c.md",
                "---\nid: c\ntitle: C\nstatus: pending\ntype: oneshot\nsource_block: \"01-talk.md#nope\"\n---\n",
            )],
        );
        let assembler2 = PromptAssembler::new(&plan2, &store);
        assert!(assembler2.assemble(plan2.job("c").unwrap(), dir.path()).is_err());
    }

    #[test]
    fn context_files_are_discovered_and_nudged_when_large() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(CONTEXT_DIR)).unwrap();
        fs::write(dir.path().join(CONTEXT_DIR).join("arch.md"), "notes\n").unwrap();
        fs::write(dir.path().join(CLAUDE_FILE), "claude notes\n").unwrap();
        let big = "line\n".repeat(LARGE_FILE_LINES + 1);
        fs::write(dir.path().join(CONTEXT_DIR).join("big.md"), big).unwrap();

        let plan = write_plan(
            dir.path(),
            &[(
                "01-a.md",
                "---\nid: a\ntitle: A\nstatus: pending\ntype: oneshot\n---\n",
            )],
        );
        let store = templates();
        let assembler = PromptAssembler::new(&plan, &store);
        let briefing = assembler.assemble(plan.job("a").unwrap(), dir.path()).unwrap();

        assert!(briefing.xml.contains("arch.md"));
        assert!(briefing.xml.contains("CLAUDE.md"));
        assert!(briefing.xml.contains("prefer grep-style targeted reads"));
        assert_eq!(briefing.files_to_upload.len(), 3);
    }

    #[test]
    fn conversation_briefing_embeds_the_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(
            dir.path(),
            &[(
                "01-talk.md",
                "---\nid: talk\ntitle: Talk\nstatus: pending_user\ntype: chat\n---\nhello\n",
            )],
        );
        let store = templates();
        let assembler = PromptAssembler::new(&plan, &store);

        let turns = chat::parse_conversation("hello\n");
        let conversation = chat::format_conversation_xml(&turns);
        let briefing = assembler
            .assemble_conversation(plan.job("talk").unwrap(), dir.path(), &conversation)
            .unwrap();
        assert!(briefing.xml.contains("<conversation>"));
        assert!(briefing.xml.contains("hello"));
        assert!(!briefing.xml.contains("<user_request"));
    }

    #[test]
    fn turn_ids_are_six_hex_characters() {
        let id = new_turn_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(new_turn_id(), id);
    }
}
