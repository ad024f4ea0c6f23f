use std::fs;
use std::io;
use std::path::PathBuf;

use grove_core::backend::{Template, TemplateStore};
use grove_core::error::{GroveError, Result};

const TEMPLATE_RELATIVE_DIR: &str = ".grove/templates";

const DEFAULT_TEMPLATE: &str = "\
You are a careful software collaborator working inside a plan of jobs.
Read the briefing's context section before acting, keep changes scoped to
the current job, and state what you did and why in your response.
";

/// Templates live as Markdown files under `.grove/templates/` in the plan
/// directory; `default` falls back to a built-in prompt when no file
/// overrides it.
pub struct FsTemplateStore {
    directory: PathBuf,
}

impl FsTemplateStore {
    pub fn for_plan(plan_dir: &std::path::Path) -> Self {
        FsTemplateStore {
            directory: plan_dir.join(TEMPLATE_RELATIVE_DIR),
        }
    }
}

impl TemplateStore for FsTemplateStore {
    fn find_template(&self, name: &str) -> Result<Template> {
        let path = self.directory.join(format!("{name}.md"));
        match fs::read_to_string(&path) {
            Ok(prompt) => Ok(Template {
                name: name.to_string(),
                prompt,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound && name == "default" => {
                Ok(Template {
                    name: name.to_string(),
                    prompt: DEFAULT_TEMPLATE.to_string(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(GroveError::other(format!(
                "unknown template `{name}` (no {})",
                path.display()
            ))),
            Err(err) => Err(err.into()),
        }
    }
}
