use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use grove_core::backend::CompletionBackend;
use grove_core::graph::DependencyGraph;
use grove_core::orchestrator::Orchestrator;
use grove_core::persist::StatePersister;
use grove_core::plan::{self, NewJob};
use tracing_subscriber::EnvFilter;

use crate::backend::CommandBackend;
use crate::cli::args::{Cli, Commands};
use crate::templates::FsTemplateStore;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Commands::Init { dir, spec } => {
            plan::init_plan(&dir, spec.as_deref())?;
            println!("initialized plan at {}", dir.display());
            Ok(())
        }

        Commands::Add {
            plan: plan_dir,
            title,
            job_type,
            body,
            depends_on,
            template,
            model,
        } => {
            let loaded = plan::load_plan(&plan_dir)?;
            let body = match body {
                Some(body) => body,
                None => read_piped_stdin(),
            };
            let mut new_job = NewJob::new(title, job_type.into());
            new_job.body = body;
            new_job.depends_on = depends_on;
            new_job.template = template;
            new_job.model = model;
            let job = plan::add_job(&loaded, new_job)?;
            println!("created {} (id {})", job.filename, job.id);
            Ok(())
        }

        Commands::Run {
            plan: plan_dir,
            job,
            next,
            max_parallel,
            timeout,
        } => {
            let orchestrator = build_orchestrator(&plan_dir, max_parallel, timeout);
            if let Some(job_file) = job {
                orchestrator.run_job(&job_file).await?;
                println!("ran {}", job_file.display());
            } else if next {
                match orchestrator.run_next().await? {
                    Some(id) => println!("ran {id}"),
                    None => println!("nothing runnable"),
                }
            } else {
                orchestrator.run_all().await?;
                println!("plan complete");
            }
            Ok(())
        }

        Commands::Status {
            plan: plan_dir,
            json,
        } => {
            let loaded = plan::load_plan(&plan_dir)?;
            let status = grove_core::orchestrator::plan_status(&loaded);
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "total": status.total,
                        "pending": status.pending,
                        "running": status.running,
                        "completed": status.completed,
                        "failed": status.failed,
                        "blocked": status.blocked,
                        "progress": status.progress,
                    })
                );
            } else {
                println!(
                    "{}: {}/{} completed ({:.0}%), {} pending, {} blocked, {} running, {} failed",
                    loaded.name,
                    status.completed,
                    status.total,
                    status.progress,
                    status.pending,
                    status.blocked,
                    status.running,
                    status.failed,
                );
            }
            Ok(())
        }

        Commands::Graph { plan: plan_dir } => {
            let loaded = plan::load_plan(&plan_dir)?;
            print!("{}", DependencyGraph::build(&loaded).to_mermaid());
            Ok(())
        }

        Commands::Validate { plan: plan_dir } => {
            let loaded = plan::load_plan(&plan_dir)?;
            let persister = StatePersister::new();
            let problems = persister.validate_job_states(&loaded)?;
            if problems.is_empty() {
                println!("{} job(s) healthy", loaded.jobs.len());
                Ok(())
            } else {
                for problem in &problems {
                    eprintln!("{problem}");
                }
                Err(format!("{} problem(s) found", problems.len()).into())
            }
        }

        Commands::Rename {
            plan: plan_dir,
            job_id,
            title,
        } => {
            let loaded = plan::load_plan(&plan_dir)?;
            let new_path = plan::rename_job(&loaded, &job_id, &title)?;
            println!("renamed {job_id} -> {}", new_path.display());
            Ok(())
        }
    }
}

fn build_orchestrator(
    plan_dir: &Path,
    max_parallel: Option<usize>,
    timeout: Option<u64>,
) -> Orchestrator {
    let backend = Arc::new(CommandBackend::from_env()) as Arc<dyn CompletionBackend>;
    let templates = Arc::new(FsTemplateStore::for_plan(plan_dir));
    let mut orchestrator = Orchestrator::new(plan_dir, backend, templates);
    if let Some(jobs) = max_parallel {
        orchestrator = orchestrator.with_max_parallel_jobs(jobs);
    }
    if let Some(secs) = timeout {
        orchestrator = orchestrator.with_job_timeout(Duration::from_secs(secs));
    }
    orchestrator
}

fn read_piped_stdin() -> String {
    use std::io::IsTerminal;
    if std::io::stdin().is_terminal() {
        return String::new();
    }
    let mut body = String::new();
    let _ = std::io::stdin().read_to_string(&mut body);
    body
}

fn init_tracing(cli: &Cli) {
    let level = if cli.global.quiet {
        "warn"
    } else {
        match cli.global.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("grove={level},grove_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
