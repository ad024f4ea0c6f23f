use std::path::PathBuf;

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand, ValueEnum};
use grove_core::job::JobType;

/// A file-backed job orchestrator for LLM-assisted software work.
#[derive(Parser, Debug)]
#[command(
    name = "grove",
    version,
    about,
    disable_help_subcommand = true,
    arg_required_else_help = true,
    propagate_version = true
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) global: GlobalOpts,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(ClapArgs, Debug, Default)]
pub(crate) struct GlobalOpts {
    /// Increase stderr verbosity (`-v` = debug, `-vv` = trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    /// Silence everything below warnings
    #[arg(short = 'q', long, global = true)]
    pub(crate) quiet: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum JobTypeArg {
    Oneshot,
    Agent,
    HeadlessAgent,
    InteractiveAgent,
    Shell,
    Chat,
    GenerateRecipe,
}

impl From<JobTypeArg> for JobType {
    fn from(value: JobTypeArg) -> Self {
        match value {
            JobTypeArg::Oneshot => JobType::Oneshot,
            JobTypeArg::Agent => JobType::Agent,
            JobTypeArg::HeadlessAgent => JobType::HeadlessAgent,
            JobTypeArg::InteractiveAgent => JobType::InteractiveAgent,
            JobTypeArg::Shell => JobType::Shell,
            JobTypeArg::Chat => JobType::Chat,
            JobTypeArg::GenerateRecipe => JobType::GenerateRecipe,
        }
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Materialize a plan directory
    Init {
        /// Directory to create
        dir: PathBuf,
        /// Operator spec to copy in as spec.md
        #[arg(long)]
        spec: Option<PathBuf>,
    },

    /// Create the next NN-slug.md job file in a plan
    Add {
        /// Plan directory
        plan: PathBuf,
        /// Job title; also seeds the slug and id
        #[arg(long)]
        title: String,
        /// Executor type for the job
        #[arg(long = "type", value_enum, default_value = "oneshot")]
        job_type: JobTypeArg,
        /// Prompt body (reads stdin when omitted and stdin is piped)
        #[arg(long)]
        body: Option<String>,
        /// Dependency references (job ids or filenames), comma separated
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },

    /// Run jobs: the whole plan, one file, or the next runnable job
    Run {
        /// Plan directory
        plan: PathBuf,
        /// Run exactly this job file and stop
        #[arg(long, conflicts_with = "next")]
        job: Option<PathBuf>,
        /// Run a single runnable job and stop
        #[arg(long)]
        next: bool,
        /// Cap on concurrently dispatched jobs
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Per-job deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Progress summary for a plan
    Status {
        plan: PathBuf,
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the dependency graph as a Mermaid diagram
    Graph { plan: PathBuf },

    /// Check every job file for parse and state problems
    Validate { plan: PathBuf },

    /// Retitle a job, renaming its file and rewriting references
    Rename {
        plan: PathBuf,
        /// Id of the job to rename
        job_id: String,
        /// New title
        title: String,
    },
}
