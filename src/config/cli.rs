use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::domain::types::{PostId, RevisionId};

pub(crate) const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 1800;

/// Command-line arguments for the pressroom binary.
#[derive(Debug, Parser)]
#[command(
    name = "pressroom",
    version,
    about = "Render uploaded publishing projects inside per-post git working trees"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PRESSROOM_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Create a post's working tree and repository.
    #[command(name = "init-post")]
    InitPost(PostArgs),
    /// Start a proposed revision at the tip of main.
    #[command(name = "create-revision")]
    CreateRevision(RevisionArgs),
    /// Upload a project archive and render it into a revision.
    Submit(Box<SubmitArgs>),
    /// Show a revision's render status.
    Status(RevisionArgs),
    /// Print the path of a revision's rendered artifact.
    Artifact(RevisionArgs),
    /// List the project files of a revision with their sizes.
    Tree(RevisionArgs),
    /// Print one project file of a revision.
    File(FileArgs),
    /// Remove a post's working tree and records.
    #[command(name = "delete-post")]
    DeletePost(PostArgs),
}

#[derive(Debug, Args, Clone)]
pub struct PostArgs {
    /// Post identifier.
    #[arg(value_name = "POST")]
    pub post: PostId,
}

#[derive(Debug, Args, Clone)]
pub struct RevisionArgs {
    /// Post identifier.
    #[arg(value_name = "POST")]
    pub post: PostId,

    /// Revision name; `main` is the published line.
    #[arg(value_name = "REVISION")]
    pub revision: RevisionId,
}

#[derive(Debug, Args, Clone)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub target: RevisionArgs,

    /// Gzip-compressed tarball of the project.
    #[arg(value_name = "ARCHIVE", value_hint = ValueHint::FilePath)]
    pub archive: PathBuf,

    /// Wait for the render to finish and report its final status.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub wait: bool,

    /// Give up waiting after this many seconds.
    #[arg(long = "wait-timeout-seconds", value_name = "SECONDS", default_value_t = DEFAULT_WAIT_TIMEOUT_SECS)]
    pub wait_timeout_seconds: u64,

    #[command(flatten)]
    pub render: RenderOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct FileArgs {
    #[command(flatten)]
    pub target: RevisionArgs,

    /// Path relative to the project root.
    #[arg(value_name = "PATH")]
    pub path: String,
}

/// Overrides accepted by every subcommand.
#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the directory holding post working trees.
    #[arg(long = "storage-root", value_name = "PATH", global = true)]
    pub storage_root: Option<PathBuf>,

    /// Override the revision state file.
    #[arg(long = "state-file", value_name = "PATH", global = true)]
    pub state_file: Option<PathBuf>,

    /// Override the worktree lock backend (memory|file).
    #[arg(long = "lock-backend", value_name = "BACKEND", global = true)]
    pub lock_backend: Option<String>,

    /// Override how long to wait for a worktree lock; 0 waits forever.
    #[arg(long = "lock-timeout-seconds", value_name = "SECONDS", global = true)]
    pub lock_timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the Quarto executable.
    #[arg(long = "render-quarto-path", value_name = "PATH")]
    pub quarto_path: Option<PathBuf>,

    /// Override the Rscript executable used for dependency installation.
    #[arg(long = "render-rscript-path", value_name = "PATH")]
    pub rscript_path: Option<PathBuf>,

    /// Override the per-invocation toolchain timeout; 0 disables it.
    #[arg(long = "render-timeout-seconds", value_name = "SECONDS")]
    pub toolchain_timeout_seconds: Option<u64>,
}
