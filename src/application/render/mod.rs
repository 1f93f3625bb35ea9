//! The versioned render pipeline.
//!
//! Submissions are recorded as pending and handed to a background worker,
//! which renders the uploaded project inside the post's shared working tree
//! while holding that post's lock. Queries take the same lock, check the
//! revision out and read what the last successful run committed.

mod context;
mod jobs;
mod lifecycle;
mod project;
mod query;
mod runtime;
mod toolchain;
mod types;

pub use context::{RenderContext, SourcePolicies};
pub use jobs::{
    RenderOrchestrator, RenderQueue, RenderWorker, process_render_job, spawn_render_worker,
    wait_for_render,
};
pub use lifecycle::PostLifecycle;
pub use project::{
    CONFIG_FILES, DEPENDENCY_BOOTSTRAP, DEPENDENCY_LOCKFILE, ProjectConfig, ProjectError,
    validate_project,
};
pub use query::RenderQueryService;
pub use runtime::{LockError, MemoryWorktreeLocks, WorktreeGuard, WorktreeLocks};
pub use toolchain::{
    DependencyInstaller, QuartoToolchain, RENDER_PACKAGES, RenderToolchain, RscriptInstaller,
    ToolchainError,
};
pub use types::{
    Artifact, ArtifactLookup, BlockingTaskError, PipelineError, RenderJob, RenderReport,
    RenderServiceError, UploadedArchive,
};
