use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    application::repos::RepoError,
    domain::{
        error::DomainError,
        types::{PostId, RevisionId},
    },
    infra::{git::RevisionControlError, worktree::WorktreeError},
};

use super::{project::ProjectError, runtime::LockError, toolchain::ToolchainError};

/// An uploaded project archive (gzip-compressed tarball), already received in
/// full by the transport layer.
#[derive(Debug, Clone)]
pub struct UploadedArchive {
    pub file_name: String,
    pub data: Bytes,
}

impl UploadedArchive {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
        }
    }
}

/// One queued render run.
///
/// The archive travels inline: it is only written into the working tree once
/// the run holds the post's lock.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub run_id: Uuid,
    pub post_id: PostId,
    pub revision: RevisionId,
    pub archive: UploadedArchive,
}

/// What a successful run left behind.
#[derive(Debug, Clone)]
pub struct RenderReport {
    pub commit: String,
    pub artifact: String,
    pub source_files: usize,
}

/// The rendered artifact of a revision, valid while no newer run replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

/// Result of asking for a revision's artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLookup {
    Ready(Artifact),
    /// A render run has not reached a terminal state yet; ask again later.
    Pending,
}

/// Failure of one render run. Never surfaced to the submitter: the run
/// records it as the revision's `Failure` status instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("project validation failed: {reason}")]
    Validation { reason: String },
    #[error("dependency installation failed")]
    DependencyInstall {
        #[source]
        source: ToolchainError,
    },
    #[error("render toolchain failed")]
    RenderExecution {
        #[source]
        source: ToolchainError,
    },
    #[error("expected exactly one rendered artifact, found {found}")]
    ArtifactVerification { found: usize },
    #[error("repository operation failed")]
    Repository(#[from] RevisionControlError),
    #[error("working tree operation failed")]
    Storage(#[source] WorktreeError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("render status could not be persisted")]
    Persistence(#[from] RepoError),
    #[error("blocking task failed: {0}")]
    Task(#[from] BlockingTaskError),
}

impl PipelineError {
    /// Short label for logs and metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Validation { .. } => "validation",
            PipelineError::DependencyInstall { .. } => "dependency_install",
            PipelineError::RenderExecution { .. } => "render_execution",
            PipelineError::ArtifactVerification { .. } => "artifact_verification",
            PipelineError::Repository(_) => "repository",
            PipelineError::Storage(_) => "storage",
            PipelineError::Lock(_) => "lock",
            PipelineError::Persistence(_) => "persistence",
            PipelineError::Task(_) => "task",
        }
    }
}

impl From<WorktreeError> for PipelineError {
    fn from(err: WorktreeError) -> Self {
        if err.is_validation() {
            PipelineError::Validation {
                reason: err.to_string(),
            }
        } else {
            PipelineError::Storage(err)
        }
    }
}

impl From<ProjectError> for PipelineError {
    fn from(err: ProjectError) -> Self {
        match err {
            ProjectError::Io(source) => PipelineError::Storage(WorktreeError::Io(source)),
            other => PipelineError::Validation {
                reason: other.to_string(),
            },
        }
    }
}

/// A closure handed to the blocking pool panicked or was cancelled.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BlockingTaskError(pub String);

/// Errors raised synchronously by the submission, query and lifecycle surfaces.
#[derive(Debug, Error)]
pub enum RenderServiceError {
    #[error("{entity} `{key}` not found")]
    NotFound { entity: &'static str, key: String },
    #[error("{entity} `{key}` already exists")]
    AlreadyExists { entity: &'static str, key: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("repository operation failed: {0}")]
    Repository(#[from] RevisionControlError),
    #[error("working tree operation failed: {0}")]
    Storage(#[from] WorktreeError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] RepoError),
    #[error("render queue is closed")]
    QueueClosed,
    #[error("timed out after {waited:?} waiting for revision {post_id}/{revision}")]
    WaitTimeout {
        post_id: PostId,
        revision: RevisionId,
        waited: Duration,
    },
    #[error("blocking task failed: {0}")]
    Task(#[from] BlockingTaskError),
}

impl RenderServiceError {
    pub fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl std::fmt::Display) -> Self {
        Self::AlreadyExists {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RenderServiceError::NotFound { .. })
    }
}

impl From<DomainError> for RenderServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound { entity, key } => Self::NotFound { entity, key },
            DomainError::Validation { message } => Self::InvalidInput(message),
        }
    }
}
