//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entities::{PostRecord, RevisionRecord};
use crate::domain::types::{PostId, RenderStatus, RevisionId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record `{key}`")]
    Duplicate { key: String },
    #[error("resource not found")]
    NotFound,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Storage for posts and their revisions, as far as the render core needs it.
#[async_trait]
pub trait RevisionsRepo: Send + Sync {
    async fn find_post(&self, id: PostId) -> Result<Option<PostRecord>, RepoError>;

    async fn insert_post(&self, post: PostRecord) -> Result<PostRecord, RepoError>;

    async fn delete_post(&self, id: PostId) -> Result<(), RepoError>;

    async fn find_revision(
        &self,
        post_id: PostId,
        id: &RevisionId,
    ) -> Result<Option<RevisionRecord>, RepoError>;

    async fn insert_revision(&self, revision: RevisionRecord)
    -> Result<RevisionRecord, RepoError>;

    /// Replace an existing revision; [`RepoError::NotFound`] if absent.
    async fn update_revision(&self, revision: RevisionRecord)
    -> Result<RevisionRecord, RepoError>;

    /// Record the terminal status of `run_id` unless a newer submission has
    /// replaced it; the check and the write are atomic. `Ok(None)` means the
    /// run was superseded and nothing changed.
    async fn finish_run(
        &self,
        post_id: PostId,
        id: &RevisionId,
        run_id: Uuid,
        status: RenderStatus,
    ) -> Result<Option<RevisionRecord>, RepoError>;

    async fn list_revisions(&self, post_id: PostId) -> Result<Vec<RevisionRecord>, RepoError>;
}

/// Load, restamp and store a revision's render status.
pub async fn set_render_status<R>(
    repo: &R,
    post_id: PostId,
    id: &RevisionId,
    status: RenderStatus,
) -> Result<RevisionRecord, RepoError>
where
    R: RevisionsRepo + ?Sized,
{
    let current = repo
        .find_revision(post_id, id)
        .await?
        .ok_or(RepoError::NotFound)?;
    repo.update_revision(current.with_status(status)).await
}
