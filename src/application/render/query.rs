use std::{collections::BTreeMap, path::PathBuf};

use tracing::warn;

use crate::{
    application::repos::set_render_status,
    domain::{
        entities::RevisionRecord,
        types::{PostId, RenderStatus, RevisionId},
    },
    infra::{
        git::RevisionControlError,
        worktree::{WorktreeError, WorktreeStore},
    },
};

use super::{
    context::{RenderContext, blocking},
    jobs::single_artifact,
    runtime::WorktreeGuard,
    types::{Artifact, ArtifactLookup, PipelineError, RenderServiceError},
};

/// Read access to what the last successful render of a revision left behind.
///
/// Every read that touches the working tree holds the post's lock and checks
/// the revision out first, so it never observes a run half-way through.
#[derive(Clone)]
pub struct RenderQueryService {
    context: RenderContext,
}

impl RenderQueryService {
    pub fn new(context: RenderContext) -> Self {
        Self { context }
    }

    pub async fn status(
        &self,
        post_id: PostId,
        revision: &RevisionId,
    ) -> Result<RevisionRecord, RenderServiceError> {
        self.context
            .repo
            .find_revision(post_id, revision)
            .await?
            .ok_or_else(|| revision_not_found(post_id, revision))
    }

    /// Locate the revision's artifact.
    ///
    /// Pending and failed revisions are answered from their status alone. A
    /// successful revision whose artifact is gone is demoted to `Failure`.
    pub async fn get_artifact(
        &self,
        post_id: PostId,
        revision: &RevisionId,
    ) -> Result<ArtifactLookup, RenderServiceError> {
        Ok(match self.locate_artifact(post_id, revision).await? {
            Located::Pending => ArtifactLookup::Pending,
            Located::Ready(artifact, _guard) => ArtifactLookup::Ready(artifact),
        })
    }

    /// Like [`Self::get_artifact`], but also reads the artifact before the
    /// lock is released. `None` means the render is still pending.
    pub async fn read_artifact(
        &self,
        post_id: PostId,
        revision: &RevisionId,
    ) -> Result<Option<(Artifact, Vec<u8>)>, RenderServiceError> {
        match self.locate_artifact(post_id, revision).await? {
            Located::Pending => Ok(None),
            Located::Ready(artifact, _guard) => {
                let contents = tokio::fs::read(&artifact.path)
                    .await
                    .map_err(WorktreeError::from)?;
                Ok(Some((artifact, contents)))
            }
        }
    }

    async fn locate_artifact(
        &self,
        post_id: PostId,
        revision: &RevisionId,
    ) -> Result<Located, RenderServiceError> {
        let record = self.status(post_id, revision).await?;
        match record.render_status {
            RenderStatus::Pending => return Ok(Located::Pending),
            RenderStatus::Failure => {
                return Err(RenderServiceError::not_found(
                    "artifact",
                    format!("{post_id}/{revision}"),
                ));
            }
            RenderStatus::Success => {}
        }

        let guard = self.checkout(post_id, revision).await?;
        let render_dir = WorktreeStore::render_dir(&self.context.store.post_dir(post_id));

        let store = self.context.store.clone();
        let dir = render_dir.clone();
        let found = blocking(move || single_artifact(&store, &dir)).await?;

        let file_name = match found {
            Ok(name) => name,
            Err(PipelineError::ArtifactVerification { found }) => {
                self.self_heal(&record, found).await;
                return Err(RenderServiceError::not_found(
                    "artifact",
                    format!("{post_id}/{revision}"),
                ));
            }
            Err(PipelineError::Storage(err)) => return Err(err.into()),
            Err(err) => return Err(RenderServiceError::InvalidInput(err.to_string())),
        };

        let path = render_dir.join(&file_name);
        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(WorktreeError::from)?
            .len();
        Ok(Located::Ready(
            Artifact {
                path,
                file_name,
                size_bytes,
            },
            guard,
        ))
    }

    /// Every file of the revision's project sources with its size in bytes.
    pub async fn get_file_tree(
        &self,
        post_id: PostId,
        revision: &RevisionId,
    ) -> Result<BTreeMap<String, u64>, RenderServiceError> {
        self.status(post_id, revision).await?;
        let _guard = self.checkout(post_id, revision).await?;

        let store = self.context.store.clone();
        let project_dir = WorktreeStore::project_dir(&store.post_dir(post_id));
        match blocking(move || store.list_tree(&project_dir)).await? {
            Ok(files) => Ok(files),
            Err(WorktreeError::MissingDirectory { .. }) => Err(RenderServiceError::not_found(
                "project sources",
                format!("{post_id}/{revision}"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Absolute path of one project file. Paths leaving the project root are
    /// rejected as invalid input.
    ///
    /// The lock is released on return; use [`Self::read_file`] to get the
    /// contents consistently.
    pub async fn get_file(
        &self,
        post_id: PostId,
        revision: &RevisionId,
        relative: &str,
    ) -> Result<PathBuf, RenderServiceError> {
        self.status(post_id, revision).await?;
        let _guard = self.checkout(post_id, revision).await?;
        self.resolve_file(post_id, revision, relative).await
    }

    /// Contents of one project file, read while the lock is held.
    pub async fn read_file(
        &self,
        post_id: PostId,
        revision: &RevisionId,
        relative: &str,
    ) -> Result<Vec<u8>, RenderServiceError> {
        self.status(post_id, revision).await?;
        let _guard = self.checkout(post_id, revision).await?;
        let path = self.resolve_file(post_id, revision, relative).await?;
        let contents = tokio::fs::read(&path).await.map_err(WorktreeError::from)?;
        Ok(contents)
    }

    async fn resolve_file(
        &self,
        post_id: PostId,
        revision: &RevisionId,
        relative: &str,
    ) -> Result<PathBuf, RenderServiceError> {
        let store = self.context.store.clone();
        let project_dir = WorktreeStore::project_dir(&store.post_dir(post_id));
        let relative_owned = relative.to_string();
        match blocking(move || store.read_file(&project_dir, &relative_owned)).await? {
            Ok(path) => Ok(path),
            Err(WorktreeError::PathEscape { path }) => Err(RenderServiceError::InvalidInput(
                format!("path `{path}` escapes the project root"),
            )),
            Err(WorktreeError::MissingFile { path }) => Err(RenderServiceError::not_found(
                "file",
                format!("{post_id}/{revision}:{path}"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Lock the post and check the revision out; the guard keeps both valid.
    async fn checkout(
        &self,
        post_id: PostId,
        revision: &RevisionId,
    ) -> Result<WorktreeGuard, RenderServiceError> {
        let guard = self.context.locks.acquire(post_id).await?;
        let vcs = self.context.revision_control(post_id);
        let target = revision.clone();
        match blocking(move || vcs.checkout(&target)).await? {
            Ok(()) => Ok(guard),
            Err(RevisionControlError::UnknownRevision { .. }) => {
                Err(revision_not_found(post_id, revision))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn self_heal(&self, record: &RevisionRecord, found: usize) {
        metrics::counter!("pressroom_artifact_self_heal_total").increment(1);
        warn!(
            target = "application::render::query",
            post_id = %record.post_id,
            revision = %record.id,
            found,
            "Successful revision has no single artifact; marking it failed"
        );

        let repo = self.context.repo.as_ref();
        let demoted = match record.render_run {
            Some(run_id) => repo
                .finish_run(record.post_id, &record.id, run_id, RenderStatus::Failure)
                .await
                .map(|_| ()),
            None => set_render_status(repo, record.post_id, &record.id, RenderStatus::Failure)
                .await
                .map(|_| ()),
        };
        if let Err(err) = demoted {
            warn!(
                target = "application::render::query",
                post_id = %record.post_id,
                revision = %record.id,
                error = %err,
                "Failed to persist self-healed status"
            );
        }
    }
}

enum Located {
    Pending,
    Ready(Artifact, WorktreeGuard),
}

fn revision_not_found(post_id: PostId, revision: &RevisionId) -> RenderServiceError {
    RenderServiceError::not_found("revision", format!("{post_id}/{revision}"))
}
