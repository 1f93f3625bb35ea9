use tracing::info;

use crate::{
    application::repos::RepoError,
    domain::{
        entities::{PostRecord, RevisionRecord},
        types::{PostId, RevisionId},
    },
    infra::git::RevisionControlError,
};

use super::{
    context::{RenderContext, blocking},
    types::RenderServiceError,
};

/// Hooks the surrounding CRUD layer calls when posts and revisions come and go.
#[derive(Clone)]
pub struct PostLifecycle {
    context: RenderContext,
}

impl PostLifecycle {
    pub fn new(context: RenderContext) -> Self {
        Self { context }
    }

    /// Initialise the post's repository and record it with a pending main line.
    pub async fn create_post(&self, post_id: PostId) -> Result<PostRecord, RenderServiceError> {
        let repo = &self.context.repo;
        if repo.find_post(post_id).await?.is_some() {
            return Err(RenderServiceError::already_exists("post", post_id));
        }

        let _guard = self.context.locks.acquire(post_id).await?;
        // A concurrent create may have won while this call waited for the lock.
        if repo.find_post(post_id).await?.is_some() {
            return Err(RenderServiceError::already_exists("post", post_id));
        }
        let vcs = self.context.revision_control(post_id);
        blocking(move || vcs.init_repository()).await??;

        let post = repo
            .insert_post(PostRecord::new(post_id))
            .await
            .map_err(|err| duplicate_as_exists(err, "post", post_id.to_string()))?;
        repo.insert_revision(RevisionRecord::new(post_id, RevisionId::main()))
            .await?;

        info!(
            target = "application::render::lifecycle",
            op = "create_post",
            post_id = %post_id,
            "Post working tree initialised"
        );
        Ok(post)
    }

    /// Start a proposed revision at the current tip of main.
    pub async fn create_revision(
        &self,
        post_id: PostId,
        revision: RevisionId,
    ) -> Result<RevisionRecord, RenderServiceError> {
        if revision.is_main() {
            return Err(RenderServiceError::already_exists(
                "revision",
                format!("{post_id}/{revision}"),
            ));
        }

        let repo = &self.context.repo;
        if repo.find_post(post_id).await?.is_none() {
            return Err(RenderServiceError::not_found("post", post_id));
        }
        if repo.find_revision(post_id, &revision).await?.is_some() {
            return Err(RenderServiceError::already_exists(
                "revision",
                format!("{post_id}/{revision}"),
            ));
        }

        let _guard = self.context.locks.acquire(post_id).await?;
        let vcs = self.context.revision_control(post_id);
        let name = revision.clone();
        let base = match blocking(move || vcs.create_revision_line(&name)).await? {
            Ok(oid) => oid,
            Err(RevisionControlError::AlreadyExists { .. }) => {
                return Err(RenderServiceError::already_exists(
                    "revision",
                    format!("{post_id}/{revision}"),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let record = repo
            .insert_revision(RevisionRecord::new(post_id, revision.clone()))
            .await
            .map_err(|err| duplicate_as_exists(err, "revision", format!("{post_id}/{revision}")))?;

        info!(
            target = "application::render::lifecycle",
            op = "create_revision",
            post_id = %post_id,
            revision = %revision,
            base = %base,
            "Revision line created"
        );
        Ok(record)
    }

    /// Remove the post's working tree and its records.
    pub async fn delete_post(&self, post_id: PostId) -> Result<(), RenderServiceError> {
        let repo = &self.context.repo;
        if repo.find_post(post_id).await?.is_none() {
            return Err(RenderServiceError::not_found("post", post_id));
        }

        let _guard = self.context.locks.acquire(post_id).await?;
        if repo.find_post(post_id).await?.is_none() {
            return Err(RenderServiceError::not_found("post", post_id));
        }
        let store = self.context.store.clone();
        let worktree = store.post_dir(post_id);
        blocking(move || store.remove_all(&worktree)).await??;
        repo.delete_post(post_id).await?;

        info!(
            target = "application::render::lifecycle",
            op = "delete_post",
            post_id = %post_id,
            "Post working tree removed"
        );
        Ok(())
    }
}

fn duplicate_as_exists(err: RepoError, entity: &'static str, key: String) -> RenderServiceError {
    match err {
        RepoError::Duplicate { .. } => RenderServiceError::already_exists(entity, key),
        other => other.into(),
    }
}
