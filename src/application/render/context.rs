use std::sync::Arc;

use crate::{
    application::repos::RevisionsRepo,
    domain::types::{PostId, RevisionKind, SourcePolicy},
    infra::{
        git::{CommitIdentity, RevisionControl},
        worktree::WorktreeStore,
    },
};

use super::{
    runtime::WorktreeLocks,
    toolchain::{DependencyInstaller, RenderToolchain},
    types::BlockingTaskError,
};

/// What a successful run does with the extracted sources, per revision kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePolicies {
    pub main: SourcePolicy,
    pub branch: SourcePolicy,
}

impl SourcePolicies {
    pub fn for_kind(&self, kind: RevisionKind) -> SourcePolicy {
        match kind {
            RevisionKind::Main => self.main,
            RevisionKind::Branch => self.branch,
        }
    }
}

impl Default for SourcePolicies {
    fn default() -> Self {
        Self {
            main: SourcePolicy::Discard,
            branch: SourcePolicy::Retain,
        }
    }
}

/// Shared context handed to the orchestrator, the worker and the query side.
#[derive(Clone)]
pub struct RenderContext {
    pub store: WorktreeStore,
    pub identity: CommitIdentity,
    pub locks: Arc<dyn WorktreeLocks>,
    pub repo: Arc<dyn RevisionsRepo>,
    pub toolchain: Arc<dyn RenderToolchain>,
    pub installer: Arc<dyn DependencyInstaller>,
    pub sources: SourcePolicies,
}

impl RenderContext {
    /// Repository handle for a post's working tree.
    pub fn revision_control(&self, post_id: PostId) -> RevisionControl {
        RevisionControl::new(self.store.post_dir(post_id), self.identity.clone())
    }
}

/// Run filesystem or libgit2 work on the blocking pool.
pub(crate) async fn blocking<F, T>(work: F) -> Result<T, BlockingTaskError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| BlockingTaskError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policies_discard_main_sources_only() {
        let policies = SourcePolicies::default();
        assert_eq!(policies.for_kind(RevisionKind::Main), SourcePolicy::Discard);
        assert_eq!(policies.for_kind(RevisionKind::Branch), SourcePolicy::Retain);
    }
}
