use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::{domain::types::PostId, infra::locks::FileLockHold};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for the worktree lock of post {post_id}")]
    Timeout { post_id: PostId, waited: Duration },
    #[error("worktree lock file for post {post_id} could not be locked")]
    Io {
        post_id: PostId,
        #[source]
        source: std::io::Error,
    },
    #[error("worktree lock acquisition for post {post_id} was aborted")]
    Aborted { post_id: PostId },
}

/// Exclusive access to one post's working tree.
///
/// Acquiring blocks until no other holder exists. The returned guard releases
/// the lock when dropped, so every exit path of the holder releases it exactly
/// once.
#[async_trait]
pub trait WorktreeLocks: Send + Sync {
    async fn acquire(&self, post_id: PostId) -> Result<WorktreeGuard, LockError>;
}

/// Proof of exclusive access to a post's working tree.
#[must_use = "the worktree lock is released as soon as the guard is dropped"]
pub struct WorktreeGuard {
    post_id: PostId,
    acquired_at: Instant,
    // Field order matters: the file lock is released before the in-process one.
    _file: Option<FileLockHold>,
    _process: ProcessHold,
}

impl WorktreeGuard {
    pub(crate) fn new(post_id: PostId, process: ProcessHold, file: Option<FileLockHold>) -> Self {
        Self {
            post_id,
            acquired_at: Instant::now(),
            _file: file,
            _process: process,
        }
    }

    pub fn post_id(&self) -> PostId {
        self.post_id
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

type PostMutexes = Arc<DashMap<PostId, Arc<Mutex<()>>>>;

/// Held in-process mutex of one post. Dropping it unlocks the mutex and
/// forgets the post's entry once nobody holds or awaits it.
pub(crate) struct ProcessHold {
    post_id: PostId,
    guard: Option<OwnedMutexGuard<()>>,
    posts: PostMutexes,
}

impl Drop for ProcessHold {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.posts, self.post_id);
    }
}

/// Waiters clone the mutex out of the map under the shard lock, so a count of
/// one means the map holds the only reference.
fn prune(posts: &PostMutexes, post_id: PostId) {
    posts.remove_if(&post_id, |_, mutex| Arc::strong_count(mutex) == 1);
}

impl Drop for WorktreeGuard {
    fn drop(&mut self) {
        let held_ms = self.acquired_at.elapsed().as_millis() as u64;
        metrics::histogram!("pressroom_lock_held_ms").record(held_ms as f64);
        debug!(
            target = "application::render::runtime",
            op = "worktree_lock::release",
            post_id = %self.post_id,
            held_ms,
            "Released worktree lock"
        );
    }
}

/// In-process worktree locks: one fair mutex per post.
#[derive(Clone, Default)]
pub struct MemoryWorktreeLocks {
    posts: PostMutexes,
    timeout: Option<Duration>,
}

impl MemoryWorktreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound how long `acquire` waits before failing with [`LockError::Timeout`].
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            posts: Arc::new(DashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether some task currently holds the post's lock.
    pub fn is_held(&self, post_id: PostId) -> bool {
        self.posts
            .get(&post_id)
            .map(|mutex| mutex.try_lock().is_err())
            .unwrap_or(false)
    }

    pub(crate) async fn lock_process(
        &self,
        post_id: PostId,
        timeout: Option<Duration>,
    ) -> Result<ProcessHold, LockError> {
        // Clone the mutex out so the map shard is not borrowed across the await.
        let mutex = Arc::clone(self.posts.entry(post_id).or_default().value());
        let started_at = Instant::now();

        let guard = match timeout {
            Some(limit) => {
                let attempt = tokio::time::timeout(limit, mutex.lock_owned()).await;
                let Ok(guard) = attempt else {
                    prune(&self.posts, post_id);
                    metrics::counter!("pressroom_lock_timeout_total").increment(1);
                    warn!(
                        target = "application::render::runtime",
                        op = "worktree_lock::acquire",
                        result = "timeout",
                        post_id = %post_id,
                        waited_ms = limit.as_millis() as u64,
                        "Timed out waiting for worktree lock"
                    );
                    return Err(LockError::Timeout {
                        post_id,
                        waited: limit,
                    });
                };
                guard
            }
            None => mutex.lock_owned().await,
        };

        let waited_ms = started_at.elapsed().as_millis() as u64;
        metrics::histogram!("pressroom_lock_wait_ms").record(waited_ms as f64);
        debug!(
            target = "application::render::runtime",
            op = "worktree_lock::acquire",
            result = "acquired",
            post_id = %post_id,
            waited_ms,
            "Acquired worktree lock"
        );
        Ok(ProcessHold {
            post_id,
            guard: Some(guard),
            posts: Arc::clone(&self.posts),
        })
    }
}

#[async_trait]
impl WorktreeLocks for MemoryWorktreeLocks {
    async fn acquire(&self, post_id: PostId) -> Result<WorktreeGuard, LockError> {
        let process = self.lock_process(post_id, self.timeout).await?;
        Ok(WorktreeGuard::new(post_id, process, None))
    }
}
