//! Cross-process worktree locks backed by advisory file locks.

use std::{
    fs::{File, OpenOptions},
    path::PathBuf,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use tracing::warn;

use crate::{
    application::render::{LockError, MemoryWorktreeLocks, WorktreeGuard, WorktreeLocks},
    domain::types::PostId,
};

/// An exclusively locked lock file; unlocked on drop.
pub struct FileLockHold {
    file: File,
}

impl Drop for FileLockHold {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(
                target = "infra::locks",
                op = "file_lock::unlock",
                error = %err,
                "Failed to unlock worktree lock file; closing the handle releases it"
            );
        }
    }
}

/// Serialises worktree access across processes sharing one storage root.
///
/// Tasks inside this process first queue on the in-process lock, so at most
/// one of them ever waits on the file lock for a given post.
#[derive(Clone)]
pub struct FileWorktreeLocks {
    directory: PathBuf,
    process: MemoryWorktreeLocks,
}

impl FileWorktreeLocks {
    pub fn new(directory: PathBuf, timeout: Option<Duration>) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            process: MemoryWorktreeLocks::with_timeout(timeout),
        })
    }

    fn lock_path(&self, post_id: PostId) -> PathBuf {
        self.directory.join(format!("{post_id}.lock"))
    }
}

#[async_trait]
impl WorktreeLocks for FileWorktreeLocks {
    async fn acquire(&self, post_id: PostId) -> Result<WorktreeGuard, LockError> {
        let started_at = Instant::now();
        let timeout = self.process.timeout();
        let process = self.process.lock_process(post_id, timeout).await?;

        let path = self.lock_path(post_id);
        let task = tokio::task::spawn_blocking(move || -> std::io::Result<FileLockHold> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(FileLockHold { file })
        });

        // A timed-out blocking task still finishes; its hold is dropped with
        // the detached result, which unlocks the file again.
        let joined = match timeout {
            Some(limit) => {
                let remaining = limit.saturating_sub(started_at.elapsed());
                tokio::time::timeout(remaining, task)
                    .await
                    .map_err(|_| LockError::Timeout {
                        post_id,
                        waited: limit,
                    })?
            }
            None => task.await,
        };

        let hold = joined
            .map_err(|_| LockError::Aborted { post_id })?
            .map_err(|source| LockError::Io { post_id, source })?;

        Ok(WorktreeGuard::new(post_id, process, Some(hold)))
    }
}
