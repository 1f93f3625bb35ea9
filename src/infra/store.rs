//! Revision persistence adapters: an in-memory map and a JSON state file.

use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::{
    application::repos::{RepoError, RevisionsRepo},
    domain::{
        entities::{PostRecord, RevisionRecord},
        types::{PostId, RenderStatus, RevisionId},
    },
};

type RevisionKey = (PostId, RevisionId);

#[derive(Default, Clone)]
pub struct InMemoryRevisionsRepo {
    posts: Arc<DashMap<PostId, PostRecord>>,
    revisions: Arc<DashMap<RevisionKey, RevisionRecord>>,
}

impl InMemoryRevisionsRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevisionsRepo for InMemoryRevisionsRepo {
    async fn find_post(&self, id: PostId) -> Result<Option<PostRecord>, RepoError> {
        Ok(self.posts.get(&id).map(|entry| entry.value().clone()))
    }

    async fn insert_post(&self, post: PostRecord) -> Result<PostRecord, RepoError> {
        use dashmap::mapref::entry::Entry;

        match self.posts.entry(post.id) {
            Entry::Vacant(vacant) => {
                vacant.insert(post.clone());
                Ok(post)
            }
            Entry::Occupied(_) => Err(RepoError::Duplicate {
                key: format!("post {}", post.id),
            }),
        }
    }

    async fn delete_post(&self, id: PostId) -> Result<(), RepoError> {
        self.posts.remove(&id).ok_or(RepoError::NotFound)?;
        self.revisions.retain(|(post_id, _), _| *post_id != id);
        Ok(())
    }

    async fn find_revision(
        &self,
        post_id: PostId,
        id: &RevisionId,
    ) -> Result<Option<RevisionRecord>, RepoError> {
        Ok(self
            .revisions
            .get(&(post_id, id.clone()))
            .map(|entry| entry.value().clone()))
    }

    async fn insert_revision(
        &self,
        revision: RevisionRecord,
    ) -> Result<RevisionRecord, RepoError> {
        use dashmap::mapref::entry::Entry;

        match self
            .revisions
            .entry((revision.post_id, revision.id.clone()))
        {
            Entry::Vacant(vacant) => {
                vacant.insert(revision.clone());
                Ok(revision)
            }
            Entry::Occupied(_) => Err(RepoError::Duplicate {
                key: format!("revision {}/{}", revision.post_id, revision.id),
            }),
        }
    }

    async fn update_revision(
        &self,
        revision: RevisionRecord,
    ) -> Result<RevisionRecord, RepoError> {
        let mut entry = self
            .revisions
            .get_mut(&(revision.post_id, revision.id.clone()))
            .ok_or(RepoError::NotFound)?;
        *entry = revision.clone();
        Ok(revision)
    }

    async fn finish_run(
        &self,
        post_id: PostId,
        id: &RevisionId,
        run_id: Uuid,
        status: RenderStatus,
    ) -> Result<Option<RevisionRecord>, RepoError> {
        let mut entry = self
            .revisions
            .get_mut(&(post_id, id.clone()))
            .ok_or(RepoError::NotFound)?;
        if !entry.is_current_run(run_id) {
            return Ok(None);
        }
        let finished = entry.clone().with_status(status);
        *entry = finished.clone();
        Ok(Some(finished))
    }

    async fn list_revisions(&self, post_id: PostId) -> Result<Vec<RevisionRecord>, RepoError> {
        let mut revisions: Vec<RevisionRecord> = self
            .revisions
            .iter()
            .filter(|entry| entry.key().0 == post_id)
            .map(|entry| entry.value().clone())
            .collect();
        revisions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(revisions)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    posts: Vec<PostRecord>,
    #[serde(default)]
    revisions: Vec<RevisionRecord>,
}

#[derive(Debug, Default)]
struct State {
    posts: BTreeMap<PostId, PostRecord>,
    revisions: BTreeMap<RevisionKey, RevisionRecord>,
}

impl From<StateFile> for State {
    fn from(file: StateFile) -> Self {
        Self {
            posts: file.posts.into_iter().map(|post| (post.id, post)).collect(),
            revisions: file
                .revisions
                .into_iter()
                .map(|revision| ((revision.post_id, revision.id.clone()), revision))
                .collect(),
        }
    }
}

impl State {
    fn to_file(&self) -> StateFile {
        StateFile {
            posts: self.posts.values().cloned().collect(),
            revisions: self.revisions.values().cloned().collect(),
        }
    }
}

/// JSON state file shared by every process using one storage root.
///
/// Nothing is cached: reads load the current file, and each write re-reads it,
/// applies one change and replaces it atomically while holding an exclusive
/// lock on `<state file>.lock`. Concurrent invocations therefore never drop
/// each other's records.
pub struct JsonFileRevisionsRepo {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonFileRevisionsRepo {
    /// Open the state file, creating its directory. A corrupt file is reported
    /// here rather than on first use.
    pub async fn open(path: PathBuf) -> Result<Self, RepoError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(RepoError::from_persistence)?;
        }
        let repo = Self {
            path,
            writer: Mutex::new(()),
        };
        repo.snapshot().await?;
        Ok(repo)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn snapshot(&self) -> Result<State, RepoError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_state(&path))
            .await
            .map_err(RepoError::from_persistence)?
    }

    /// Apply `change` to the latest on-disk state under the file lock. The
    /// file is rewritten only when `change` reports that it modified the state.
    async fn transact<T, F>(&self, change: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut State) -> Result<(T, bool), RepoError> + Send + 'static,
        T: Send + 'static,
    {
        let _writer = self.writer.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || -> Result<T, RepoError> {
            let lock = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)
                .map_err(RepoError::from_persistence)?;
            lock.lock_exclusive().map_err(RepoError::from_persistence)?;

            let result = load_state(&path).and_then(|mut state| {
                let (value, dirty) = change(&mut state)?;
                if dirty {
                    store_state(&path, &state)?;
                }
                Ok(value)
            });

            if let Err(err) = FileExt::unlock(&lock) {
                warn!(
                    target = "infra::store",
                    op = "state_file::unlock",
                    error = %err,
                    "Failed to unlock state file; closing the handle releases it"
                );
            }
            result
        })
        .await
        .map_err(RepoError::from_persistence)?
    }
}

fn load_state(path: &Path) -> Result<State, RepoError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<StateFile>(&bytes)
            .map(State::from)
            .map_err(|err| {
                RepoError::from_persistence(format!(
                    "state file `{}` is corrupt: {err}",
                    path.display()
                ))
            }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(State::default()),
        Err(err) => Err(RepoError::from_persistence(err)),
    }
}

fn store_state(path: &Path, state: &State) -> Result<(), RepoError> {
    let bytes = serde_json::to_vec_pretty(&state.to_file()).map_err(RepoError::from_persistence)?;
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    std::fs::write(&staging, bytes).map_err(RepoError::from_persistence)?;
    std::fs::rename(&staging, path).map_err(RepoError::from_persistence)
}

#[async_trait]
impl RevisionsRepo for JsonFileRevisionsRepo {
    async fn find_post(&self, id: PostId) -> Result<Option<PostRecord>, RepoError> {
        Ok(self.snapshot().await?.posts.remove(&id))
    }

    async fn insert_post(&self, post: PostRecord) -> Result<PostRecord, RepoError> {
        self.transact(move |state| {
            if state.posts.contains_key(&post.id) {
                return Err(RepoError::Duplicate {
                    key: format!("post {}", post.id),
                });
            }
            state.posts.insert(post.id, post.clone());
            Ok((post, true))
        })
        .await
    }

    async fn delete_post(&self, id: PostId) -> Result<(), RepoError> {
        self.transact(move |state| {
            state.posts.remove(&id).ok_or(RepoError::NotFound)?;
            state.revisions.retain(|(post_id, _), _| *post_id != id);
            Ok(((), true))
        })
        .await
    }

    async fn find_revision(
        &self,
        post_id: PostId,
        id: &RevisionId,
    ) -> Result<Option<RevisionRecord>, RepoError> {
        Ok(self
            .snapshot()
            .await?
            .revisions
            .remove(&(post_id, id.clone())))
    }

    async fn insert_revision(
        &self,
        revision: RevisionRecord,
    ) -> Result<RevisionRecord, RepoError> {
        self.transact(move |state| {
            let key = (revision.post_id, revision.id.clone());
            if state.revisions.contains_key(&key) {
                return Err(RepoError::Duplicate {
                    key: format!("revision {}/{}", revision.post_id, revision.id),
                });
            }
            state.revisions.insert(key, revision.clone());
            Ok((revision, true))
        })
        .await
    }

    async fn update_revision(
        &self,
        revision: RevisionRecord,
    ) -> Result<RevisionRecord, RepoError> {
        self.transact(move |state| {
            let slot = state
                .revisions
                .get_mut(&(revision.post_id, revision.id.clone()))
                .ok_or(RepoError::NotFound)?;
            *slot = revision.clone();
            Ok((revision, true))
        })
        .await
    }

    async fn finish_run(
        &self,
        post_id: PostId,
        id: &RevisionId,
        run_id: Uuid,
        status: RenderStatus,
    ) -> Result<Option<RevisionRecord>, RepoError> {
        let id = id.clone();
        self.transact(move |state| {
            let slot = state
                .revisions
                .get_mut(&(post_id, id))
                .ok_or(RepoError::NotFound)?;
            if !slot.is_current_run(run_id) {
                return Ok((None, false));
            }
            let finished = slot.clone().with_status(status);
            *slot = finished.clone();
            Ok((Some(finished), true))
        })
        .await
    }

    async fn list_revisions(&self, post_id: PostId) -> Result<Vec<RevisionRecord>, RepoError> {
        Ok(self
            .snapshot()
            .await?
            .revisions
            .into_values()
            .filter(|revision| revision.post_id == post_id)
            .collect())
    }
}
