//! Git repository wrapper scoped to one post's working tree.
//!
//! Every revision of a post is a local branch; the reserved `main` branch is
//! the published line. The working tree is shared, so callers must hold the
//! post's worktree lock across a checkout and whatever reads or writes follow.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use git2::{
    BranchType, Commit, ErrorCode, IndexAddOption, Oid, Repository, RepositoryInitOptions,
    ResetType, Signature, build::CheckoutBuilder,
};
use thiserror::Error;
use tracing::debug;

use crate::domain::types::{MAIN_REVISION, RevisionId};

const GIT_DIR: &str = ".git";

#[derive(Debug, Error)]
pub enum RevisionControlError {
    #[error("no repository at `{}`", path.display())]
    NotInitialized { path: PathBuf },
    #[error("main line has no commits yet")]
    MainUnborn,
    #[error("line of history `{name}` already exists")]
    AlreadyExists { name: String },
    #[error("line of history `{name}` does not exist")]
    UnknownRevision { name: String },
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Author and committer recorded on every commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "pressroom".to_string(),
            email: "pressroom@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RevisionControl {
    workdir: PathBuf,
    identity: CommitIdentity,
}

impl RevisionControl {
    pub fn new(workdir: impl Into<PathBuf>, identity: CommitIdentity) -> Self {
        Self {
            workdir: workdir.into(),
            identity,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Wipe the working tree, including any previous repository, and
    /// initialise a fresh one whose `HEAD` is the unborn main line.
    pub fn init_repository(&self) -> Result<(), RevisionControlError> {
        match std::fs::remove_dir_all(&self.workdir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        std::fs::create_dir_all(&self.workdir)?;

        let mut options = RepositoryInitOptions::new();
        options.initial_head(MAIN_REVISION).mkdir(true);
        Repository::init_opts(&self.workdir, &options)?;

        debug!(
            target = "infra::git",
            op = "init_repository",
            workdir = %self.workdir.display(),
            "Initialised repository"
        );
        Ok(())
    }

    /// Start a new branch at the current tip of main.
    pub fn create_revision_line(&self, name: &RevisionId) -> Result<Oid, RevisionControlError> {
        if name.is_main() {
            return Err(RevisionControlError::AlreadyExists {
                name: name.to_string(),
            });
        }

        let repo = self.open()?;
        let tip = main_commit(&repo)?;
        match repo.branch(name.as_str(), &tip, false) {
            Ok(_) => Ok(tip.id()),
            Err(err) if err.code() == ErrorCode::Exists => {
                Err(RevisionControlError::AlreadyExists {
                    name: name.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Point the working tree at `name`'s tip after dropping every uncommitted
    /// change and untracked file.
    ///
    /// The unborn main line checks out as an empty tree.
    pub fn checkout(&self, name: &RevisionId) -> Result<(), RevisionControlError> {
        let repo = self.open()?;
        discard_changes(&repo, &self.workdir)?;

        let refname = branch_ref(name);
        match repo.find_reference(&refname) {
            Ok(reference) => {
                let tip = reference.peel_to_commit()?;
                repo.checkout_tree(tip.as_object(), Some(&mut clean_checkout()))?;
                repo.set_head(&refname)?;
            }
            Err(err) if err.code() == ErrorCode::NotFound && name.is_main() => {
                repo.set_head(&refname)?;
                clear_index(&repo)?;
                clear_workdir(&self.workdir)?;
            }
            Err(err) if err.code() == ErrorCode::NotFound => {
                return Err(RevisionControlError::UnknownRevision {
                    name: name.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Drop uncommitted changes on whatever is checked out.
    pub fn discard_changes(&self) -> Result<(), RevisionControlError> {
        let repo = self.open()?;
        discard_changes(&repo, &self.workdir)
    }

    /// Stage everything present (deletions included) and commit it. Empty
    /// commits are allowed so every render leaves a point in history.
    pub fn commit_all(&self, message: &str) -> Result<Oid, RevisionControlError> {
        let repo = self.open()?;

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT | IndexAddOption::FORCE, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let signature = Signature::now(&self.identity.name, &self.identity.email)?;
        let parent = head_commit(&repo)?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        Ok(oid)
    }

    pub fn tip_of_main(&self) -> Result<Oid, RevisionControlError> {
        let repo = self.open()?;
        Ok(main_commit(&repo)?.id())
    }

    /// Short name of the branch `HEAD` points at, born or not.
    pub fn current_revision(&self) -> Result<String, RevisionControlError> {
        let repo = self.open()?;
        let head = repo.find_reference("HEAD")?;
        let target = head
            .symbolic_target()
            .map(str::to_string)
            .unwrap_or_default();
        Ok(target
            .strip_prefix("refs/heads/")
            .map(str::to_string)
            .unwrap_or(target))
    }

    fn open(&self) -> Result<Repository, RevisionControlError> {
        match Repository::open(&self.workdir) {
            Ok(repo) => Ok(repo),
            Err(err) if err.code() == ErrorCode::NotFound => {
                Err(RevisionControlError::NotInitialized {
                    path: self.workdir.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn branch_ref(name: &RevisionId) -> String {
    format!("refs/heads/{}", name.as_str())
}

fn clean_checkout() -> CheckoutBuilder<'static> {
    let mut builder = CheckoutBuilder::new();
    builder.force().remove_untracked(true).remove_ignored(true);
    builder
}

fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>, RevisionControlError> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn main_commit(repo: &Repository) -> Result<Commit<'_>, RevisionControlError> {
    match repo.find_branch(MAIN_REVISION, BranchType::Local) {
        Ok(branch) => Ok(branch.get().peel_to_commit()?),
        Err(err) if err.code() == ErrorCode::NotFound => Err(RevisionControlError::MainUnborn),
        Err(err) => Err(err.into()),
    }
}

fn discard_changes(repo: &Repository, workdir: &Path) -> Result<(), RevisionControlError> {
    match head_commit(repo)? {
        Some(commit) => {
            repo.reset(commit.as_object(), ResetType::Hard, Some(&mut clean_checkout()))?;
        }
        None => {
            clear_index(repo)?;
            clear_workdir(workdir)?;
        }
    }
    Ok(())
}

fn clear_index(repo: &Repository) -> Result<(), RevisionControlError> {
    let mut index = repo.index()?;
    index.clear()?;
    index.write()?;
    Ok(())
}

fn clear_workdir(workdir: &Path) -> Result<(), RevisionControlError> {
    for entry in std::fs::read_dir(workdir)? {
        let entry = entry?;
        if entry.file_name() == GIT_DIR {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
