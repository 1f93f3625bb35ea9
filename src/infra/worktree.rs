//! Filesystem side of a post's working tree: upload persistence, archive
//! extraction and guarded path resolution.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::{StreamExt, pin_mut, stream};
use sha2::{Digest, Sha256};
use tar::{Archive, EntryType};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;
use walkdir::WalkDir;

use crate::domain::types::{PostId, RevisionId};

/// Subdirectory of a working tree holding the extracted project sources.
pub const PROJECT_DIR: &str = "project";
/// Subdirectory of a working tree the toolchain renders into.
pub const RENDER_DIR: &str = "render";
/// Transient name of the uploaded archive inside a working tree.
pub const UPLOAD_FILE: &str = "upload.tar.gz";

const GIT_DIR: &str = ".git";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("path `{path}` escapes the project root")]
    PathEscape { path: String },
    #[error("archive entry `{entry}` is not allowed: {reason}")]
    UnsafeArchiveEntry { entry: String, reason: &'static str },
    #[error("archive could not be read")]
    MalformedArchive {
        #[source]
        source: io::Error,
    },
    #[error("archive contains no files")]
    EmptyArchive,
    #[error("uploaded archive is empty")]
    EmptyPayload,
    #[error("uploaded archive stream failed")]
    PayloadStream {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("uploaded archive size exceeds supported range")]
    SizeOverflow,
    #[error("directory `{}` does not exist", path.display())]
    MissingDirectory { path: PathBuf },
    #[error("file `{path}` does not exist")]
    MissingFile { path: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WorktreeError {
    /// Errors caused by the uploaded content rather than by the host.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            WorktreeError::PathEscape { .. }
                | WorktreeError::UnsafeArchiveEntry { .. }
                | WorktreeError::MalformedArchive { .. }
                | WorktreeError::EmptyArchive
                | WorktreeError::EmptyPayload
        )
    }
}

/// Metadata about a persisted upload.
#[derive(Debug, Clone)]
pub struct StoredArchive {
    pub path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
}

/// Maps posts to working-tree directories beneath a configured root.
#[derive(Debug, Clone)]
pub struct WorktreeStore {
    root: PathBuf,
}

impl WorktreeStore {
    /// Initialise the store rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working tree of a post. All revisions share it, so the revision does
    /// not participate in the path.
    pub fn resolve_path(&self, post_id: PostId, _revision: &RevisionId) -> PathBuf {
        self.post_dir(post_id)
    }

    pub fn post_dir(&self, post_id: PostId) -> PathBuf {
        self.root.join(post_id.to_string())
    }

    pub fn project_dir(worktree: &Path) -> PathBuf {
        worktree.join(PROJECT_DIR)
    }

    pub fn render_dir(worktree: &Path) -> PathBuf {
        worktree.join(RENDER_DIR)
    }

    /// Stream an uploaded archive into the working tree.
    pub async fn persist_upload<S>(
        &self,
        stream: S,
        worktree: &Path,
    ) -> Result<StoredArchive, WorktreeError>
    where
        S: futures::Stream<Item = Result<Bytes, WorktreeError>>,
    {
        fs::create_dir_all(worktree).await?;
        let absolute = worktree.join(UPLOAD_FILE);

        let mut file = fs::File::create(&absolute).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes: u64 = 0;

        pin_mut!(stream);
        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = fs::remove_file(&absolute).await;
                    return Err(err);
                }
            };

            if chunk.is_empty() {
                continue;
            }

            total_bytes = total_bytes
                .checked_add(chunk.len() as u64)
                .ok_or(WorktreeError::SizeOverflow)?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
        }

        file.flush().await?;

        if total_bytes == 0 {
            drop(file);
            let _ = fs::remove_file(&absolute).await;
            return Err(WorktreeError::EmptyPayload);
        }

        Ok(StoredArchive {
            path: absolute,
            checksum: hex::encode(hasher.finalize()),
            size_bytes: total_bytes,
        })
    }

    /// Persist a fully-buffered archive.
    pub async fn persist_upload_bytes(
        &self,
        data: Bytes,
        worktree: &Path,
    ) -> Result<StoredArchive, WorktreeError> {
        let stream = stream::once(async move { Ok::<_, WorktreeError>(data) });
        self.persist_upload(stream, worktree).await
    }

    /// Unpack the persisted upload into [`PROJECT_DIR`], replacing any previous
    /// sources, and remove the archive afterwards. Returns the number of files
    /// written.
    ///
    /// Absolute entries, entries containing `..` and link entries are refused
    /// before anything is written for them; a refused archive leaves no
    /// partial project behind.
    pub fn extract(&self, worktree: &Path) -> Result<usize, WorktreeError> {
        let archive_path = worktree.join(UPLOAD_FILE);
        let target = Self::project_dir(worktree);
        self.remove_all(&target)?;
        std::fs::create_dir_all(&target)?;

        let result = unpack_archive(&archive_path, &target);
        let _ = std::fs::remove_file(&archive_path);

        match result {
            Ok(0) => {
                self.remove_all(&target)?;
                Err(WorktreeError::EmptyArchive)
            }
            Ok(files) => Ok(files),
            Err(err) => {
                self.remove_all(&target)?;
                Err(err)
            }
        }
    }

    /// Every regular file beneath `dir`, keyed by `/`-separated relative path.
    pub fn list_tree(&self, dir: &Path) -> Result<BTreeMap<String, u64>, WorktreeError> {
        if !dir.is_dir() {
            return Err(WorktreeError::MissingDirectory {
                path: dir.to_path_buf(),
            });
        }

        let mut files = BTreeMap::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != GIT_DIR);
        for entry in walker {
            let entry = entry.map_err(|err| {
                err.into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop while walking tree"))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|_| io::Error::other("walked outside of the tree root"))?;
            let key = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(key, entry.metadata().map_err(io::Error::from)?.len());
        }
        Ok(files)
    }

    /// Resolve `relative` beneath `root`, refusing anything that would leave it.
    pub fn read_file(&self, root: &Path, relative: &str) -> Result<PathBuf, WorktreeError> {
        let escape = || WorktreeError::PathEscape {
            path: relative.to_string(),
        };

        let candidate = Path::new(relative);
        if relative.is_empty() || !is_contained(candidate) {
            return Err(escape());
        }

        let joined = root.join(candidate);
        let resolved = match joined.canonicalize() {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(WorktreeError::MissingFile {
                    path: relative.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let canonical_root = root.canonicalize()?;
        if !resolved.starts_with(&canonical_root) {
            return Err(escape());
        }
        if !resolved.is_file() {
            return Err(WorktreeError::MissingFile {
                path: relative.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Recursively delete `path`. Missing paths are treated as success.
    pub fn remove_all(&self, path: &Path) -> Result<(), WorktreeError> {
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WorktreeError::Io(err)),
        }
    }
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn unpack_archive(archive_path: &Path, target: &Path) -> Result<usize, WorktreeError> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let malformed = |source: io::Error| WorktreeError::MalformedArchive { source };

    let mut written = 0usize;
    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let entry_path = entry.path().map_err(malformed)?.into_owned();
        let entry_name = entry_path.display().to_string();

        if entry_path.is_absolute() || !is_contained(&entry_path) {
            return Err(WorktreeError::UnsafeArchiveEntry {
                entry: entry_name,
                reason: "path escapes the extraction directory",
            });
        }

        let destination = target.join(&entry_path);
        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&destination)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = destination.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&destination).map_err(malformed)?;
                written += 1;
            }
            EntryType::Symlink | EntryType::Link => {
                return Err(WorktreeError::UnsafeArchiveEntry {
                    entry: entry_name,
                    reason: "links are not supported",
                });
            }
            other => {
                debug!(
                    target = "infra::worktree",
                    entry = %entry_name,
                    entry_type = ?other,
                    "Skipping archive entry of unsupported type"
                );
            }
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use tempfile::TempDir;

    fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            builder
                .append_data(&mut header, path, *data)
                .expect("append entry");
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip")
    }

    /// Hand-rolled header so the `..` component survives `append_data`'s own checks.
    fn traversal_tarball() -> Vec<u8> {
        let data = b"owned";
        let mut header = tar::Header::new_old();
        {
            let raw = header.as_old_mut();
            let name = b"../escape.txt";
            raw.name[..name.len()].copy_from_slice(name);
        }
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append(&header, &data[..]).expect("append raw entry");
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip")
    }

    fn store() -> (TempDir, WorktreeStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = WorktreeStore::new(dir.path().join("posts")).expect("store");
        (dir, store)
    }

    #[test]
    fn resolve_path_is_shared_by_revisions() {
        let (_dir, store) = store();
        let post = PostId::new(7);
        let main = store.resolve_path(post, &RevisionId::main());
        let branch = store.resolve_path(post, &RevisionId::parse("initial").expect("name"));
        assert_eq!(main, branch);
        assert!(main.ends_with("7"));
    }

    #[tokio::test]
    async fn persist_and_extract_round_trip() {
        let (_dir, store) = store();
        let worktree = store.post_dir(PostId::new(1));
        let archive = tarball(&[
            ("_quarto.yml", b"project:\n  title: x\n"),
            ("chapters/index.qmd", b"# Hello"),
        ]);

        let stored = store
            .persist_upload_bytes(Bytes::from(archive.clone()), &worktree)
            .await
            .expect("persist");
        assert_eq!(stored.size_bytes, archive.len() as u64);
        assert_eq!(stored.checksum.len(), 64);

        let files = store.extract(&worktree).expect("extract");
        assert_eq!(files, 2);
        assert!(!worktree.join(UPLOAD_FILE).exists());

        let tree = store
            .list_tree(&WorktreeStore::project_dir(&worktree))
            .expect("tree");
        assert_eq!(tree.get("chapters/index.qmd"), Some(&7));
        assert_eq!(tree.len(), 2);
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let (_dir, store) = store();
        let worktree = store.post_dir(PostId::new(2));
        let err = store
            .persist_upload_bytes(Bytes::new(), &worktree)
            .await
            .expect_err("empty upload");
        assert!(matches!(err, WorktreeError::EmptyPayload));
        assert!(!worktree.join(UPLOAD_FILE).exists());
    }

    #[tokio::test]
    async fn traversal_entries_are_validation_errors() {
        let (dir, store) = store();
        let worktree = store.post_dir(PostId::new(3));
        store
            .persist_upload_bytes(Bytes::from(traversal_tarball()), &worktree)
            .await
            .expect("persist");

        let err = store.extract(&worktree).expect_err("traversal");
        assert!(matches!(err, WorktreeError::UnsafeArchiveEntry { .. }));
        assert!(err.is_validation());
        assert!(!dir.path().join("posts/escape.txt").exists());
        assert!(!WorktreeStore::project_dir(&worktree).exists());
    }

    #[tokio::test]
    async fn garbage_archive_is_malformed() {
        let (_dir, store) = store();
        let worktree = store.post_dir(PostId::new(4));
        store
            .persist_upload_bytes(Bytes::from_static(b"definitely not gzip"), &worktree)
            .await
            .expect("persist");

        let err = store.extract(&worktree).expect_err("malformed");
        assert!(matches!(err, WorktreeError::MalformedArchive { .. }));
    }

    #[test]
    fn list_tree_requires_directory() {
        let (dir, store) = store();
        let err = store
            .list_tree(&dir.path().join("missing"))
            .expect_err("missing dir");
        assert!(matches!(err, WorktreeError::MissingDirectory { .. }));
    }

    #[test]
    fn read_file_refuses_escape() {
        let (dir, store) = store();
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("nested")).expect("mkdir");
        std::fs::write(root.join("nested/page.qmd"), "hi").expect("write");
        std::fs::write(dir.path().join("secret"), "nope").expect("write");

        let found = store.read_file(&root, "nested/page.qmd").expect("inside");
        assert!(found.ends_with("nested/page.qmd"));

        for path in ["../secret", "/etc/passwd", "nested/../../secret", ""] {
            let err = store.read_file(&root, path).expect_err("escape");
            assert!(
                matches!(err, WorktreeError::PathEscape { .. }),
                "{path} gave {err:?}"
            );
        }

        let err = store.read_file(&root, "nested/absent.qmd").expect_err("missing");
        assert!(matches!(err, WorktreeError::MissingFile { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn read_file_refuses_symlink_escape() {
        let (dir, store) = store();
        let root = dir.path().join("project");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(dir.path().join("secret"), "nope").expect("write");
        std::os::unix::fs::symlink(dir.path().join("secret"), root.join("link")).expect("link");

        let err = store.read_file(&root, "link").expect_err("symlink escape");
        assert!(matches!(err, WorktreeError::PathEscape { .. }));
    }

    #[test]
    fn remove_all_is_idempotent() {
        let (dir, store) = store();
        let target = dir.path().join("doomed");
        std::fs::create_dir_all(target.join("a/b")).expect("mkdir");
        store.remove_all(&target).expect("first");
        store.remove_all(&target).expect("second");
        assert!(!target.exists());
    }
}
