//! Shared fixtures: fake toolchain and installer, fixture archives and a
//! fully wired render context over a temporary storage root.

#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use pressroom::{
    application::render::{
        DependencyInstaller, MemoryWorktreeLocks, PostLifecycle, RenderContext,
        RenderOrchestrator, RenderQueryService, RenderToolchain, SourcePolicies, ToolchainError,
        UploadedArchive, spawn_render_worker, wait_for_render,
    },
    domain::{
        entities::RevisionRecord,
        types::{PostId, RevisionId},
    },
    infra::{git::CommitIdentity, store::InMemoryRevisionsRepo, worktree::WorktreeStore},
};

pub const WAIT: Duration = Duration::from_secs(20);

pub const DEFAULT_CONFIG: &[u8] = b"project:\n  title: Fixture paper\n";
pub const BOOK_CONFIG: &[u8] = b"project:\n  type: book\n";
pub const SOURCE: &[u8] = b"---\ntitle: Fixture\n---\n\n# Introduction\n\nSome words.\n";

/// What the fake renderer leaves in the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// One `index.html` whose body names the rendered `marker.txt`.
    SingleHtml,
    Nothing,
    TwoFiles,
    Fail,
}

pub struct FakeToolchain {
    output: Mutex<Output>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    block_commits: AtomicBool,
}

impl FakeToolchain {
    pub fn new(output: Output) -> Self {
        Self {
            output: Mutex::new(output),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            block_commits: AtomicBool::new(false),
        }
    }

    pub fn set_output(&self, output: Output) {
        *self.output.lock().expect("output lock") = output;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = delay;
    }

    /// Leave a stale `.git/index.lock` behind after rendering, so the commit
    /// that follows fails.
    pub fn set_block_commits(&self, block: bool) {
        self.block_commits.store(block, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most renders observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderToolchain for FakeToolchain {
    async fn render(&self, project: &Path, output: &Path) -> Result<(), ToolchainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let mode = *self.output.lock().expect("output lock");
        let delay = *self.delay.lock().expect("delay lock");
        let marker = tokio::fs::read_to_string(project.join("marker.txt"))
            .await
            .unwrap_or_default();

        tokio::fs::create_dir_all(output).await.expect("output dir");
        if mode == Output::SingleHtml || mode == Output::TwoFiles {
            tokio::fs::write(output.join("index.html"), b"partial")
                .await
                .expect("partial write");
        }
        tokio::time::sleep(delay).await;

        let result = match mode {
            Output::SingleHtml => {
                tokio::fs::write(
                    output.join("index.html"),
                    format!("complete:{}", marker.trim()),
                )
                .await
                .expect("artifact");
                if self.block_commits.load(Ordering::SeqCst) {
                    let worktree = output.parent().expect("render dir has a parent");
                    tokio::fs::write(worktree.join(".git").join("index.lock"), b"")
                        .await
                        .expect("index lock");
                }
                Ok(())
            }
            Output::TwoFiles => {
                tokio::fs::write(output.join("appendix.html"), b"extra")
                    .await
                    .expect("second artifact");
                Ok(())
            }
            Output::Nothing => Ok(()),
            Output::Fail => Err(ToolchainError::Exit {
                program: "fake-quarto".to_string(),
                exit_code: Some(1),
            }),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
pub struct FakeInstaller {
    pub restores: AtomicUsize,
    pub installs: AtomicUsize,
    fail: Mutex<bool>,
}

impl FakeInstaller {
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().expect("fail lock") = fail;
    }

    fn outcome(&self) -> Result<(), ToolchainError> {
        if *self.fail.lock().expect("fail lock") {
            Err(ToolchainError::Exit {
                program: "fake-rscript".to_string(),
                exit_code: Some(2),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DependencyInstaller for FakeInstaller {
    async fn restore(&self, _project: &Path) -> Result<(), ToolchainError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }

    async fn install_render_packages(&self, _project: &Path) -> Result<(), ToolchainError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }
}

/// Gzip-compressed tarball holding `entries`.
pub fn archive(entries: &[(&str, &[u8])]) -> UploadedArchive {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, path, *data)
            .expect("append entry");
    }
    let bytes = builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
    UploadedArchive::new("project.tar.gz", bytes)
}

/// A minimal default-type project whose artifact will name `marker`.
pub fn project(marker: &str) -> UploadedArchive {
    archive(&[
        ("_quarto.yml", DEFAULT_CONFIG),
        ("index.qmd", SOURCE),
        ("marker.txt", marker.as_bytes()),
    ])
}

pub fn revision(name: &str) -> RevisionId {
    RevisionId::parse(name).expect("valid revision name")
}

pub struct Harness {
    pub dir: TempDir,
    pub context: RenderContext,
    pub locks: MemoryWorktreeLocks,
    pub repo: Arc<InMemoryRevisionsRepo>,
    pub toolchain: Arc<FakeToolchain>,
    pub installer: Arc<FakeInstaller>,
    pub orchestrator: RenderOrchestrator,
    pub worker: JoinHandle<()>,
    pub lifecycle: PostLifecycle,
    pub query: RenderQueryService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_locks(MemoryWorktreeLocks::new())
    }

    pub fn with_locks(locks: MemoryWorktreeLocks) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = WorktreeStore::new(dir.path().join("posts")).expect("store");
        let repo = Arc::new(InMemoryRevisionsRepo::new());
        let toolchain = Arc::new(FakeToolchain::new(Output::SingleHtml));
        let installer = Arc::new(FakeInstaller::default());

        let context = RenderContext {
            store,
            identity: CommitIdentity::default(),
            locks: Arc::new(locks.clone()),
            repo: repo.clone(),
            toolchain: toolchain.clone(),
            installer: installer.clone(),
            sources: SourcePolicies::default(),
        };
        let (orchestrator, worker) = spawn_render_worker(context.clone());

        Self {
            dir,
            lifecycle: PostLifecycle::new(context.clone()),
            query: RenderQueryService::new(context.clone()),
            context,
            locks,
            repo,
            toolchain,
            installer,
            orchestrator,
            worker,
        }
    }

    pub fn worktree(&self, post: PostId) -> std::path::PathBuf {
        self.dir.path().join("posts").join(post.to_string())
    }

    /// Submit and wait for the run to reach a terminal status.
    pub async fn render(
        &self,
        post: PostId,
        revision: &RevisionId,
        archive: UploadedArchive,
    ) -> RevisionRecord {
        self.orchestrator
            .submit(post, revision.clone(), archive)
            .await
            .expect("submit");
        wait_for_render(self.repo.as_ref(), post, revision, WAIT)
            .await
            .expect("render finished")
    }

    /// A post whose main line already carries one successful render.
    pub async fn published_post(&self, id: u64) -> PostId {
        let post = PostId::new(id);
        self.lifecycle.create_post(post).await.expect("create post");
        let main = self.render(post, &RevisionId::main(), project("main")).await;
        assert!(main.render_status.is_terminal());
        post
    }
}
