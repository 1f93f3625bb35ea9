use std::{path::Path, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::{Instant, sleep},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    application::repos::RevisionsRepo,
    domain::{
        entities::RevisionRecord,
        types::{PostId, RenderStatus, RevisionId, RevisionKind, SourcePolicy},
    },
    infra::worktree::{WorktreeError, WorktreeStore},
};

use super::{
    context::{RenderContext, blocking},
    project::{DEPENDENCY_BOOTSTRAP, DEPENDENCY_LOCKFILE, validate_project},
    types::{PipelineError, RenderJob, RenderReport, RenderServiceError, UploadedArchive},
};

const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sending half of the render queue. Dropping every clone lets the worker
/// drain and stop.
#[derive(Clone)]
pub struct RenderQueue {
    sender: mpsc::UnboundedSender<RenderJob>,
}

impl RenderQueue {
    fn push(&self, job: RenderJob) -> Result<(), RenderJob> {
        self.sender.send(job).map_err(|rejected| rejected.0)
    }
}

/// Receives queued runs and executes each on its own task. Runs for
/// different posts proceed in parallel; runs for one post serialise on its
/// worktree lock.
pub struct RenderWorker {
    context: RenderContext,
    receiver: mpsc::UnboundedReceiver<RenderJob>,
}

impl RenderWorker {
    /// Process runs until the queue closes, then wait for in-flight runs.
    pub async fn run(mut self) {
        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                job = self.receiver.recv() => match job {
                    Some(job) => {
                        let context = self.context.clone();
                        running.spawn(async move { process_render_job(&context, job).await });
                    }
                    None => break,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    report_join(joined);
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            report_join(joined);
        }
        info!(
            target = "application::render::worker",
            "Render queue closed; worker stopped"
        );
    }
}

fn report_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(
            target = "application::render::worker",
            error = %err,
            "Render task aborted"
        );
    }
}

/// Build the orchestrator and start its worker on the current runtime.
pub fn spawn_render_worker(context: RenderContext) -> (RenderOrchestrator, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let worker = RenderWorker {
        context: context.clone(),
        receiver,
    };
    let handle = tokio::spawn(worker.run());
    let orchestrator = RenderOrchestrator {
        repo: Arc::clone(&context.repo),
        queue: RenderQueue { sender },
    };
    (orchestrator, handle)
}

/// Accepts uploads and hands them to the background worker.
#[derive(Clone)]
pub struct RenderOrchestrator {
    repo: Arc<dyn RevisionsRepo>,
    queue: RenderQueue,
}

impl RenderOrchestrator {
    /// Mark the revision pending and queue a render run for it.
    ///
    /// The returned record is already persisted as `Pending`; the run itself
    /// happens later and reports only through the revision's status.
    pub async fn submit(
        &self,
        post_id: PostId,
        revision: RevisionId,
        archive: UploadedArchive,
    ) -> Result<RevisionRecord, RenderServiceError> {
        let record = self
            .repo
            .find_revision(post_id, &revision)
            .await?
            .ok_or_else(|| {
                RenderServiceError::not_found("revision", format!("{post_id}/{revision}"))
            })?;

        let run_id = Uuid::new_v4();
        let pending = self.repo.update_revision(record.begin_run(run_id)).await?;

        let archive_bytes = archive.data.len();
        let job = RenderJob {
            run_id,
            post_id,
            revision: revision.clone(),
            archive,
        };
        if self.queue.push(job).is_err() {
            warn!(
                target = "application::render::submit",
                post_id = %post_id,
                revision = %revision,
                run_id = %run_id,
                "Render queue closed; failing submission"
            );
            self.repo
                .finish_run(post_id, &revision, run_id, RenderStatus::Failure)
                .await?;
            return Err(RenderServiceError::QueueClosed);
        }

        info!(
            target = "application::render::submit",
            post_id = %post_id,
            revision = %revision,
            run_id = %run_id,
            archive_bytes,
            "Render queued"
        );
        Ok(pending)
    }
}

/// Execute one queued run to a terminal status.
///
/// Holds the post's worktree lock from the first checkout until the terminal
/// status is persisted. A run whose submission has been replaced by a newer
/// one is skipped, and never overwrites the newer run's status.
pub async fn process_render_job(context: &RenderContext, job: RenderJob) {
    let started_at = Instant::now();
    let post_id = job.post_id;

    let guard = match context.locks.acquire(post_id).await {
        Ok(guard) => guard,
        Err(err) => {
            let err = PipelineError::from(err);
            record_outcome(context, &job, Err(&err), started_at).await;
            return;
        }
    };

    match context.repo.find_revision(post_id, &job.revision).await {
        Ok(Some(record)) if record.is_current_run(job.run_id) => {}
        Ok(Some(_)) => {
            metrics::counter!("pressroom_render_total", "result" => "superseded").increment(1);
            info!(
                target = "application::render::process_render_job",
                post_id = %post_id,
                revision = %job.revision,
                run_id = %job.run_id,
                result = "superseded",
                "Skipping render replaced by a newer submission"
            );
            return;
        }
        Ok(None) => {
            warn!(
                target = "application::render::process_render_job",
                post_id = %post_id,
                revision = %job.revision,
                run_id = %job.run_id,
                "Revision disappeared before its render started"
            );
            return;
        }
        Err(err) => {
            let err = PipelineError::from(err);
            record_outcome(context, &job, Err(&err), started_at).await;
            return;
        }
    }

    let outcome = run_pipeline(context, &job).await;
    if outcome.is_err() {
        let vcs = context.revision_control(post_id);
        match blocking(move || vcs.discard_changes()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                target = "application::render::process_render_job",
                post_id = %post_id,
                error = %err,
                "Failed to reset working tree after failed render"
            ),
            Err(err) => warn!(
                target = "application::render::process_render_job",
                post_id = %post_id,
                error = %err,
                "Failed to reset working tree after failed render"
            ),
        }
    }

    record_outcome(context, &job, outcome.as_ref(), started_at).await;
    drop(guard);
}

async fn record_outcome(
    context: &RenderContext,
    job: &RenderJob,
    outcome: Result<&RenderReport, &PipelineError>,
    started_at: Instant,
) {
    let status = match outcome {
        Ok(_) => RenderStatus::Success,
        Err(_) => RenderStatus::Failure,
    };
    let persisted = context
        .repo
        .finish_run(job.post_id, &job.revision, job.run_id, status)
        .await;

    let elapsed_ms = started_at.elapsed().as_millis() as u64;
    metrics::histogram!("pressroom_render_ms").record(elapsed_ms as f64);

    match outcome {
        Ok(report) => {
            metrics::counter!("pressroom_render_total", "result" => "success").increment(1);
            info!(
                target = "application::render::process_render_job",
                post_id = %job.post_id,
                revision = %job.revision,
                run_id = %job.run_id,
                result = "success",
                commit = %report.commit,
                artifact = %report.artifact,
                source_files = report.source_files,
                elapsed_ms,
                "Render succeeded"
            );
        }
        Err(err) => {
            let stage = err.stage();
            metrics::counter!("pressroom_render_total", "result" => "failure", "stage" => stage)
                .increment(1);
            warn!(
                target = "application::render::process_render_job",
                post_id = %job.post_id,
                revision = %job.revision,
                run_id = %job.run_id,
                result = "failure",
                stage,
                elapsed_ms,
                error = %err,
                "Render failed"
            );
        }
    }

    match persisted {
        Ok(Some(_)) => {}
        Ok(None) => info!(
            target = "application::render::process_render_job",
            post_id = %job.post_id,
            revision = %job.revision,
            run_id = %job.run_id,
            "Newer submission arrived; leaving its status untouched"
        ),
        Err(err) => error!(
            target = "application::render::process_render_job",
            post_id = %job.post_id,
            revision = %job.revision,
            run_id = %job.run_id,
            status = %status,
            error = %err,
            "Failed to persist render status"
        ),
    }
}

/// Checkout through commit. The caller holds the worktree lock.
async fn run_pipeline(
    context: &RenderContext,
    job: &RenderJob,
) -> Result<RenderReport, PipelineError> {
    let store = context.store.clone();
    let worktree = store.resolve_path(job.post_id, &job.revision);
    let project_dir = WorktreeStore::project_dir(&worktree);
    let render_dir = WorktreeStore::render_dir(&worktree);
    let vcs = context.revision_control(job.post_id);
    let kind = job.revision.kind();

    {
        let vcs = vcs.clone();
        let revision = job.revision.clone();
        let store = store.clone();
        let render_dir = render_dir.clone();
        blocking(move || -> Result<(), PipelineError> {
            vcs.checkout(&revision)?;
            store.remove_all(&render_dir)?;
            Ok(())
        })
        .await??;
    }

    let stored = store
        .persist_upload_bytes(job.archive.data.clone(), &worktree)
        .await?;
    debug!(
        target = "application::render::process_render_job",
        post_id = %job.post_id,
        run_id = %job.run_id,
        file_name = %job.archive.file_name,
        size_bytes = stored.size_bytes,
        checksum = %stored.checksum,
        "Upload persisted"
    );
    let source_files = {
        let store = store.clone();
        let worktree = worktree.clone();
        blocking(move || store.extract(&worktree)).await??
    };

    let mut config = {
        let project_dir = project_dir.clone();
        blocking(move || validate_project(&project_dir)).await??
    };

    install_dependencies(context, &project_dir).await?;

    if kind == RevisionKind::Branch {
        config.force_single_html();
        blocking(move || config.write()).await??;
    }

    tokio::fs::create_dir_all(&render_dir)
        .await
        .map_err(|err| PipelineError::Storage(err.into()))?;
    context
        .toolchain
        .render(&project_dir, &render_dir)
        .await
        .map_err(|source| PipelineError::RenderExecution { source })?;

    let artifact = {
        let store = store.clone();
        let render_dir = render_dir.clone();
        blocking(move || single_artifact(&store, &render_dir)).await??
    };

    let discard_source = context.sources.for_kind(kind) == SourcePolicy::Discard;
    let message = format!("Render {} ({})", job.revision, job.run_id);
    let commit = blocking(move || -> Result<_, PipelineError> {
        if discard_source {
            store.remove_all(&project_dir)?;
        }
        Ok(vcs.commit_all(&message)?)
    })
    .await??;

    Ok(RenderReport {
        commit: commit.to_string(),
        artifact,
        source_files,
    })
}

async fn install_dependencies(
    context: &RenderContext,
    project_dir: &Path,
) -> Result<(), PipelineError> {
    let lockfile = project_dir.join(DEPENDENCY_LOCKFILE);
    let bootstrap = project_dir.join(DEPENDENCY_BOOTSTRAP);
    let (has_lockfile, has_bootstrap) =
        blocking(move || (lockfile.is_file(), bootstrap.is_file())).await?;

    if has_lockfile {
        context
            .installer
            .restore(project_dir)
            .await
            .map_err(|source| PipelineError::DependencyInstall { source })?;
    }
    if has_bootstrap {
        context
            .installer
            .install_render_packages(project_dir)
            .await
            .map_err(|source| PipelineError::DependencyInstall { source })?;
    }
    Ok(())
}

/// Name of the only file in the render directory.
pub(crate) fn single_artifact(
    store: &WorktreeStore,
    render_dir: &Path,
) -> Result<String, PipelineError> {
    let files = match store.list_tree(render_dir) {
        Ok(files) => files,
        Err(WorktreeError::MissingDirectory { .. }) => Default::default(),
        Err(err) => return Err(err.into()),
    };
    if files.len() != 1 {
        return Err(PipelineError::ArtifactVerification { found: files.len() });
    }
    files
        .into_keys()
        .next()
        .ok_or(PipelineError::ArtifactVerification { found: 0 })
}

/// Poll a revision until its render reaches a terminal status or `timeout`
/// elapses.
pub async fn wait_for_render<R>(
    repo: &R,
    post_id: PostId,
    revision: &RevisionId,
    timeout: Duration,
) -> Result<RevisionRecord, RenderServiceError>
where
    R: RevisionsRepo + ?Sized,
{
    let deadline = Instant::now() + timeout;

    loop {
        let record = repo
            .find_revision(post_id, revision)
            .await?
            .ok_or_else(|| {
                RenderServiceError::not_found("revision", format!("{post_id}/{revision}"))
            })?;

        if record.render_status.is_terminal() {
            return Ok(record);
        }
        if Instant::now() >= deadline {
            return Err(RenderServiceError::WaitTimeout {
                post_id,
                revision: revision.clone(),
                waited: timeout,
            });
        }
        sleep(DEFAULT_WAIT_POLL_INTERVAL).await;
    }
}
