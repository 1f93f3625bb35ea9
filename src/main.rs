use std::{io::Write, process, sync::Arc, time::Duration};

use pressroom::{
    application::{
        error::AppError,
        render::{
            ArtifactLookup, DependencyInstaller, MemoryWorktreeLocks, PostLifecycle,
            QuartoToolchain, RenderContext, RenderQueryService, RenderToolchain, RscriptInstaller,
            UploadedArchive, WorktreeLocks, spawn_render_worker, wait_for_render,
        },
        repos::RevisionsRepo,
    },
    config::{self, Command, LockBackend, Settings, SubmitArgs},
    infra::{
        error::InfraError, locks::FileWorktreeLocks, store::JsonFileRevisionsRepo, telemetry,
        worktree::WorktreeStore,
    },
};
use serde::Serialize;
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.chain();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?chain, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let context = build_render_context(&settings).await?;
    info!(
        target = "pressroom::main",
        storage_root = %settings.storage.root.display(),
        lock_backend = ?settings.locks.backend,
        "Render context ready"
    );

    match cli_args.command {
        Command::InitPost(args) => {
            let post = PostLifecycle::new(context).create_post(args.post).await?;
            print_json(&post)
        }
        Command::CreateRevision(args) => {
            let revision = PostLifecycle::new(context)
                .create_revision(args.post, args.revision)
                .await?;
            print_json(&revision)
        }
        Command::Submit(args) => run_submit(context, *args).await,
        Command::Status(args) => {
            let record = RenderQueryService::new(context)
                .status(args.post, &args.revision)
                .await?;
            print_json(&record)
        }
        Command::Artifact(args) => {
            let lookup = RenderQueryService::new(context)
                .get_artifact(args.post, &args.revision)
                .await?;
            match lookup {
                ArtifactLookup::Ready(artifact) => print_json(&json!({
                    "status": "ready",
                    "path": artifact.path,
                    "file_name": artifact.file_name,
                    "size_bytes": artifact.size_bytes,
                })),
                ArtifactLookup::Pending => print_json(&json!({ "status": "pending" })),
            }
        }
        Command::Tree(args) => {
            let tree = RenderQueryService::new(context)
                .get_file_tree(args.post, &args.revision)
                .await?;
            print_json(&tree)
        }
        Command::File(args) => {
            let contents = RenderQueryService::new(context)
                .read_file(args.target.post, &args.target.revision, &args.path)
                .await?;
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&contents)
                .and_then(|()| stdout.flush())
                .map_err(InfraError::from)?;
            Ok(())
        }
        Command::DeletePost(args) => {
            PostLifecycle::new(context).delete_post(args.post).await?;
            print_json(&json!({ "deleted": args.post }))
        }
    }
}

/// Queue the upload, then keep the process alive until the worker has
/// finished the run.
async fn run_submit(context: RenderContext, args: SubmitArgs) -> Result<(), AppError> {
    let post = args.target.post;
    let revision = args.target.revision;

    let data = tokio::fs::read(&args.archive)
        .await
        .map_err(InfraError::from)?;
    let file_name = args
        .archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.tar.gz".to_string());

    let repo = Arc::clone(&context.repo);
    let (orchestrator, worker) = spawn_render_worker(context);
    let pending = orchestrator
        .submit(post, revision.clone(), UploadedArchive::new(file_name, data))
        .await?;
    drop(orchestrator);

    if args.wait {
        let finished = wait_for_render(
            repo.as_ref(),
            post,
            &revision,
            Duration::from_secs(args.wait_timeout_seconds),
        )
        .await?;
        print_json(&finished)?;
    } else {
        print_json(&pending)?;
    }

    worker
        .await
        .map_err(|err| AppError::unexpected(format!("render worker failed: {err}")))
}

async fn build_render_context(settings: &Settings) -> Result<RenderContext, AppError> {
    let store = WorktreeStore::new(settings.storage.root.clone()).map_err(InfraError::from)?;
    let repo: Arc<dyn RevisionsRepo> =
        Arc::new(JsonFileRevisionsRepo::open(settings.storage.state_file.clone()).await?);

    let locks: Arc<dyn WorktreeLocks> = match settings.locks.backend {
        LockBackend::Memory => Arc::new(MemoryWorktreeLocks::with_timeout(
            settings.locks.acquire_timeout,
        )),
        LockBackend::File => Arc::new(
            FileWorktreeLocks::new(settings.storage.locks_dir(), settings.locks.acquire_timeout)
                .map_err(InfraError::from)?,
        ),
    };

    let toolchain: Arc<dyn RenderToolchain> = Arc::new(QuartoToolchain::new(
        settings.render.quarto_path.clone(),
        settings.render.toolchain_timeout,
    ));
    let installer: Arc<dyn DependencyInstaller> = Arc::new(RscriptInstaller::new(
        settings.render.rscript_path.clone(),
        settings.render.toolchain_timeout,
    ));

    Ok(RenderContext {
        store,
        identity: settings.git.identity.clone(),
        locks,
        repo,
        toolchain,
        installer,
        sources: settings.render.sources,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{out}");
    Ok(())
}
