//! Post and revision lifecycle hooks, plus the read side's error mapping.

mod support;

use std::time::Duration;

use pressroom::{
    application::{
        render::{ArtifactLookup, RenderServiceError, WorktreeLocks},
        repos::{RevisionsRepo, set_render_status},
    },
    domain::{
        entities::PostRecord,
        types::{PostId, RenderStatus, RevisionId},
    },
    infra::git::RevisionControlError,
};

use support::{Harness, SOURCE, project, revision};

#[tokio::test]
async fn creating_a_post_starts_a_pending_main_line() {
    let h = Harness::new();
    let post = PostId::new(1);

    let created = h.lifecycle.create_post(post).await.expect("create post");
    assert_eq!(created.id, post);

    let main = h
        .query
        .status(post, &RevisionId::main())
        .await
        .expect("main revision");
    assert_eq!(main.render_status, RenderStatus::Pending);
    assert!(h.dir.path().join("posts").join("1").join(".git").is_dir());

    let err = h
        .lifecycle
        .create_post(post)
        .await
        .expect_err("duplicate post");
    assert!(matches!(err, RenderServiceError::AlreadyExists { .. }));
}

#[tokio::test]
async fn create_waiting_on_the_lock_leaves_the_winner_alone() {
    let h = Harness::new();
    let post = PostId::new(9);
    let held = h.locks.acquire(post).await.expect("hold lock");

    let racer = tokio::spawn({
        let lifecycle = h.lifecycle.clone();
        async move { lifecycle.create_post(post).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Another create completes while the racer is queued on the lock.
    h.repo
        .insert_post(PostRecord::new(post))
        .await
        .expect("winner record");
    let marker = h.worktree(post).join("winner.txt");
    std::fs::create_dir_all(h.worktree(post)).expect("winner tree");
    std::fs::write(&marker, b"kept").expect("winner file");
    drop(held);

    let err = racer
        .await
        .expect("join")
        .expect_err("post already exists");
    assert!(matches!(err, RenderServiceError::AlreadyExists { .. }));
    assert!(!h.worktree(post).join(".git").exists());
    assert_eq!(std::fs::read(&marker).expect("marker"), b"kept");
}

#[tokio::test]
async fn revision_creation_rules() {
    let h = Harness::new();
    let post = PostId::new(2);

    let err = h
        .lifecycle
        .create_revision(post, revision("initial"))
        .await
        .expect_err("post does not exist");
    assert!(err.is_not_found());

    h.lifecycle.create_post(post).await.expect("create post");

    let err = h
        .lifecycle
        .create_revision(post, RevisionId::main())
        .await
        .expect_err("main is reserved");
    assert!(matches!(err, RenderServiceError::AlreadyExists { .. }));

    let err = h
        .lifecycle
        .create_revision(post, revision("initial"))
        .await
        .expect_err("main has no commit yet");
    assert!(matches!(
        err,
        RenderServiceError::Repository(RevisionControlError::MainUnborn)
    ));

    let main = h.render(post, &RevisionId::main(), project("main")).await;
    assert_eq!(main.render_status, RenderStatus::Success);

    let created = h
        .lifecycle
        .create_revision(post, revision("initial"))
        .await
        .expect("create revision");
    assert_eq!(created.render_status, RenderStatus::Pending);

    let err = h
        .lifecycle
        .create_revision(post, revision("initial"))
        .await
        .expect_err("duplicate revision");
    assert!(matches!(err, RenderServiceError::AlreadyExists { .. }));
}

#[tokio::test]
async fn new_revisions_start_from_the_published_artifact() {
    let h = Harness::new();
    let post = h.published_post(3).await;
    let proposal = revision("proposal");
    h.lifecycle
        .create_revision(post, proposal.clone())
        .await
        .expect("create revision");

    // Pending until its own render finishes, whatever the branch holds.
    assert_eq!(
        h.query.get_artifact(post, &proposal).await.expect("lookup"),
        ArtifactLookup::Pending
    );

    let record = h.render(post, &proposal, project("proposal")).await;
    assert_eq!(record.render_status, RenderStatus::Success);
    let lookup = h.query.get_artifact(post, &proposal).await.expect("lookup");
    match lookup {
        ArtifactLookup::Ready(artifact) => {
            assert_eq!(artifact.file_name, "index.html");
            assert!(artifact.path.ends_with("render/index.html"));
        }
        ArtifactLookup::Pending => panic!("render already finished"),
    }
}

#[tokio::test]
async fn deleting_a_post_removes_tree_and_records() {
    let h = Harness::new();
    let post = h.published_post(4).await;
    let worktree = h.dir.path().join("posts").join("4");
    assert!(worktree.is_dir());

    h.lifecycle.delete_post(post).await.expect("delete post");
    assert!(!worktree.exists());

    let err = h
        .query
        .status(post, &RevisionId::main())
        .await
        .expect_err("records are gone");
    assert!(err.is_not_found());

    let err = h
        .lifecycle
        .delete_post(post)
        .await
        .expect_err("already deleted");
    assert!(err.is_not_found());

    // The id can be reused afterwards.
    h.lifecycle.create_post(post).await.expect("recreate post");
}

#[tokio::test]
async fn success_without_an_artifact_is_demoted() {
    let h = Harness::new();
    let post = PostId::new(5);
    h.lifecycle.create_post(post).await.expect("create post");

    set_render_status(
        h.repo.as_ref(),
        post,
        &RevisionId::main(),
        RenderStatus::Success,
    )
    .await
    .expect("force success");

    let err = h
        .query
        .get_artifact(post, &RevisionId::main())
        .await
        .expect_err("no artifact on disk");
    assert!(err.is_not_found());

    let record = h
        .query
        .status(post, &RevisionId::main())
        .await
        .expect("status");
    assert_eq!(record.render_status, RenderStatus::Failure);
}

#[tokio::test]
async fn file_reads_stay_inside_the_project() {
    let h = Harness::new();
    let post = h.published_post(6).await;
    let draft = revision("draft");
    h.lifecycle
        .create_revision(post, draft.clone())
        .await
        .expect("create revision");
    h.render(post, &draft, project("draft")).await;

    let path = h
        .query
        .get_file(post, &draft, "index.qmd")
        .await
        .expect("file path");
    assert!(path.ends_with("project/index.qmd"));
    assert_eq!(
        h.query
            .read_file(post, &draft, "./index.qmd")
            .await
            .expect("contents"),
        SOURCE
    );

    for escape in ["../render/index.html", "/etc/passwd", "a/../../x", ""] {
        let err = h
            .query
            .get_file(post, &draft, escape)
            .await
            .expect_err("escape rejected");
        assert!(
            matches!(err, RenderServiceError::InvalidInput(_)),
            "`{escape}` gave {err:?}"
        );
    }

    let err = h
        .query
        .get_file(post, &draft, "chapters/missing.qmd")
        .await
        .expect_err("missing file");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn queries_on_unknown_targets_are_not_found() {
    let h = Harness::new();
    let post = h.published_post(8).await;
    let ghost = revision("ghost");

    assert!(
        h.query
            .status(PostId::new(999), &RevisionId::main())
            .await
            .expect_err("unknown post")
            .is_not_found()
    );
    assert!(
        h.query
            .get_artifact(post, &ghost)
            .await
            .expect_err("unknown revision")
            .is_not_found()
    );
    assert!(
        h.query
            .get_file_tree(post, &ghost)
            .await
            .expect_err("unknown revision")
            .is_not_found()
    );
}
