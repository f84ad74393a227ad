//! Integration tests for the worktree lifecycle manager.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use orchard::config::{Overrides, ProjectConfig};
use orchard::error::Error;
use orchard::worktree::WorktreeStatus;
use orchard::AppContext;

/// Minimal repository with one commit, enough for branch and worktree ops.
fn init_test_repo(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let repo = git2::Repository::init(dir)?;
    let sig = git2::Signature::now("Test", "test@example.com")?;
    let tree_id = {
        let blob = repo.blob(b"initial")?;
        let mut tb = repo.treebuilder(None)?;
        tb.insert("README", blob, 0o100644)?;
        tb.write()?
    };
    let tree = repo.find_tree(tree_id)?;
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])?;
    Ok(())
}

fn test_config(project_dir: &Path) -> ProjectConfig {
    let mut config = ProjectConfig::load(project_dir, Overrides::default()).unwrap();
    config.liveness.interval_ms = 50;
    config.liveness.timeout_secs = 1;
    config.stop_grace_secs = 2;
    config
}

async fn wait_for_status(ctx: &AppContext, id: &str, status: WorktreeStatus, secs: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if ctx.worktrees.get(id).await.unwrap().status == status {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn activity_kinds(ctx: &AppContext, id: &str) -> Vec<String> {
    ctx.activity
        .query(None, None, Some(id), None)
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

#[tokio::test]
async fn create_registers_stopped_worktree_and_seeds_secrets() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();
    std::fs::write(tmp.path().join(".env"), "SECRET=1\n").unwrap();

    let ctx = AppContext::new(test_config(tmp.path()));
    let info = ctx.worktrees.create("feature/auth-fix", None).await.unwrap();

    assert_eq!(info.id, "feature-auth-fix");
    assert_eq!(info.status, WorktreeStatus::Stopped);
    assert_eq!(info.branch, "feature/auth-fix");
    assert!(info.path.is_dir());
    assert!(info.path.join(".env").is_file(), "secret file should be seeded");
    assert_eq!(ctx.worktrees.list().await.len(), 1);

    let kinds = activity_kinds(&ctx, "feature-auth-fix").await;
    let creating = kinds.iter().position(|k| k == "creating").unwrap();
    let completed = kinds.iter().position(|k| k == "creation_completed").unwrap();
    assert!(creating < completed);
}

#[tokio::test]
async fn create_attaches_to_existing_branch() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();

    // Pre-create the branch; creation should attach, not fail.
    {
        let repo = git2::Repository::open(tmp.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("existing-work", &head, false).unwrap();
    }

    let ctx = AppContext::new(test_config(tmp.path()));
    let info = ctx.worktrees.create("existing-work", None).await.unwrap();

    let wt_repo = git2::Repository::open(&info.path).unwrap();
    assert_eq!(wt_repo.head().unwrap().shorthand(), Some("existing-work"));
}

#[tokio::test]
async fn failed_creation_leaves_no_registration() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();

    let config = test_config(tmp.path());
    let worktrees_dir = config.worktrees_dir();
    std::fs::create_dir_all(&worktrees_dir).unwrap();
    // A plain file where the checkout directory must go makes git fail.
    std::fs::write(worktrees_dir.join("blocked"), "in the way").unwrap();

    let ctx = AppContext::new(config);
    let err = ctx.worktrees.create("blocked", None).await.unwrap_err();
    assert!(matches!(err, Error::GitOperation(_)));
    assert!(ctx.worktrees.list().await.is_empty());
    assert!(ctx.worktrees.get("blocked").await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn start_stop_round_trip() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();
    let mut config = test_config(tmp.path());
    config.start_command = Some("sleep 30".to_string());

    let ctx = AppContext::new(config);
    ctx.worktrees.create("dev", None).await.unwrap();

    let info = ctx.worktrees.start("dev").await.unwrap();
    assert!(matches!(
        info.status,
        WorktreeStatus::Starting | WorktreeStatus::Running
    ));
    assert!(info.pid.is_some());
    // No discovered ports — no probe, immediate promotion.
    assert!(wait_for_status(&ctx, "dev", WorktreeStatus::Running, 5).await);

    ctx.worktrees.stop("dev").await.unwrap();
    let info = ctx.worktrees.get("dev").await.unwrap();
    assert_eq!(info.status, WorktreeStatus::Stopped);
    assert!(info.pid.is_none());

    // Stopping a stopped worktree is a no-op.
    ctx.worktrees.stop("dev").await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn crash_transitions_to_error_and_releases_offset() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();
    let mut config = test_config(tmp.path());
    config.start_command = Some("exit 7".to_string());
    config.ports.discovered_ports = vec![3000];
    config.ports.offset_step = 10;

    let ctx = AppContext::new(config);
    ctx.worktrees.create("crashy", None).await.unwrap();
    ctx.worktrees.start("crashy").await.unwrap();

    assert!(wait_for_status(&ctx, "crashy", WorktreeStatus::Error, 5).await);
    let info = ctx.worktrees.get("crashy").await.unwrap();
    assert!(info.last_error.as_deref().unwrap().contains("7"));
    assert!(info.offset.is_none());
    assert!(!ctx.allocator.is_held(10), "crash must release the offset");

    let kinds = activity_kinds(&ctx, "crashy").await;
    assert!(kinds.contains(&"crashed".to_string()));
}

#[cfg(unix)]
#[tokio::test]
async fn concurrent_start_rejects_second_caller() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();
    let mut config = test_config(tmp.path());
    config.start_command = Some("sleep 30".to_string());

    let ctx = AppContext::new(config);
    ctx.worktrees.create("busy", None).await.unwrap();

    let (a, b) = tokio::join!(ctx.worktrees.start("busy"), ctx.worktrees.start("busy"));
    let oks = [a.is_ok(), b.is_ok()].iter().filter(|x| **x).count();
    assert_eq!(oks, 1, "exactly one start must win");
    let err = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(err, Error::OperationInProgress(_)));

    wait_for_status(&ctx, "busy", WorktreeStatus::Running, 5).await;
    ctx.worktrees.stop("busy").await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn remove_while_running_stops_first() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();
    let mut config = test_config(tmp.path());
    config.start_command = Some("sleep 30".to_string());

    let ctx = AppContext::new(config);
    let info = ctx.worktrees.create("doomed", None).await.unwrap();
    let path = info.path.clone();
    ctx.worktrees.start("doomed").await.unwrap();
    assert!(wait_for_status(&ctx, "doomed", WorktreeStatus::Running, 5).await);

    ctx.worktrees.remove("doomed").await.unwrap();
    assert_eq!(
        ctx.worktrees.get("doomed").await.unwrap().status,
        WorktreeStatus::Removed
    );
    assert!(ctx.worktrees.list().await.is_empty());
    assert!(!path.exists());

    // The stop event lands strictly before the removal event.
    let kinds = activity_kinds(&ctx, "doomed").await;
    let stopped = kinds.iter().position(|k| k == "stopped").unwrap();
    let removed = kinds.iter().position(|k| k == "removed").unwrap();
    assert!(stopped < removed);
}

#[cfg(unix)]
#[tokio::test]
async fn virtualized_start_holds_offset_until_stop() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();
    let mut config = test_config(tmp.path());
    config.start_command = Some("sleep 30".to_string());
    config.ports.discovered_ports = vec![3000];
    config.ports.offset_step = 10;

    let ctx = AppContext::new(config);
    ctx.worktrees.create("virt", None).await.unwrap();
    let info = ctx.worktrees.start("virt").await.unwrap();

    assert_eq!(info.offset, Some(10));
    assert_eq!(info.ports, vec![3010]);
    assert!(ctx.allocator.is_held(10));

    // Nothing answers 3010; the bounded probe times out and promotes anyway.
    assert!(wait_for_status(&ctx, "virt", WorktreeStatus::Running, 10).await);

    ctx.worktrees.stop("virt").await.unwrap();
    assert!(!ctx.allocator.is_held(10));
}

#[tokio::test]
async fn externally_deleted_checkout_fails_start_into_error() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();
    let mut config = test_config(tmp.path());
    config.start_command = Some("sleep 30".to_string());

    let ctx = AppContext::new(config);
    let info = ctx.worktrees.create("vanished", None).await.unwrap();
    std::fs::remove_dir_all(&info.path).unwrap();

    let err = ctx.worktrees.start("vanished").await.unwrap_err();
    assert!(matches!(err, Error::GitOperation(_)));
    assert_eq!(
        ctx.worktrees.get("vanished").await.unwrap().status,
        WorktreeStatus::Error
    );
}

#[tokio::test]
async fn start_requires_a_start_command() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();

    let ctx = AppContext::new(test_config(tmp.path()));
    ctx.worktrees.create("unconfigured", None).await.unwrap();
    let err = ctx.worktrees.start("unconfigured").await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn unknown_worktree_is_not_found() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();

    let ctx = AppContext::new(test_config(tmp.path()));
    assert!(matches!(
        ctx.worktrees.get("nope").await.unwrap_err(),
        Error::WorktreeNotFound(_)
    ));
    assert!(matches!(
        ctx.worktrees.start("nope").await.unwrap_err(),
        Error::WorktreeNotFound(_)
    ));
}

#[tokio::test]
async fn rename_updates_branch_and_directory() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();

    let ctx = AppContext::new(test_config(tmp.path()));
    let info = ctx.worktrees.create("old-branch", None).await.unwrap();
    let old_path = info.path.clone();

    let info = ctx
        .worktrees
        .rename("old-branch", Some("fresh name"), Some("new-branch"))
        .await
        .unwrap();
    assert_eq!(info.name, "fresh name");
    assert_ne!(info.path, old_path);
    assert!(info.path.is_dir());
    assert!(!old_path.exists());

    let wt_repo = git2::Repository::open(&info.path).unwrap();
    assert_eq!(wt_repo.head().unwrap().shorthand(), Some("new-branch"));
}

#[tokio::test]
async fn linkage_is_metadata_only() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();

    let ctx = AppContext::new(test_config(tmp.path()));
    ctx.worktrees.create("linked", None).await.unwrap();
    let info = ctx
        .worktrees
        .set_linkage("linked", Some("#42".to_string()), None)
        .await
        .unwrap();
    assert_eq!(info.issue.as_deref(), Some("#42"));
    assert_eq!(info.status, WorktreeStatus::Stopped);
}

#[tokio::test]
async fn bootstrap_recovers_existing_checkouts_as_stopped() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();

    {
        let ctx = AppContext::new(test_config(tmp.path()));
        ctx.worktrees.create("survivor", None).await.unwrap();
    }

    // Fresh context, as after a daemon restart.
    let ctx: Arc<AppContext> = AppContext::new(test_config(tmp.path()));
    ctx.worktrees.bootstrap().await.unwrap();

    let list = ctx.worktrees.list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, "survivor");
    assert_eq!(list[0].status, WorktreeStatus::Stopped);
    assert_eq!(list[0].branch, "survivor");
}

#[cfg(unix)]
#[tokio::test]
async fn rename_is_rejected_while_running() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();
    let mut config = test_config(tmp.path());
    config.start_command = Some("sleep 30".to_string());

    let ctx = AppContext::new(config);
    let before = ctx.worktrees.create("busy", None).await.unwrap();
    ctx.worktrees.start("busy").await.unwrap();
    assert!(wait_for_status(&ctx, "busy", WorktreeStatus::Running, 5).await);

    let err = ctx
        .worktrees
        .rename("busy", Some("renamed-busy"), None)
        .await
        .unwrap_err();
    match err {
        Error::InvalidState { actual, required, .. } => {
            assert_eq!(actual, "running");
            assert_eq!(required, "stopped");
        }
        other => panic!("expected InvalidState, got {other:?}"),
    }

    // Nothing moved: same name, same directory.
    let info = ctx.worktrees.get("busy").await.unwrap();
    assert_eq!(info.name, before.name);
    assert_eq!(info.path, before.path);
    assert!(info.path.is_dir());

    ctx.worktrees.stop("busy").await.unwrap();
}

#[tokio::test]
async fn half_removed_checkout_blocks_branch_reuse() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).unwrap();

    let ctx = AppContext::new(test_config(tmp.path()));
    let first = ctx.worktrees.create("shared", None).await.unwrap();

    // Delete the checkout directory behind git's back; the registration
    // stays and keeps the branch checked out.
    std::fs::remove_dir_all(&first.path).unwrap();

    // Reusing the branch attaches, fails, and falls back to a branch
    // force-reset — which the live registration also refuses. The combined
    // failure must surface as a git error and leave no new registration.
    let err = ctx
        .worktrees
        .create("shared", Some("shared-two"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::GitOperation(_)));
    assert!(ctx.worktrees.get("shared-two").await.is_err());
    assert_eq!(ctx.worktrees.list().await.len(), 1);

    let kinds = activity_kinds(&ctx, "shared-two").await;
    assert!(kinds.iter().any(|k| k == "creation_failed"));
}
