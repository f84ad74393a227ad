//! Blocking git2 helpers. Every function here is called through
//! `tokio::task::spawn_blocking`; libgit2 does real I/O and must stay off
//! the async threads.

use std::path::Path;

use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::worktree::manager::GitStatusSnapshot;

/// Create the git worktree for `branch_name` at `wt_path`.
///
/// Three-tier fallback:
/// 1. create `branch_name` fresh from the base branch;
/// 2. the branch already exists, attach to it as-is;
/// 3. attaching failed too (stale ref, half-removed registration) —
///    force-reset the branch pointer to the base and retry once.
pub fn create_worktree(
    repo_path: &Path,
    base_branch: &str,
    branch_name: &str,
    wt_name: &str,
    wt_path: &Path,
) -> Result<()> {
    let repo = Repository::open(repo_path).map_err(|e| Error::git("open repository", e))?;
    let base_commit = resolve_base_commit(&repo, base_branch)?;

    let branch = match repo.branch(branch_name, &base_commit, false) {
        Ok(b) => b,
        Err(e) if e.code() == git2::ErrorCode::Exists => {
            debug!(branch = branch_name, "branch already exists, attaching");
            repo.find_branch(branch_name, BranchType::Local)
                .map_err(|e| Error::git("find existing branch", e))?
        }
        Err(e) => return Err(Error::git("create branch", e)),
    };

    let first_err = {
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch.get()));
        match repo.worktree(wt_name, wt_path, Some(&opts)) {
            Ok(_) => return Ok(()),
            Err(e) => e,
        }
    };
    drop(branch);

    warn!(
        branch = branch_name,
        err = %first_err.message(),
        "worktree attach failed — force-resetting branch and retrying"
    );
    let branch = repo
        .branch(branch_name, &base_commit, true)
        .map_err(|e| Error::git("force-reset branch", e))?;
    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(branch.get()));
    repo.worktree(wt_name, wt_path, Some(&opts)).map_err(|e| {
        Error::GitOperation(format!(
            "all creation fallbacks exhausted for '{branch_name}': {} / {}",
            first_err.message(),
            e.message()
        ))
    })?;
    Ok(())
}

fn resolve_base_commit<'r>(repo: &'r Repository, base_branch: &str) -> Result<git2::Commit<'r>> {
    if let Ok(branch) = repo.find_branch(base_branch, BranchType::Local) {
        return branch
            .get()
            .peel_to_commit()
            .map_err(|e| Error::git("peel base branch", e));
    }
    // Base branch absent (fresh repo, different default name) — fork from HEAD.
    repo.head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|e| Error::git("resolve HEAD", e))
}

/// Remove the registration and directory of the worktree named `wt_name`,
/// then opportunistically prune any other stale registrations.
pub fn remove_worktree(repo_path: &Path, wt_name: &str, wt_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path).map_err(|e| Error::git("open repository", e))?;

    match repo.find_worktree(wt_name) {
        Ok(wt) => {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            wt.prune(Some(&mut opts))
                .map_err(|e| Error::git("prune worktree", e))?;
        }
        Err(_) => {
            debug!(name = wt_name, "worktree was not registered, directory cleanup only");
        }
    }

    let names = repo.worktrees().map_err(|e| Error::git("list worktrees", e))?;
    for name in names.iter().flatten() {
        let wt = match repo.find_worktree(name) {
            Ok(w) => w,
            Err(_) => continue,
        };
        if wt.validate().is_err() {
            debug!(name, "pruning stale worktree registration");
            let mut opts = WorktreePruneOptions::new();
            opts.working_tree(true);
            let _ = wt.prune(Some(&mut opts));
        }
    }

    // Directory cleanup always runs, registered or not.
    if wt_path.exists() {
        std::fs::remove_dir_all(wt_path)
            .map_err(|e| Error::GitOperation(format!("remove worktree directory: {e}")))?;
    }
    Ok(())
}

/// Refresh the status snapshot for a checked-out worktree.
///
/// Upstream and base comparisons are best-effort: a branch without an
/// upstream simply reports 0/0 rather than failing the reconcile pass.
pub fn status_snapshot(wt_path: &Path, base_branch: &str) -> Result<GitStatusSnapshot> {
    let repo = Repository::open(wt_path).map_err(|e| Error::git("open worktree", e))?;

    let mut opts = git2::StatusOptions::new();
    opts.include_untracked(true);
    let statuses = repo
        .statuses(Some(&mut opts))
        .map_err(|e| Error::git("worktree status", e))?;
    let has_uncommitted = !statuses.is_empty();

    let head = repo.head().map_err(|e| Error::git("resolve HEAD", e))?;
    let local_oid = head
        .target()
        .ok_or_else(|| Error::GitOperation("HEAD is not a direct reference".to_string()))?;

    let (ahead, behind) = head
        .shorthand()
        .and_then(|name| repo.find_branch(name, BranchType::Local).ok())
        .and_then(|b| b.upstream().ok())
        .and_then(|up| up.get().target())
        .and_then(|up_oid| repo.graph_ahead_behind(local_oid, up_oid).ok())
        .unwrap_or((0, 0));

    let ahead_of_base = repo
        .find_branch(base_branch, BranchType::Local)
        .ok()
        .and_then(|b| b.get().target())
        .and_then(|base_oid| repo.graph_ahead_behind(local_oid, base_oid).ok())
        .map(|(a, _)| a)
        .unwrap_or(0);

    Ok(GitStatusSnapshot {
        has_uncommitted,
        ahead,
        behind,
        ahead_of_base,
    })
}

/// Rename the branch the worktree has checked out and repoint its HEAD.
pub fn rename_branch(wt_path: &Path, new_branch: &str) -> Result<()> {
    let repo = Repository::open(wt_path).map_err(|e| Error::git("open worktree", e))?;
    let head = repo.head().map_err(|e| Error::git("resolve HEAD", e))?;
    let current = head
        .shorthand()
        .ok_or_else(|| Error::GitOperation("cannot rename a detached HEAD".to_string()))?
        .to_string();

    let mut branch = repo
        .find_branch(&current, BranchType::Local)
        .map_err(|e| Error::git("find current branch", e))?;
    branch
        .rename(new_branch, false)
        .map_err(|e| Error::git("rename branch", e))?;
    repo.set_head(&format!("refs/heads/{new_branch}"))
        .map_err(|e| Error::git("repoint HEAD", e))?;
    Ok(())
}

/// Move a stopped worktree's directory and repair the admin `gitdir` link.
pub fn move_worktree(repo_path: &Path, wt_name: &str, old_path: &Path, new_path: &Path) -> Result<()> {
    if new_path.exists() {
        return Err(Error::GitOperation(format!(
            "target directory already exists: {}",
            new_path.display()
        )));
    }

    let repo = Repository::open(repo_path).map_err(|e| Error::git("open repository", e))?;
    repo.find_worktree(wt_name)
        .map_err(|e| Error::git("find worktree registration", e))?;

    std::fs::rename(old_path, new_path)
        .map_err(|e| Error::GitOperation(format!("move worktree directory: {e}")))?;

    // The admin area tracks the checkout location through this one file.
    let gitdir_file = repo.path().join("worktrees").join(wt_name).join("gitdir");
    std::fs::write(
        &gitdir_file,
        format!("{}\n", new_path.join(".git").display()),
    )
    .map_err(|e| Error::GitOperation(format!("repair gitdir link: {e}")))?;
    Ok(())
}
