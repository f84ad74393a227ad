//! Secret-file seeding for fresh worktrees.
//!
//! Git worktrees share history but not untracked files, so `.env`-style
//! secrets the dev server needs are absent from a new checkout. After
//! creation we copy them over from the primary checkout, preserving relative
//! paths. Existing files in the destination are never overwritten.

use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directories never descended into while scanning for secret files.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "vendor",
    "dist",
    ".next",
    ".orchard",
];

fn is_secret_file(name: &str) -> bool {
    name.starts_with(".env") || name == ".npmrc" || name == ".dev.vars"
}

/// Copy secret files from `source_root` into `dest_root`, returning the
/// relative paths copied. Individual copy failures are logged and skipped,
/// so a partially seeded worktree is still usable.
pub fn seed_secrets(source_root: &Path, dest_root: &Path) -> Vec<String> {
    let mut copied = Vec::new();

    let walker = WalkDir::new(source_root).into_iter().filter_entry(|e| {
        !(e.file_type().is_dir()
            && e.file_name()
                .to_str()
                .is_some_and(|n| SKIP_DIRS.contains(&n)))
    });

    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = match entry.file_name().to_str() {
            Some(n) => n,
            None => continue,
        };
        if !is_secret_file(name) {
            continue;
        }
        let rel = match entry.path().strip_prefix(source_root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let dest = dest_root.join(rel);
        if dest.exists() {
            debug!(path = %rel.display(), "destination exists — not overwriting");
            continue;
        }
        if let Some(parent) = dest.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %rel.display(), err = %e, "cannot create directory for secret file");
                continue;
            }
        }
        match std::fs::copy(entry.path(), &dest) {
            Ok(_) => copied.push(rel.display().to_string()),
            Err(e) => warn!(path = %rel.display(), err = %e, "secret file copy failed"),
        }
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_env_files_preserving_relative_paths() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join(".env"), "PORT=3000\n").unwrap();
        std::fs::create_dir_all(src.path().join("apps/web")).unwrap();
        std::fs::write(src.path().join("apps/web/.env.local"), "KEY=x\n").unwrap();
        std::fs::write(src.path().join("readme.md"), "not a secret\n").unwrap();

        let mut copied = seed_secrets(src.path(), dst.path());
        copied.sort();
        assert_eq!(copied, vec![".env".to_string(), "apps/web/.env.local".to_string()]);
        assert!(dst.path().join("apps/web/.env.local").is_file());
        assert!(!dst.path().join("readme.md").exists());
    }

    #[test]
    fn never_overwrites_existing_files() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join(".npmrc"), "registry=upstream\n").unwrap();
        std::fs::write(dst.path().join(".npmrc"), "registry=local\n").unwrap();

        let copied = seed_secrets(src.path(), dst.path());
        assert!(copied.is_empty());
        let kept = std::fs::read_to_string(dst.path().join(".npmrc")).unwrap();
        assert_eq!(kept, "registry=local\n");
    }

    #[test]
    fn skips_dependency_and_build_directories() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("node_modules/pkg")).unwrap();
        std::fs::write(src.path().join("node_modules/pkg/.env"), "X=1\n").unwrap();

        assert!(seed_secrets(src.path(), dst.path()).is_empty());
    }
}
