//! # Shadow Merge
//!
//! Applies a branch app back onto its base by borrowing git's three-way
//! merge. Neither live tree is a repository; the history is synthesized for
//! every apply:
//!
//! ```text
//!            base ── fork-point snapshot (common ancestor)
//!           /    \
//!   main ─ base live tree      branch ─ branch live tree
//!           \    /
//!            merge (in a throwaway worktree)
//!              │
//!              └──► written onto the base live tree
//! ```
//!
//! Only the shadow repository survives an apply. It is bare, shared by all
//! branches of one base, and lives at `<shadow_dir>/<base>.git`.
//!
//! ## Failure Behavior
//!
//! The base live tree is written only after the merge succeeded. A conflict
//! surfaces git's own output in [`Error::MergeConflict`], the in-progress
//! merge in the shadow repository is aborted, and the base is unchanged.
//! A fresh numbered snapshot of the base is taken before any of this starts.
//!
//! ## What Survives an Apply
//!
//! Every regular file, symlink and dotfile is committed, including files a
//! `.gitignore` in the tree would exclude. Things git cannot carry are lost
//! from the base's working subdirectory on a successful apply:
//!
//! - nested `.git` directories (only a top-level `.git` is left in place);
//!   the files around them are merged as ordinary content
//! - empty directories

use crate::branch::{BranchManager, derive_app_name, normalize_name, write_branch_meta};
use crate::constants::{MAIN_REF, SHADOW_COMMITTER_EMAIL, SHADOW_COMMITTER_NAME};
use crate::error::{Error, Result};
use crate::tree::replace_tree;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Top-level entry excluded when copying trees in and out of git.
const GIT_DIR_NAME: &str = ".git";

// =============================================================================
// Git Runner
// =============================================================================

/// One git invocation context.
///
/// Every call disables ownership checks and carries a fixed committer so the
/// privileged host process can work on trees owned by the container user.
struct Git {
    cwd: PathBuf,
    git_dir: Option<PathBuf>,
    work_tree: Option<PathBuf>,
}

impl Git {
    fn in_dir(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            git_dir: None,
            work_tree: None,
        }
    }

    fn bare(repo: &Path) -> Self {
        Self {
            cwd: repo.to_path_buf(),
            git_dir: Some(repo.to_path_buf()),
            work_tree: None,
        }
    }

    fn with_work_tree(repo: &Path, work_tree: &Path) -> Self {
        Self {
            cwd: work_tree.to_path_buf(),
            git_dir: Some(repo.to_path_buf()),
            work_tree: Some(work_tree.to_path_buf()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.cwd)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .env_remove("GIT_INDEX_FILE")
            .args(["-c", "safe.directory=*"])
            .arg("-c")
            .arg(format!("user.name={SHADOW_COMMITTER_NAME}"))
            .arg("-c")
            .arg(format!("user.email={SHADOW_COMMITTER_EMAIL}"))
            .args(["-c", "commit.gpgsign=false"])
            .args(["-c", "core.excludesFile=/dev/null"])
            .arg("-c")
            .arg(format!("init.defaultBranch={MAIN_REF}"));
        if let Some(dir) = &self.git_dir {
            cmd.arg("--git-dir").arg(dir);
        }
        if let Some(dir) = &self.work_tree {
            cmd.arg("--work-tree").arg(dir);
        }
        cmd
    }

    fn output<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command()
            .args(args)
            .output()
            .map_err(|source| Error::Spawn {
                program: "git".to_string(),
                source,
            })
    }

    fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(Error::command_failed("git", &combined(&output), output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Replaces the worktree with `src` and commits everything, ignored
    /// files included.
    ///
    /// The index is emptied first. Copied files carry whole-second mtimes, so
    /// a stale index entry can hide a same-size rewrite from `git add`.
    fn commit_tree(&self, src: &Path, message: &str) -> Result<()> {
        replace_tree(src, &self.cwd, Some(GIT_DIR_NAME))?;
        self.run(["read-tree", "--empty"])?;
        self.run(["add", "-A", "--force"])?;
        self.run(["commit", "-q", "--allow-empty", "-m", message])?;
        Ok(())
    }
}

fn combined(output: &Output) -> Vec<u8> {
    let mut bytes = output.stdout.clone();
    bytes.extend_from_slice(&output.stderr);
    bytes
}

// =============================================================================
// Shadow Repository
// =============================================================================

/// Creates the bare shadow repository at `repo`, or verifies an existing
/// one.
pub fn ensure_shadow_repo(repo: &Path) -> Result<()> {
    if repo.exists() {
        Git::bare(repo).run(["rev-parse", "--git-dir"])?;
        return Ok(());
    }

    let parent = repo.parent().unwrap_or(Path::new("/"));
    fs::create_dir_all(parent)?;
    Git::in_dir(parent).run([
        OsStr::new("init"),
        OsStr::new("-q"),
        OsStr::new("--bare"),
        repo.as_os_str(),
    ])?;

    let git = Git::bare(repo);
    git.run(["config", "user.name", SHADOW_COMMITTER_NAME])?;
    git.run(["config", "user.email", SHADOW_COMMITTER_EMAIL])?;
    info!(repo = %repo.display(), "shadow repository created");
    Ok(())
}

/// Merges `theirs` into `main` using `fork` as the common ancestor, then
/// writes the result onto `main`.
///
/// The three trees are committed as `base`, `main` and `<branch>` in a
/// throwaway repository and force-pushed into `repo`. The merge itself runs
/// in a second throwaway worktree against `repo`. `main` is only written
/// after a clean merge; top-level `.git` entries are never touched.
///
/// # Errors
///
/// [`Error::MergeConflict`] with git's output when the merge fails.
pub fn merge_trees(repo: &Path, branch: &str, fork: &Path, main: &Path, theirs: &Path) -> Result<()> {
    let scratch = TempDir::new()?;
    let git = Git::in_dir(scratch.path());
    git.run(["init", "-q"])?;

    git.commit_tree(fork, "base")?;
    let base_commit = git.run(["rev-parse", "HEAD"])?.trim().to_string();

    git.run(["checkout", "-q", "-B", MAIN_REF])?;
    git.commit_tree(main, "main")?;

    git.run(["checkout", "-q", "-B", branch, base_commit.as_str()])?;
    git.commit_tree(theirs, "branch")?;

    git.run([
        OsStr::new("push"),
        OsStr::new("-q"),
        OsStr::new("--force"),
        repo.as_os_str(),
        OsStr::new(&format!("{MAIN_REF}:refs/heads/{MAIN_REF}")),
        OsStr::new(&format!("HEAD:refs/heads/{branch}")),
    ])?;
    debug!(repo = %repo.display(), branch, "synthesized history pushed");

    let worktree = TempDir::new()?;
    let shadow = Git::with_work_tree(repo, worktree.path());
    shadow.run(["checkout", "-q", "-f", branch])?;

    let merged = shadow.output(["merge", "--no-edit", MAIN_REF])?;
    if !merged.status.success() {
        if let Err(e) = shadow.run(["merge", "--abort"]) {
            debug!(error = %e, "merge --abort failed");
        }
        let text = String::from_utf8_lossy(&combined(&merged)).trim().to_string();
        return Err(Error::MergeConflict { output: text });
    }

    shadow.run(["branch", "-f", MAIN_REF, branch])?;
    replace_tree(worktree.path(), main, Some(GIT_DIR_NAME))?;
    Ok(())
}

// =============================================================================
// Merge Engine
// =============================================================================

/// Applies branch apps back onto their base.
pub struct ShadowMergeEngine {
    branches: Arc<BranchManager>,
}

impl ShadowMergeEngine {
    /// Creates a merge engine.
    pub fn new(branches: Arc<BranchManager>) -> Self {
        Self { branches }
    }

    /// Merges the working directory of `branch` into `base`.
    ///
    /// # Errors
    ///
    /// - [`Error::BranchNotFound`] / [`Error::BranchMismatch`] for missing or
    ///   inconsistent metadata
    /// - [`Error::MergeBaseMissing`] when the fork-point snapshot is gone
    /// - [`Error::MergeConflict`] when both sides changed the same content
    pub fn apply_branch(&self, base: &str, branch: &str) -> Result<()> {
        let derived = derive_app_name(base, branch)?;
        let base = normalize_name(base)?;
        let branch = normalize_name(branch)?;

        let snapshots = self.branches.snapshots();
        let volumes = snapshots.volumes();
        let settings = volumes.settings();

        let mut meta = self.branches.resolve_app(&derived)?;
        if meta.base_app != base || meta.branch != branch {
            return Err(Error::BranchMismatch {
                app: derived,
                expected: format!("{base}/{branch}"),
                found: format!("{}/{}", meta.base_app, meta.branch),
            });
        }
        let fork_tag = meta.base_snapshot_ref.trim().to_string();
        if fork_tag.is_empty() {
            return Err(Error::MergeBaseMissing {
                tag: "(none)".to_string(),
            });
        }

        let base_cfg = snapshots.require_volume(&base)?;
        let branch_cfg = snapshots.require_volume(&derived)?;

        let container = settings.container_name(&base);
        if !snapshots.runtime().exists(&container)? {
            return Err(Error::ContainerNotFound(container));
        }

        let fork = base_cfg.snapshot_path(&fork_tag).join(&settings.work_subdir);
        if !fork.is_dir() {
            return Err(Error::MergeBaseMissing { tag: fork_tag });
        }

        let restore_point = snapshots.create_snapshot(&container, &base)?;

        let repo = match meta.shadow_repo.clone() {
            Some(repo) => repo,
            None => {
                let repo = settings.shadow_repo_for(&base);
                meta.shadow_repo = Some(repo.clone());
                if let Err(e) = write_branch_meta(&branch_cfg.branch_meta_path, &meta) {
                    warn!(app = %derived, error = %e, "could not record shadow repository");
                }
                repo
            }
        };
        ensure_shadow_repo(&repo)?;

        let main = base_cfg.mount_dir.join(&settings.work_subdir);
        let theirs = branch_cfg.mount_dir.join(&settings.work_subdir);
        fs::create_dir_all(&main)?;
        fs::create_dir_all(&theirs)?;

        merge_trees(&repo, &branch, &fork, &main, &theirs)?;
        volumes.apply_ownership(&main)?;

        info!(
            base = %base,
            branch = %branch,
            restore_point = %restore_point,
            "branch applied"
        );
        Ok(())
    }

    /// Applies a branch addressed by its derived app name.
    pub fn apply_branch_for_app(&self, app: &str) -> Result<()> {
        let meta = self.branches.resolve_app(app)?;
        self.apply_branch(&meta.base_app, &meta.branch)
    }
}
