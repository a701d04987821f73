//! # Branches
//!
//! A branch is a separate app whose volume was seeded from a snapshot of a
//! base app. Its identity is derived from the two names:
//!
//! ```text
//! derive_app_name("My-App", "Feature 1") == "my-app--feature-1"
//! ```
//!
//! The fork relationship lives in the branch app's `branch.json`:
//!
//! ```json
//! {
//!   "base_app": "my-app",
//!   "branch": "feature-1",
//!   "created_at": "2025-01-01T12:00:00Z",
//!   "base_snapshot_ref": "branch-base-20250101120000",
//!   "shadow_repo": "/var/lib/magikvol/git/my-app.git"
//! }
//! ```
//!
//! `base_snapshot_ref` is the merge base used by
//! [`ShadowMergeEngine`](crate::merge::ShadowMergeEngine). Every branch of one
//! base shares the same shadow repository.

use crate::constants::{
    BRANCH_META_FILE_NAME, BRANCH_SEPARATOR, MAIN_REF, MAX_APP_NAME_LEN, validate_app_name,
};
use crate::error::{Error, Result};
use crate::snapshot::{SnapshotManager, SnapshotTag};
use crate::tree::replace_tree;
use crate::volume::{VolumeStore, read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Names
// =============================================================================

/// Normalizes an app or branch name to a DNS-label-safe form.
///
/// Trims, lowercases and turns whitespace and `_` into `-`, then validates.
pub fn normalize_name(raw: &str) -> Result<String> {
    let name: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '_' { '-' } else { c })
        .collect();

    validate_app_name(&name).map_err(|reason| Error::InvalidName {
        name: raw.to_string(),
        reason: reason.to_string(),
    })?;
    Ok(name)
}

/// Derives the app name of `branch` forked from `base`.
///
/// # Errors
///
/// [`Error::InvalidName`] if either part is invalid, the branch is named
/// `main`, or the result is longer than 63 characters. Long names are never
/// truncated.
pub fn derive_app_name(base: &str, branch: &str) -> Result<String> {
    let base = normalize_name(base)?;
    let branch = normalize_name(branch)?;
    if branch == MAIN_REF {
        return Err(Error::InvalidName {
            name: branch,
            reason: format!("'{MAIN_REF}' is reserved"),
        });
    }

    let derived = format!("{base}{BRANCH_SEPARATOR}{branch}");
    if derived.len() > MAX_APP_NAME_LEN {
        return Err(Error::InvalidName {
            name: derived,
            reason: format!("derived app name exceeds {MAX_APP_NAME_LEN} characters"),
        });
    }
    Ok(derived)
}

// =============================================================================
// Metadata
// =============================================================================

/// Persisted fork relationship of a branch app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchMeta {
    /// Normalized base app name.
    pub base_app: String,
    /// Normalized branch name.
    pub branch: String,
    /// Fork time.
    pub created_at: DateTime<Utc>,
    /// Snapshot tag of the base taken at fork time.
    pub base_snapshot_ref: String,
    /// Shared shadow repository; older records may lack it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_repo: Option<PathBuf>,
}

/// Reads branch metadata; `None` if the file does not exist.
pub fn read_branch_meta(path: &Path) -> Result<Option<BranchMeta>> {
    read_json(path)
}

/// Writes branch metadata atomically.
pub fn write_branch_meta(path: &Path, meta: &BranchMeta) -> Result<()> {
    write_json_atomic(path, meta)
}

/// Lists metadata of every branch of `base` found under `apps_dir`, sorted
/// by branch name. Unreadable records are skipped.
pub fn list_branch_metas_at(apps_dir: &Path, base: &str) -> Result<Vec<BranchMeta>> {
    let entries = match fs::read_dir(apps_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut metas = Vec::new();
    for entry in entries {
        let path = entry?.path().join(BRANCH_META_FILE_NAME);
        match read_branch_meta(&path) {
            Ok(Some(meta)) if meta.base_app == base => metas.push(meta),
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable branch metadata"),
        }
    }
    metas.sort_by(|a, b| a.branch.cmp(&b.branch));
    Ok(metas)
}

// =============================================================================
// Branch Manager
// =============================================================================

/// Creates, resolves and deletes branch apps.
pub struct BranchManager {
    snapshots: Arc<SnapshotManager>,
}

impl BranchManager {
    /// Creates a branch manager.
    pub fn new(snapshots: Arc<SnapshotManager>) -> Self {
        Self { snapshots }
    }

    /// Returns the snapshot manager.
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    fn volumes(&self) -> &VolumeStore {
        self.snapshots.volumes()
    }

    /// Forks `branch` off `base` and returns the new branch metadata.
    ///
    /// The base is snapshotted under a `branch-base-*` tag, a fresh volume is
    /// created for the derived app and the snapshot's content is streamed
    /// into it.
    ///
    /// # Errors
    ///
    /// - [`Error::BranchExists`] if the derived app already has metadata or a
    ///   backing file
    /// - [`Error::ContainerNotFound`] / [`Error::VolumeNotFound`] if the base
    ///   is not set up
    pub fn create_branch(&self, base: &str, branch: &str) -> Result<BranchMeta> {
        let derived = derive_app_name(base, branch)?;
        let base = normalize_name(base)?;
        let branch = normalize_name(branch)?;
        let volumes = self.volumes();
        let settings = volumes.settings();

        let target = volumes.config_for(&derived);
        if target.branch_meta_path.exists() || target.backing_file.exists() {
            return Err(Error::BranchExists(derived));
        }

        let container = settings.container_name(&base);
        if !self.snapshots.runtime().exists(&container)? {
            return Err(Error::ContainerNotFound(container));
        }
        let base_cfg = self.snapshots.require_volume(&base)?;

        let created_at = Utc::now();
        let tag = self.snapshots.snapshot_with_tag(
            &container,
            &base,
            &SnapshotTag::branch_base_at(created_at),
        )?;

        let cfg = volumes
            .ensure_volume(&derived, true)?
            .ok_or_else(|| Error::Internal(format!("volume for {derived} was not created")))?;
        replace_tree(&base_cfg.snapshot_path(&tag), &cfg.mount_dir, None)?;

        // Re-run the bulk ACL pass over the copied tree.
        if cfg.acl_marker.exists() {
            fs::remove_file(&cfg.acl_marker)?;
        }
        volumes.ensure_volume(&derived, false)?;

        let meta = BranchMeta {
            shadow_repo: Some(settings.shadow_repo_for(&base)),
            base_app: base,
            branch,
            created_at,
            base_snapshot_ref: tag,
        };
        write_branch_meta(&cfg.branch_meta_path, &meta)?;

        info!(app = %derived, base = %meta.base_app, tag = %meta.base_snapshot_ref, "branch created");
        Ok(meta)
    }

    /// Removes the container, volume and metadata of a branch.
    pub fn delete_branch(&self, base: &str, branch: &str) -> Result<()> {
        let derived = derive_app_name(base, branch)?;
        self.delete_app(&derived)
    }

    /// Deletes a branch addressed by its derived app name.
    pub fn delete_branch_for_app(&self, app: &str) -> Result<()> {
        let meta = self.resolve_app(app)?;
        self.delete_branch(&meta.base_app, &meta.branch)
    }

    fn delete_app(&self, derived: &str) -> Result<()> {
        let volumes = self.volumes();
        let cfg = volumes.config_for(derived);
        let container = volumes.settings().container_name(derived);
        let runtime = self.snapshots.runtime();

        let has_container = runtime.exists(&container)?;
        if !has_container && !cfg.base_dir.exists() {
            return Err(Error::BranchNotFound(derived.to_string()));
        }

        if has_container {
            runtime.remove(&container)?;
        }
        volumes.delete_volume(derived)?;
        info!(app = %derived, "branch deleted");
        Ok(())
    }

    /// Returns the stored metadata of a branch app.
    ///
    /// # Errors
    ///
    /// [`Error::BranchNotFound`] if `app` has no branch metadata.
    pub fn resolve_app(&self, app: &str) -> Result<BranchMeta> {
        self.read_meta(app)?
            .ok_or_else(|| Error::BranchNotFound(app.to_string()))
    }

    /// Reads the branch metadata of `app`, if any.
    pub fn read_meta(&self, app: &str) -> Result<Option<BranchMeta>> {
        read_branch_meta(&self.volumes().config_for(app).branch_meta_path)
    }

    /// Writes the branch metadata of `app`.
    pub fn write_meta(&self, app: &str, meta: &BranchMeta) -> Result<()> {
        write_branch_meta(&self.volumes().config_for(app).branch_meta_path, meta)
    }

    /// Lists the branches of `base`, sorted by branch name.
    pub fn list_branches(&self, base: &str) -> Result<Vec<BranchMeta>> {
        let base = normalize_name(base)?;
        list_branch_metas_at(&self.volumes().settings().apps_dir, &base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Feature 1 ").unwrap(), "feature-1");
        assert_eq!(normalize_name("my_app").unwrap(), "my-app");
        assert!(normalize_name("").is_err());
        assert!(normalize_name("-x").is_err());
        assert!(normalize_name("x-").is_err());
        assert!(normalize_name("a.b").is_err());
    }

    #[test]
    fn test_derive_app_name() {
        assert_eq!(
            derive_app_name("My-App", "Feature 1").unwrap(),
            "my-app--feature-1"
        );
    }

    #[test]
    fn test_derive_rejects_long_names() {
        let base = "a".repeat(40);
        let branch = "b".repeat(22);
        let err = derive_app_name(&base, &branch).unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));

        // Exactly 63 is fine.
        let branch = "b".repeat(21);
        assert_eq!(derive_app_name(&base, &branch).unwrap().len(), 63);
    }

    #[test]
    fn test_derive_rejects_main() {
        assert!(derive_app_name("web", "Main").is_err());
    }
}
