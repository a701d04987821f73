//! # Volume Engine Constants
//!
//! Defines the on-disk layout, size limits, tag grammars and timeouts for
//! the volume engine. These constants are the **single source of truth**
//! for compatibility-significant names throughout the codebase.
//!
//! ## Compatibility
//!
//! File names, subvolume names and tag grammars below are persisted on disk.
//! Changing any of them orphans volumes, snapshots and shadow repositories
//! created by earlier builds. Treat them as a wire format.
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Uses the defaults as the base for [`Settings`](crate::config::Settings)
//! - [`crate::volume`]: Uses the layout names and backing-file size
//! - [`crate::snapshot`]: Uses the tag grammar prefixes
//! - [`crate::branch`]: Uses the name limits and metadata file name
//! - [`crate::session`]: Uses the readiness timeouts

use std::time::Duration;

// =============================================================================
// Default Host Paths
// =============================================================================
//
// Every app gets one directory under the apps directory. Shadow repositories
// live under a separate directory keyed by base app so that deleting a branch
// never touches the merge history shared with its siblings.
// =============================================================================

/// Default directory holding one subdirectory per app.
pub const DEFAULT_APPS_DIR: &str = "/var/lib/magikvol/apps";

/// Default directory holding one bare shadow repository per base app.
pub const DEFAULT_SHADOW_DIR: &str = "/var/lib/magikvol/git";

/// Default container image whose user owns the live tree.
pub const DEFAULT_IMAGE: &str = "magikvol:latest";

/// Default prefix joined with the app name to form its container name.
pub const DEFAULT_CONTAINER_PREFIX: &str = "magikvol-";

// =============================================================================
// Per-App Layout
// =============================================================================
//
// ```text
// <apps_dir>/<app>/
// ├── home.btrfs      sparse backing file
// ├── btrfs/          raw filesystem root (holds @home and @snapshots)
// ├── mount/          @home mounted read-write (the live tree)
// ├── snapshots/      @snapshots mounted (read-only snapshot copies)
// ├── meta.json       volume metadata
// ├── branch.json     branch metadata (forked apps only)
// └── acl.applied     marker written after the bulk ACL pass
// ```
// =============================================================================

/// Backing file name inside the app directory.
pub const BACKING_FILE_NAME: &str = "home.btrfs";

/// Raw filesystem root mount directory name.
pub const ROOT_MOUNT_DIR_NAME: &str = "btrfs";

/// Live subvolume mount directory name.
pub const LIVE_MOUNT_DIR_NAME: &str = "mount";

/// Snapshot container mount directory name.
pub const SNAPSHOTS_DIR_NAME: &str = "snapshots";

/// Volume metadata file name.
pub const VOLUME_META_FILE_NAME: &str = "meta.json";

/// Branch metadata file name.
pub const BRANCH_META_FILE_NAME: &str = "branch.json";

/// Marker recording that the bulk ACL pass has run.
pub const ACL_MARKER_FILE_NAME: &str = "acl.applied";

/// Live (writable) subvolume name.
pub const HOME_SUBVOLUME: &str = "@home";

/// Snapshot container subvolume name.
pub const SNAPSHOTS_SUBVOLUME: &str = "@snapshots";

/// Filesystem type the backing device must carry.
pub const FILESYSTEM_TYPE: &str = "btrfs";

/// Working subdirectory of the live tree; also the merge scope.
pub const WORK_SUBDIR: &str = "app";

/// Standard directories created (and owned by the container user) in every
/// live tree, relative to the live mount point.
pub const STANDARD_DIRS: &[&str] = &["app", ".local", ".local/services", ".local/logs"];

/// Directories that receive the access and default ACL on every ensure.
pub const ACL_DIRS: &[&str] = &["app", ".local"];

// =============================================================================
// Size Limits
// =============================================================================

/// Logical size of a new backing file (1 TB, sparse).
///
/// The file consumes no disk until written, so the size only bounds how far
/// the filesystem can grow.
pub const DEFAULT_BACKING_SIZE: u64 = 1_000_000_000_000;

/// Maximum number of paths passed to one `setfacl` invocation.
pub const ACL_BATCH_SIZE: usize = 128;

// =============================================================================
// Naming
// =============================================================================

/// Maximum app name length (one DNS label).
pub const MAX_APP_NAME_LEN: usize = 63;

/// Separator between base app and branch in a derived app name.
pub const BRANCH_SEPARATOR: &str = "--";

/// Shadow repository ref that tracks the base app.
pub const MAIN_REF: &str = "main";

/// Valid characters in a normalized app or branch name.
pub const APP_NAME_VALID_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-";

// =============================================================================
// Snapshot Tags
// =============================================================================

/// Prefix of user-visible snapshot tags (`v1`, `v2`, ...).
pub const NUMBERED_TAG_PREFIX: &str = "v";

/// Prefix of internal fork-point tags (`branch-base-20250101120000`).
pub const BRANCH_BASE_TAG_PREFIX: &str = "branch-base-";

/// `chrono` format of the fork-point tag timestamp (UTC).
pub const BRANCH_BASE_TAG_FORMAT: &str = "%Y%m%d%H%M%S";

/// Reference that resolves to the newest snapshot.
pub const LATEST_REF: &str = "latest";

// =============================================================================
// Timeouts
// =============================================================================

/// Total time to wait for a container to report running after a restore.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between readiness polls.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

// =============================================================================
// Shadow Repository Identity
// =============================================================================

/// Committer name recorded in shadow repositories.
pub const SHADOW_COMMITTER_NAME: &str = "magikvol";

/// Committer email recorded in shadow repositories.
pub const SHADOW_COMMITTER_EMAIL: &str = "magikvol@localhost";

// =============================================================================
// Name Validation Helper
// =============================================================================

/// Validates an already-normalized app or branch name.
///
/// Ensures the name:
/// - Is non-empty
/// - Does not exceed `MAX_APP_NAME_LEN`
/// - Does not start or end with `-`
/// - Only contains characters from `APP_NAME_VALID_CHARS`
#[inline]
#[must_use = "validation result must be checked before the name reaches a path"]
pub fn validate_app_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is required");
    }
    if name.len() > MAX_APP_NAME_LEN {
        return Err("name is too long");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("name must not start or end with '-'");
    }
    if !name.chars().all(|c| APP_NAME_VALID_CHARS.contains(c)) {
        return Err("name has invalid characters");
    }
    Ok(())
}
