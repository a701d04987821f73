//! # Snapshots
//!
//! Snapshots are read-only copies of the live subvolume stored under the
//! snapshot mount, one directory per tag. Two tag grammars coexist:
//!
//! | Grammar                         | Example                      | Use                    |
//! |---------------------------------|------------------------------|------------------------|
//! | `v<N>`, N ≥ 1                   | `v7`                         | user-visible versions  |
//! | `branch-base-<YYYYMMDDhhmmss>`  | `branch-base-20250101120000` | branch fork points     |
//!
//! Numbered tags grow strictly: a new tag is always `max + 1`, so a number
//! retired by volume surgery is never handed out again. Gaps are fine.
//!
//! ## Consistency
//!
//! The container is paused around the copy and resumed on every exit path.
//! Pending writes are flushed before the copy is taken.
//!
//! ## Restore
//!
//! [`SnapshotManager::restore_volume`] replaces the live subvolume with a
//! writable child of the chosen snapshot. Anything written since that
//! snapshot is gone; snapshot first if it matters.

use crate::constants::{
    BRANCH_BASE_TAG_FORMAT, BRANCH_BASE_TAG_PREFIX, LATEST_REF, NUMBERED_TAG_PREFIX,
};
use crate::container::{ContainerRuntime, PauseGuard};
use crate::error::{Error, Result};
use crate::volume::{VolumeConfig, VolumeStore};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Tag Grammar
// =============================================================================

/// A parsed snapshot tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotTag {
    /// User-visible `v<N>`.
    Numbered(u64),
    /// Internal `branch-base-<timestamp>` fork point (UTC).
    BranchBase(NaiveDateTime),
}

impl SnapshotTag {
    /// Parses either grammar. Returns `None` for anything else.
    ///
    /// Numbered tags are strict: lowercase `v`, decimal digits, no sign, no
    /// leading zero, value at least 1.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(digits) = name.strip_prefix(NUMBERED_TAG_PREFIX) {
            if digits.is_empty()
                || digits.starts_with('0')
                || !digits.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            return digits.parse::<u64>().ok().map(Self::Numbered);
        }
        if let Some(stamp) = name.strip_prefix(BRANCH_BASE_TAG_PREFIX) {
            if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            return NaiveDateTime::parse_from_str(stamp, BRANCH_BASE_TAG_FORMAT)
                .ok()
                .map(Self::BranchBase);
        }
        None
    }

    /// Returns a fork-point tag for the given instant.
    pub fn branch_base_at(at: DateTime<Utc>) -> Self {
        Self::BranchBase(at.naive_utc())
    }

    /// Returns the number of a numbered tag.
    pub fn number(&self) -> Option<u64> {
        match self {
            Self::Numbered(n) => Some(*n),
            Self::BranchBase(_) => None,
        }
    }
}

impl fmt::Display for SnapshotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numbered(n) => write!(f, "{NUMBERED_TAG_PREFIX}{n}"),
            Self::BranchBase(at) => write!(
                f,
                "{BRANCH_BASE_TAG_PREFIX}{}",
                at.format(BRANCH_BASE_TAG_FORMAT)
            ),
        }
    }
}

/// One snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Tag (directory name).
    pub tag: String,
    /// Parsed number for `v<N>` tags.
    pub number: Option<u64>,
    /// Creation time, if the filesystem reports one.
    pub created: Option<DateTime<Utc>>,
    /// Path through the snapshot mount.
    pub path: PathBuf,
}

/// Orders snapshots: numbered ascending, then everything else; ties by
/// creation time ascending, then by name.
pub fn compare_snapshots(a: &SnapshotInfo, b: &SnapshotInfo) -> Ordering {
    let numeric = match (a.number, b.number) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    numeric
        .then_with(|| a.created.cmp(&b.created))
        .then_with(|| a.tag.cmp(&b.tag))
}

/// Returns the tag `latest` resolves to: the highest number, or failing
/// that the most recently created entry (ties go to the greater name).
pub fn latest_tag(snapshots: &[SnapshotInfo]) -> Option<&str> {
    if let Some(top) = snapshots
        .iter()
        .filter(|s| s.number.is_some())
        .max_by_key(|s| s.number)
    {
        return Some(top.tag.as_str());
    }
    snapshots
        .iter()
        .max_by(|a, b| a.created.cmp(&b.created).then_with(|| a.tag.cmp(&b.tag)))
        .map(|s| s.tag.as_str())
}

/// Returns the next numbered tag: one past the highest existing number.
pub fn next_numbered_tag(snapshots: &[SnapshotInfo]) -> SnapshotTag {
    let max = snapshots.iter().filter_map(|s| s.number).max().unwrap_or(0);
    SnapshotTag::Numbered(max + 1)
}

// =============================================================================
// Snapshot Manager
// =============================================================================

/// Creates, lists, resolves and restores snapshots.
pub struct SnapshotManager {
    volumes: Arc<VolumeStore>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl SnapshotManager {
    /// Creates a manager over a volume store and container runtime.
    pub fn new(volumes: Arc<VolumeStore>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { volumes, runtime }
    }

    /// Returns the volume store.
    pub fn volumes(&self) -> &Arc<VolumeStore> {
        &self.volumes
    }

    /// Returns the container runtime.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Ensures the volume is mounted and returns its layout.
    pub(crate) fn require_volume(&self, app: &str) -> Result<VolumeConfig> {
        self.volumes
            .ensure_volume(app, false)?
            .ok_or_else(|| Error::VolumeNotFound(app.to_string()))
    }

    /// Takes the next numbered snapshot of `app`, pausing `container` while
    /// the copy is made. Returns the new tag.
    pub fn create_snapshot(&self, container: &str, app: &str) -> Result<String> {
        let cfg = self.require_volume(app)?;
        let tag = next_numbered_tag(&list_in(&cfg)?);
        self.snapshot_into(&cfg, container, &tag)
    }

    /// Takes a snapshot of `app` under an explicit tag.
    pub fn snapshot_with_tag(&self, container: &str, app: &str, tag: &SnapshotTag) -> Result<String> {
        let cfg = self.require_volume(app)?;
        self.snapshot_into(&cfg, container, tag)
    }

    fn snapshot_into(&self, cfg: &VolumeConfig, container: &str, tag: &SnapshotTag) -> Result<String> {
        let tag = tag.to_string();
        let dest = cfg.snapshot_path(&tag);
        if dest.exists() {
            return Err(Error::SnapshotExists(tag));
        }

        let host = self.volumes.host();
        {
            let _paused = PauseGuard::pause_if_running(self.runtime.as_ref(), container)?;
            host.flush();
            host.snapshot_subvolume(&cfg.mount_dir, &dest, true)?;
        }

        info!(app = %cfg.app, tag = %tag, "snapshot created");
        Ok(tag)
    }

    /// Lists snapshots of `app` in display order.
    pub fn list_snapshots(&self, app: &str) -> Result<Vec<SnapshotInfo>> {
        let cfg = self.require_volume(app)?;
        list_in(&cfg)
    }

    /// Returns true if `tag` exists for `app`.
    pub fn snapshot_exists(&self, app: &str, tag: &str) -> Result<bool> {
        let cfg = self.require_volume(app)?;
        Ok(SnapshotTag::parse(tag).is_some() && cfg.snapshot_path(tag).is_dir())
    }

    /// Resolves a user reference (`latest` or `v<N>`) to an existing tag.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSnapshotRef`] for an empty or non-`v<N>` name
    /// - [`Error::NoSnapshots`] for `latest` on a volume without snapshots
    /// - [`Error::SnapshotNotFound`] for a well-formed tag that does not exist
    pub fn resolve_snapshot_ref(&self, app: &str, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidSnapshotRef(
                "snapshot name is required".to_string(),
            ));
        }

        if name == LATEST_REF {
            let snapshots = self.list_snapshots(app)?;
            return latest_tag(&snapshots)
                .map(str::to_string)
                .ok_or_else(|| Error::NoSnapshots(app.to_string()));
        }

        if !matches!(SnapshotTag::parse(name), Some(SnapshotTag::Numbered(_))) {
            return Err(Error::InvalidSnapshotRef(name.to_string()));
        }

        if self.snapshot_exists(app, name)? {
            Ok(name.to_string())
        } else {
            Err(Error::SnapshotNotFound(name.to_string()))
        }
    }

    /// Replaces the live subvolume of `app` with a writable copy of `tag`.
    ///
    /// The container must already be stopped.
    pub fn restore_volume(&self, app: &str, tag: &str) -> Result<()> {
        let cfg = self.require_volume(app)?;
        let snapshot = cfg.snapshot_path(tag);
        if SnapshotTag::parse(tag).is_none() || !snapshot.is_dir() {
            return Err(Error::SnapshotNotFound(tag.to_string()));
        }
        let device = self.volumes.bound_device(&cfg)?;
        let host = self.volumes.host();

        if let Err(e) = host.unmount(&cfg.mount_dir) {
            debug!(app = %app, error = %e, "live unmount before restore failed");
        }
        host.delete_subvolume(&cfg.home_subvolume())?;
        host.snapshot_subvolume(&snapshot, &cfg.home_subvolume(), false)?;
        self.volumes.mount_live(&cfg, &device)?;

        info!(app = %app, tag = %tag, "volume restored");
        Ok(())
    }

    /// Stops `container`, restores `app` from `tag` and starts it again.
    pub fn restore_snapshot(&self, container: &str, app: &str, tag: &str) -> Result<()> {
        if !self.snapshot_exists(app, tag)? {
            return Err(Error::SnapshotNotFound(tag.to_string()));
        }

        let present = self.runtime.exists(container)?;
        if present {
            self.runtime.stop(container)?;
        }
        self.restore_volume(app, tag)?;
        if present {
            self.runtime.start(container)?;
        }
        Ok(())
    }
}

fn list_in(cfg: &VolumeConfig) -> Result<Vec<SnapshotInfo>> {
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(&cfg.snapshots_dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some(tag) = SnapshotTag::parse(&name) else {
            continue;
        };
        let path = entry.path();
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if !meta.is_dir() {
            continue;
        }
        let created = meta
            .created()
            .or_else(|_| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        snapshots.push(SnapshotInfo {
            tag: name,
            number: tag.number(),
            created,
            path,
        });
    }
    snapshots.sort_by(compare_snapshots);
    Ok(snapshots)
}
