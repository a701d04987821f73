//! Runtime settings for the volume engine.
//!
//! [`Settings::default`] mirrors [`crate::constants`]. [`Settings::from_env`]
//! layers `MAGIKVOL_*` environment overrides on top so operators can relocate
//! state without rebuilding:
//!
//! | Variable                    | Field              |
//! |-----------------------------|--------------------|
//! | `MAGIKVOL_APPS_DIR`         | `apps_dir`         |
//! | `MAGIKVOL_SHADOW_DIR`       | `shadow_dir`       |
//! | `MAGIKVOL_IMAGE`            | `image`            |
//! | `MAGIKVOL_CONTAINER_PREFIX` | `container_prefix` |
//! | `MAGIKVOL_BACKING_SIZE`     | `backing_size`     |
//!
//! Empty or unparsable values are ignored.

use crate::constants::{
    DEFAULT_APPS_DIR, DEFAULT_BACKING_SIZE, DEFAULT_CONTAINER_PREFIX, DEFAULT_IMAGE,
    DEFAULT_SHADOW_DIR, READY_POLL_INTERVAL, READY_TIMEOUT, WORK_SUBDIR,
};
use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide settings shared by every manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding one subdirectory per app.
    pub apps_dir: PathBuf,
    /// Directory holding one bare shadow repository per base app.
    pub shadow_dir: PathBuf,
    /// Container image whose user owns the live tree.
    pub image: String,
    /// Prefix joined with an app name to form its container name.
    pub container_prefix: String,
    /// Logical size of new backing files in bytes.
    pub backing_size: u64,
    /// Working subdirectory of the live tree that branches merge.
    pub work_subdir: String,
    /// Readiness poll after a restore.
    pub ready: ReadinessPoll,
}

/// Bounded polling schedule used while waiting for a container to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPoll {
    /// Total time budget.
    pub timeout: Duration,
    /// Delay between polls.
    pub interval: Duration,
}

impl Default for ReadinessPoll {
    fn default() -> Self {
        Self {
            timeout: READY_TIMEOUT,
            interval: READY_POLL_INTERVAL,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            apps_dir: PathBuf::from(DEFAULT_APPS_DIR),
            shadow_dir: PathBuf::from(DEFAULT_SHADOW_DIR),
            image: DEFAULT_IMAGE.to_string(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            backing_size: DEFAULT_BACKING_SIZE,
            work_subdir: WORK_SUBDIR.to_string(),
            ready: ReadinessPoll::default(),
        }
    }
}

impl Settings {
    /// Creates settings rooted at a custom state directory.
    ///
    /// Apps land in `<root>/apps`, shadow repositories in `<root>/git`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            apps_dir: root.join("apps"),
            shadow_dir: root.join("git"),
            ..Self::default()
        }
    }

    /// Returns defaults overridden by `MAGIKVOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(dir) = get("MAGIKVOL_APPS_DIR") {
            self.apps_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("MAGIKVOL_SHADOW_DIR") {
            self.shadow_dir = PathBuf::from(dir);
        }
        if let Some(image) = get("MAGIKVOL_IMAGE") {
            self.image = image;
        }
        if let Some(prefix) = get("MAGIKVOL_CONTAINER_PREFIX") {
            self.container_prefix = prefix;
        }
        if let Some(size) = get("MAGIKVOL_BACKING_SIZE").and_then(|v| v.parse::<u64>().ok())
            && size > 0
        {
            self.backing_size = size;
        }
        self
    }

    /// Returns the container name for an app.
    pub fn container_name(&self, app: &str) -> String {
        format!("{}{}", self.container_prefix, app)
    }

    /// Returns the shadow repository path shared by all branches of `base`.
    pub fn shadow_repo_for(&self, base: &str) -> PathBuf {
        self.shadow_dir.join(format!("{base}.git"))
    }
}
