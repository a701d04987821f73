//! # Per-App Volumes
//!
//! Each app owns a copy-on-write home filesystem built from:
//!
//! ```text
//! home.btrfs (sparse file)
//!     └── /dev/loopN (bound block device)
//!           └── btrfs filesystem, mounted at btrfs/
//!                 ├── @home       mounted at mount/      (live, writable)
//!                 └── @snapshots  mounted at snapshots/  (read-only copies)
//! ```
//!
//! [`VolumeStore::ensure_volume`] builds whatever part of this stack is
//! missing and validates whatever part already exists. It never reformats
//! an existing backing file and never operates against a mount whose device
//! or subvolume does not match.
//!
//! ## Ownership and ACLs
//!
//! The live tree belongs to the uid/gid of the container image. Access and
//! default ACLs are re-applied to the live root and the standard working
//! directories on every ensure. The expensive pass that sets the default ACL
//! on every directory of the tree runs once and is recorded in
//! `acl.applied`.
//!
//! ## Metadata
//!
//! `meta.json` is rewritten after every successful ensure. It is
//! informational; nothing in the engine reads it back to make decisions.

use crate::config::Settings;
use crate::constants::{
    ACL_BATCH_SIZE, ACL_DIRS, ACL_MARKER_FILE_NAME, BACKING_FILE_NAME, BRANCH_META_FILE_NAME,
    FILESYSTEM_TYPE, HOME_SUBVOLUME, LIVE_MOUNT_DIR_NAME, ROOT_MOUNT_DIR_NAME, SNAPSHOTS_DIR_NAME,
    SNAPSHOTS_SUBVOLUME, STANDARD_DIRS, VOLUME_META_FILE_NAME,
};
use crate::error::{Error, Result};
use crate::host::{AclScope, Host, OwnerIds, SystemHost, mount_for_target};
use crate::identity::{DockerIdResolver, IdResolver, MemoizingResolver};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Types
// =============================================================================

/// Paths of one app's volume. Derived from the app name, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    /// App name as given by the caller.
    pub app: String,
    /// Per-app directory (`<apps_dir>/<sanitized app>`).
    pub base_dir: PathBuf,
    /// Sparse backing file.
    pub backing_file: PathBuf,
    /// Mount point of the filesystem top level.
    pub root_mount_dir: PathBuf,
    /// Mount point of the live subvolume.
    pub mount_dir: PathBuf,
    /// Mount point of the snapshot container subvolume.
    pub snapshots_dir: PathBuf,
    /// Volume metadata file.
    pub meta_path: PathBuf,
    /// Branch metadata file (present for forked apps only).
    pub branch_meta_path: PathBuf,
    /// Marker written after the bulk ACL pass.
    pub acl_marker: PathBuf,
}

impl VolumeConfig {
    /// Computes the layout for `app` under `apps_dir`.
    pub fn for_app(apps_dir: &Path, app: &str) -> Self {
        let base_dir = apps_dir.join(sanitize_app_name(app));
        Self {
            app: app.to_string(),
            backing_file: base_dir.join(BACKING_FILE_NAME),
            root_mount_dir: base_dir.join(ROOT_MOUNT_DIR_NAME),
            mount_dir: base_dir.join(LIVE_MOUNT_DIR_NAME),
            snapshots_dir: base_dir.join(SNAPSHOTS_DIR_NAME),
            meta_path: base_dir.join(VOLUME_META_FILE_NAME),
            branch_meta_path: base_dir.join(BRANCH_META_FILE_NAME),
            acl_marker: base_dir.join(ACL_MARKER_FILE_NAME),
            base_dir,
        }
    }

    /// Path of the live subvolume inside the top-level mount.
    pub fn home_subvolume(&self) -> PathBuf {
        self.root_mount_dir.join(HOME_SUBVOLUME)
    }

    /// Path of the snapshot container subvolume inside the top-level mount.
    pub fn snapshots_subvolume(&self) -> PathBuf {
        self.root_mount_dir.join(SNAPSHOTS_SUBVOLUME)
    }

    /// Path of snapshot `tag` as seen through the snapshot mount.
    pub fn snapshot_path(&self, tag: &str) -> PathBuf {
        self.snapshots_dir.join(tag)
    }
}

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    /// App name.
    pub app: String,
    /// Backing file path.
    pub file_path: PathBuf,
    /// Bound block device.
    pub loop_device: String,
    /// Time of the last successful mount sequence.
    pub mounted_at: DateTime<Utc>,
}

/// Maps an app name onto a safe directory name.
///
/// Lowercases, keeps `[a-z0-9._-]`, replaces everything else with `_`.
/// An empty result becomes `app`.
pub fn sanitize_app_name(app: &str) -> String {
    let cleaned: String = app
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // Dot-only names would escape the apps directory.
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "app".to_string()
    } else {
        cleaned
    }
}

// =============================================================================
// JSON Helpers
// =============================================================================

/// Writes `value` as pretty JSON through a unique temp file and a rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp_path, data)?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Io(e)
    })
}

/// Reads JSON from `path`; `None` if the file does not exist.
pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Volume Store
// =============================================================================

/// Creates, validates and destroys per-app volumes.
///
/// ## Thread Safety
///
/// The store holds no mutable state of its own besides the id cache inside
/// its resolver. Callers must not run two structural operations for the same
/// app at once; conflicting calls surface as mount or existence errors.
pub struct VolumeStore {
    settings: Settings,
    host: Arc<dyn Host>,
    ids: Arc<dyn IdResolver>,
}

impl VolumeStore {
    /// Creates a store over explicit host and resolver implementations.
    pub fn new(settings: Settings, host: Arc<dyn Host>, ids: Arc<dyn IdResolver>) -> Self {
        Self {
            settings,
            host,
            ids,
        }
    }

    /// Creates a store driving the real host tools and `docker`.
    pub fn system(settings: Settings) -> Self {
        Self::new(
            settings,
            Arc::new(SystemHost::new()),
            Arc::new(MemoizingResolver::new(DockerIdResolver)),
        )
    }

    /// Returns the settings this store was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns the host implementation.
    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    /// Computes the layout for `app` without touching the disk.
    pub fn config_for(&self, app: &str) -> VolumeConfig {
        VolumeConfig::for_app(&self.settings.apps_dir, app)
    }

    /// Returns true if the app's backing file exists.
    pub fn volume_exists(&self, app: &str) -> bool {
        self.config_for(app).backing_file.exists()
    }

    /// Reads `meta.json` for `app`, if present.
    pub fn read_meta(&self, app: &str) -> Result<Option<VolumeMeta>> {
        read_json(&self.config_for(app).meta_path)
    }

    /// Makes sure the app's volume exists, is attached and is mounted.
    ///
    /// With `create == false` an absent volume returns `Ok(None)` without any
    /// side effect. Calling this repeatedly on a ready volume only re-checks
    /// state and refreshes ownership, ACLs and metadata.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRoot`] / [`Error::MissingTool`] when the host is unfit
    /// - [`Error::EmptyBackingFile`] when the backing file has zero length
    /// - [`Error::AmbiguousDevice`] when several devices are bound
    /// - [`Error::WrongFilesystem`] when an existing device is not btrfs
    /// - [`Error::MountConflict`] / [`Error::SubvolumeMismatch`] when a mount
    ///   point is claimed by something else
    pub fn ensure_volume(&self, app: &str, create: bool) -> Result<Option<VolumeConfig>> {
        self.host.check_environment()?;
        let cfg = self.config_for(app);

        let fresh = match fs::metadata(&cfg.backing_file) {
            Ok(meta) if meta.len() == 0 => {
                return Err(Error::EmptyBackingFile(cfg.backing_file.clone()));
            }
            Ok(_) => false,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !create {
                    debug!(app = %app, "volume absent, not creating");
                    return Ok(None);
                }
                true
            }
            Err(e) => return Err(e.into()),
        };

        let owner = self.ids.resolve(&self.settings.image)?;
        fs::create_dir_all(&cfg.base_dir)?;

        if fresh {
            let file = File::create(&cfg.backing_file)?;
            file.set_len(self.settings.backing_size)?;
            info!(app = %app, path = %cfg.backing_file.display(), "allocated backing file");
        }

        let device = self.attach(&cfg)?;

        if fresh {
            self.host.make_filesystem(&device)?;
            info!(app = %app, device = %device, "created filesystem");
        } else {
            match self.host.filesystem_type(&device)? {
                Some(fstype) if fstype == FILESYSTEM_TYPE => {}
                _ => {
                    return Err(Error::WrongFilesystem {
                        device,
                        expected: FILESYSTEM_TYPE.to_string(),
                    });
                }
            }
        }

        self.mount_checked(&device, &cfg.root_mount_dir, None)?;

        for subvolume in [cfg.home_subvolume(), cfg.snapshots_subvolume()] {
            if !subvolume.exists() {
                self.host.create_subvolume(&subvolume)?;
                debug!(app = %app, path = %subvolume.display(), "created subvolume");
            }
        }

        self.mount_checked(&device, &cfg.mount_dir, Some(HOME_SUBVOLUME))?;
        self.mount_checked(&device, &cfg.snapshots_dir, Some(SNAPSHOTS_SUBVOLUME))?;

        self.prepare_live_tree(&cfg, owner, fresh)?;

        write_json_atomic(
            &cfg.meta_path,
            &VolumeMeta {
                app: app.to_string(),
                file_path: cfg.backing_file.clone(),
                loop_device: device.clone(),
                mounted_at: Utc::now(),
            },
        )?;

        info!(app = %app, device = %device, mount = %cfg.mount_dir.display(), "volume ready");
        Ok(Some(cfg))
    }

    /// Tears down the app's volume and removes its directory.
    ///
    /// Unmount and detach failures are logged and skipped. A missing app
    /// directory is a no-op.
    pub fn delete_volume(&self, app: &str) -> Result<()> {
        let cfg = self.config_for(app);
        if !cfg.base_dir.exists() {
            debug!(app = %app, "volume directory absent, nothing to delete");
            return Ok(());
        }

        for target in [&cfg.mount_dir, &cfg.snapshots_dir, &cfg.root_mount_dir] {
            let mounted = mount_for_target(self.host.as_ref(), target).is_some();
            if let Err(e) = self.host.unmount(target)
                && mounted
            {
                warn!(app = %app, target = %target.display(), error = %e, "unmount failed");
            }
        }

        if cfg.backing_file.exists() {
            match self.host.bound_devices(&cfg.backing_file) {
                Ok(devices) => {
                    for device in devices {
                        if let Err(e) = self.host.detach_device(&device) {
                            warn!(app = %app, device = %device, error = %e, "detach failed");
                        }
                    }
                }
                Err(e) => warn!(app = %app, error = %e, "could not list bound devices"),
            }
        }

        fs::remove_dir_all(&cfg.base_dir)?;
        info!(app = %app, "volume deleted");
        Ok(())
    }

    /// Hands `path` and everything below it to the container user.
    pub fn apply_ownership(&self, path: &Path) -> Result<()> {
        let owner = self.ids.resolve(&self.settings.image)?;
        self.host.set_owner(path, owner, true)
    }

    /// Returns the single device bound to the app's backing file.
    pub(crate) fn bound_device(&self, cfg: &VolumeConfig) -> Result<String> {
        let mut devices = self.host.bound_devices(&cfg.backing_file)?;
        match devices.len() {
            0 => Err(Error::DeviceNotBound(cfg.backing_file.clone())),
            1 => Ok(devices.remove(0)),
            _ => Err(Error::AmbiguousDevice {
                path: cfg.backing_file.clone(),
                devices,
            }),
        }
    }

    /// Mounts the live subvolume at the live mount point, validating any
    /// existing mount.
    pub(crate) fn mount_live(&self, cfg: &VolumeConfig, device: &str) -> Result<()> {
        self.mount_checked(device, &cfg.mount_dir, Some(HOME_SUBVOLUME))
    }

    fn attach(&self, cfg: &VolumeConfig) -> Result<String> {
        let mut devices = self.host.bound_devices(&cfg.backing_file)?;
        match devices.len() {
            0 => {
                let device = self.host.attach_device(&cfg.backing_file)?;
                debug!(app = %cfg.app, device = %device, "attached device");
                Ok(device)
            }
            1 => Ok(devices.remove(0)),
            _ => Err(Error::AmbiguousDevice {
                path: cfg.backing_file.clone(),
                devices,
            }),
        }
    }

    fn mount_checked(&self, device: &str, target: &Path, subvolume: Option<&str>) -> Result<()> {
        fs::create_dir_all(target)?;

        if let Some(existing) = mount_for_target(self.host.as_ref(), target) {
            if existing.source != device {
                return Err(Error::MountConflict {
                    target: target.to_path_buf(),
                    source_device: existing.source,
                });
            }
            let matches = match subvolume {
                Some(name) => existing.uses_subvolume(name),
                None => existing.is_top_level(),
            };
            if !matches {
                return Err(Error::SubvolumeMismatch {
                    target: target.to_path_buf(),
                    subvolume: subvolume.unwrap_or("/").to_string(),
                });
            }
            debug!(target = %target.display(), "already mounted");
            return Ok(());
        }

        self.host.mount(device, target, subvolume)
    }

    fn prepare_live_tree(&self, cfg: &VolumeConfig, owner: OwnerIds, fresh: bool) -> Result<()> {
        let live = &cfg.mount_dir;
        fs::set_permissions(live, fs::Permissions::from_mode(0o755))?;

        for dir in STANDARD_DIRS {
            fs::create_dir_all(live.join(dir))?;
        }

        if fresh || !owned_by(live, owner)? {
            self.host.set_owner(live, owner, true)?;
            debug!(app = %cfg.app, owner = %owner, "ownership applied");
        } else {
            for dir in STANDARD_DIRS {
                let path = live.join(dir);
                if !owned_by(&path, owner)? {
                    self.host.set_owner(&path, owner, false)?;
                }
            }
        }

        let acl_paths: Vec<PathBuf> = std::iter::once(live.clone())
            .chain(ACL_DIRS.iter().map(|d| live.join(d)))
            .collect();
        self.host.set_acl(&acl_paths, owner, AclScope::Access, false)?;
        self.host.set_acl(&acl_paths, owner, AclScope::Default, false)?;

        if !cfg.acl_marker.exists() {
            self.bulk_acl_pass(cfg, &acl_paths, owner)?;
            fs::write(&cfg.acl_marker, Utc::now().to_rfc3339())?;
        }
        Ok(())
    }

    fn bulk_acl_pass(&self, cfg: &VolumeConfig, acl_paths: &[PathBuf], owner: OwnerIds) -> Result<()> {
        self.host.set_acl(acl_paths, owner, AclScope::Access, true)?;

        let dirs: Vec<PathBuf> = walkdir::WalkDir::new(&cfg.mount_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .map(walkdir::DirEntry::into_path)
            .collect();

        for batch in dirs.chunks(ACL_BATCH_SIZE) {
            self.host.set_acl(batch, owner, AclScope::Default, false)?;
        }
        info!(app = %cfg.app, dirs = dirs.len(), "default ACL applied to live tree");
        Ok(())
    }
}

fn owned_by(path: &Path, owner: OwnerIds) -> Result<bool> {
    let meta = fs::metadata(path)?;
    Ok(meta.uid() == owner.uid && meta.gid() == owner.gid)
}
