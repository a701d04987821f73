//! Shared fakes for integration tests.
//!
//! `FakeHost` stands in for the real host tools: subvolumes are plain
//! directories under the root mount, mounting a subvolume replaces the
//! (empty) mount point with a symlink to it, and snapshots are recursive
//! copies. The mount table lives in memory.

#![allow(dead_code)]

use magikvol::{
    AclScope, BranchManager, ContainerRuntime, Error, Host, IdResolver, MountInfo, OwnerIds,
    Result, Settings, SnapshotManager, VolumeStore,
};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// =============================================================================
// FakeHost
// =============================================================================

#[derive(Default)]
struct HostState {
    mounts: Vec<MountInfo>,
    devices: HashMap<PathBuf, Vec<String>>,
    filesystems: HashMap<String, String>,
    next_loop: u32,
    mkfs_count: usize,
    flushes: usize,
    acl_calls: Vec<(Vec<PathBuf>, AclScope, bool)>,
    owner_calls: Vec<(PathBuf, bool)>,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

fn fail(program: &str, output: impl Into<String>) -> Error {
    Error::CommandFailed {
        program: program.to_string(),
        output: output.into(),
    }
}

/// Recursively copies `src` (following a symlinked root) into `dest`.
pub fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mkfs_count(&self) -> usize {
        self.state.lock().unwrap().mkfs_count
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    pub fn acl_calls(&self) -> Vec<(Vec<PathBuf>, AclScope, bool)> {
        self.state.lock().unwrap().acl_calls.clone()
    }

    pub fn owner_calls(&self) -> Vec<(PathBuf, bool)> {
        self.state.lock().unwrap().owner_calls.clone()
    }

    /// Binds an extra device to `backing`, as a stray `losetup` would.
    pub fn bind_extra_device(&self, backing: &Path, device: &str) {
        self.state
            .lock()
            .unwrap()
            .devices
            .entry(backing.to_path_buf())
            .or_default()
            .push(device.to_string());
    }

    /// Inserts a raw mount-table entry.
    pub fn add_mount(&self, source: &str, target: &Path, options: &str) {
        self.state.lock().unwrap().mounts.push(MountInfo {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: "btrfs".to_string(),
            options: options.to_string(),
        });
    }

    /// Records the filesystem a device carries.
    pub fn set_filesystem(&self, device: &str, fstype: &str) {
        self.state
            .lock()
            .unwrap()
            .filesystems
            .insert(device.to_string(), fstype.to_string());
    }

    pub fn bound_devices_for(&self, backing: &Path) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(backing)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.state
            .lock()
            .unwrap()
            .mounts
            .iter()
            .any(|m| m.target == target)
    }
}

impl Host for FakeHost {
    fn check_environment(&self) -> Result<()> {
        Ok(())
    }

    fn mounts(&self) -> Vec<MountInfo> {
        self.state.lock().unwrap().mounts.clone()
    }

    fn bound_devices(&self, backing: &Path) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .devices
            .get(backing)
            .cloned()
            .unwrap_or_default())
    }

    fn attach_device(&self, backing: &Path) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let device = format!("/dev/loop{}", state.next_loop);
        state.next_loop += 1;
        state
            .devices
            .entry(backing.to_path_buf())
            .or_default()
            .push(device.clone());
        Ok(device)
    }

    fn detach_device(&self, device: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for devices in state.devices.values_mut() {
            devices.retain(|d| d != device);
        }
        Ok(())
    }

    fn filesystem_type(&self, device: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().filesystems.get(device).cloned())
    }

    fn make_filesystem(&self, device: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .filesystems
            .insert(device.to_string(), "btrfs".to_string());
        state.mkfs_count += 1;
        Ok(())
    }

    fn mount(&self, device: &str, target: &Path, subvolume: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let options = match subvolume {
            None => "rw,relatime,subvol=/".to_string(),
            Some(name) => {
                let root = state
                    .mounts
                    .iter()
                    .find(|m| m.source == device && m.is_top_level())
                    .map(|m| m.target.clone())
                    .ok_or_else(|| fail("mount", "top level not mounted"))?;
                let subvol = root.join(name);
                if !subvol.is_dir() {
                    return Err(fail("mount", format!("no subvolume {name}")));
                }
                fs::remove_dir(target)?;
                std::os::unix::fs::symlink(&subvol, target)?;
                format!("rw,relatime,subvol=/{name}")
            }
        };
        state.mounts.push(MountInfo {
            source: device.to_string(),
            target: target.to_path_buf(),
            fstype: "btrfs".to_string(),
            options,
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(index) = state.mounts.iter().position(|m| m.target == target) else {
            return Err(fail("umount", format!("{}: not mounted", target.display())));
        };
        state.mounts.remove(index);
        if fs::symlink_metadata(target)?.file_type().is_symlink() {
            fs::remove_file(target)?;
            fs::create_dir(target)?;
        }
        Ok(())
    }

    fn create_subvolume(&self, path: &Path) -> Result<()> {
        fs::create_dir(path)?;
        Ok(())
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path)?;
        Ok(())
    }

    fn snapshot_subvolume(&self, source: &Path, dest: &Path, _read_only: bool) -> Result<()> {
        if dest.exists() {
            return Err(fail("btrfs", "target exists"));
        }
        copy_dir(source, dest)?;
        Ok(())
    }

    fn flush(&self) {
        self.state.lock().unwrap().flushes += 1;
    }

    fn set_owner(&self, path: &Path, _owner: OwnerIds, recursive: bool) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .owner_calls
            .push((path.to_path_buf(), recursive));
        Ok(())
    }

    fn set_acl(
        &self,
        paths: &[PathBuf],
        _owner: OwnerIds,
        scope: AclScope,
        recursive: bool,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .acl_calls
            .push((paths.to_vec(), scope, recursive));
        Ok(())
    }
}

// =============================================================================
// FakeRuntime
// =============================================================================

#[derive(Default)]
struct RuntimeState {
    running: HashMap<String, bool>,
    paused: Vec<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, running: bool) {
        self.state
            .lock()
            .unwrap()
            .running
            .insert(name.to_string(), running);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn require(&self, name: &str) -> Result<()> {
        if self.state.lock().unwrap().running.contains_key(name) {
            Ok(())
        } else {
            Err(fail("docker", format!("No such container: {name}")))
        }
    }
}

impl ContainerRuntime for FakeRuntime {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().running.contains_key(name))
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.running.get(name).copied().unwrap_or(false)
            && !state.paused.iter().any(|p| p == name))
    }

    fn pause(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.state.lock().unwrap().paused.push(name.to_string());
        self.record(format!("pause {name}"));
        Ok(())
    }

    fn unpause(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.state.lock().unwrap().paused.retain(|p| p != name);
        self.record(format!("unpause {name}"));
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.state
            .lock()
            .unwrap()
            .running
            .insert(name.to_string(), false);
        self.record(format!("stop {name}"));
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.state
            .lock()
            .unwrap()
            .running
            .insert(name.to_string(), true);
        self.record(format!("start {name}"));
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().running.remove(name);
        self.record(format!("rm {name}"));
        Ok(())
    }
}

// =============================================================================
// FixedIds
// =============================================================================

pub struct FixedIds(pub OwnerIds);

impl IdResolver for FixedIds {
    fn resolve(&self, _image: &str) -> Result<OwnerIds> {
        Ok(self.0)
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A full engine over fakes, rooted in a temp directory.
pub struct Harness {
    pub tmp: TempDir,
    pub settings: Settings,
    pub host: Arc<FakeHost>,
    pub runtime: Arc<FakeRuntime>,
    pub volumes: Arc<VolumeStore>,
    pub snapshots: Arc<SnapshotManager>,
    pub branches: Arc<BranchManager>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::with_root(tmp.path());
        settings.backing_size = 1 << 20;

        let host = Arc::new(FakeHost::new());
        let runtime = Arc::new(FakeRuntime::new());
        let volumes = Arc::new(VolumeStore::new(
            settings.clone(),
            host.clone(),
            Arc::new(FixedIds(OwnerIds {
                uid: 1000,
                gid: 1000,
            })),
        ));
        let snapshots = Arc::new(SnapshotManager::new(volumes.clone(), runtime.clone()));
        let branches = Arc::new(BranchManager::new(snapshots.clone()));

        Self {
            tmp,
            settings,
            host,
            runtime,
            volumes,
            snapshots,
            branches,
        }
    }

    /// Creates a volume for `app` and a running container for it.
    pub fn app(&self, app: &str) -> magikvol::VolumeConfig {
        self.runtime.add(&self.settings.container_name(app), true);
        self.volumes.ensure_volume(app, true).unwrap().unwrap()
    }

    pub fn container(&self, app: &str) -> String {
        self.settings.container_name(app)
    }
}

/// Returns true if `tool` is on PATH; prints a skip notice otherwise.
pub fn have_tool(tool: &str) -> bool {
    if which::which(tool).is_ok() {
        true
    } else {
        eprintln!("skipping: {tool} not found on PATH");
        false
    }
}

/// Reads every regular file under `root` into a path → content map.
pub fn read_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}
