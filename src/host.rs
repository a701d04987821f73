//! # Host Integration
//!
//! Every side effect the volume engine has on the host (loop devices,
//! filesystems, mounts, subvolumes, ownership and ACLs) goes through the
//! [`Host`] trait. [`SystemHost`] drives the real tools:
//!
//! | Concern            | Tool                                   |
//! |--------------------|----------------------------------------|
//! | Block devices      | `losetup`                              |
//! | Filesystem         | `mkfs.btrfs`, `blkid`, `btrfs`         |
//! | Mounts             | `mount`, `umount`, `/proc/mounts`      |
//! | Subvolumes         | `btrfs subvolume create/delete/snapshot` |
//! | Ownership / ACLs   | `chown`, `setfacl`                     |
//!
//! Tests substitute a fake host so volume logic runs without root.
//!
//! ## Mount Table
//!
//! [`Host::mounts`] never fails: an unreadable mount table reads as "nothing
//! mounted", which makes callers attempt the mount and surface the real
//! error from `mount` itself.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Path of the kernel mount table.
const PROC_MOUNTS: &str = "/proc/mounts";

/// Tools checked by [`SystemHost::check_environment`] and the package that
/// provides each.
const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("btrfs", "btrfs-progs"),
    ("mkfs.btrfs", "btrfs-progs"),
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("setfacl", "acl"),
    ("tar", "tar"),
];

// =============================================================================
// Types
// =============================================================================

/// Numeric owner the container runtime expects files to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerIds {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl std::fmt::Display for OwnerIds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Which ACL an ACL update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclScope {
    /// The access ACL of the path itself.
    Access,
    /// The default ACL inherited by entries created later.
    Default,
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Mounted device.
    pub source: String,
    /// Mount point.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Comma-separated mount options.
    pub options: String,
}

impl MountInfo {
    /// Returns the `subvol=` mount option, if present.
    pub fn subvolume(&self) -> Option<&str> {
        self.options
            .split(',')
            .find_map(|opt| opt.strip_prefix("subvol="))
    }

    /// Returns true if the mount options select `subvolume`.
    ///
    /// The kernel reports `subvol=/@home`; older callers wrote `subvol=@home`.
    pub fn uses_subvolume(&self, subvolume: &str) -> bool {
        let bare = subvolume.trim_start_matches('/');
        self.subvolume()
            .is_some_and(|v| v.trim_start_matches('/') == bare)
    }

    /// Returns true if this is a mount of the filesystem's top level.
    ///
    /// A missing `subvol=` option counts as the top level.
    pub fn is_top_level(&self) -> bool {
        self.subvolume()
            .is_none_or(|v| v.trim_start_matches('/').is_empty())
    }
}

/// Parses the `/proc/mounts` format.
///
/// Lines with fewer than four fields are skipped. Octal escapes (`\040` for
/// space) in the source and target are decoded.
pub fn parse_mounts(text: &str) -> Vec<MountInfo> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(MountInfo {
                source: unescape_mount_field(fields[0]),
                target: PathBuf::from(unescape_mount_field(fields[1])),
                fstype: fields[2].to_string(),
                options: fields[3].to_string(),
            })
        })
        .collect()
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Returns the mount-table entry for `target`, if any.
pub fn mount_for_target(host: &dyn Host, target: &Path) -> Option<MountInfo> {
    host.mounts().into_iter().find(|m| m.target == target)
}

// =============================================================================
// Host Trait
// =============================================================================

/// Host operations used by the volume engine.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`. The engine never calls into one
/// host concurrently for the same app; the caller serializes structural
/// operations per app.
pub trait Host: Send + Sync {
    /// Fails fast if required tools or privileges are missing.
    fn check_environment(&self) -> Result<()>;

    /// Returns the current mount table. Unreadable reads as empty.
    fn mounts(&self) -> Vec<MountInfo>;

    /// Returns every block device bound to `backing`.
    fn bound_devices(&self, backing: &Path) -> Result<Vec<String>>;

    /// Binds a new block device to `backing` and returns its path.
    fn attach_device(&self, backing: &Path) -> Result<String>;

    /// Releases a bound block device.
    fn detach_device(&self, device: &str) -> Result<()>;

    /// Probes the filesystem type on `device`; `None` if unrecognized.
    fn filesystem_type(&self, device: &str) -> Result<Option<String>>;

    /// Formats `device` with the copy-on-write filesystem.
    fn make_filesystem(&self, device: &str) -> Result<()>;

    /// Mounts `device` at `target`, optionally selecting a subvolume.
    fn mount(&self, device: &str, target: &Path, subvolume: Option<&str>) -> Result<()>;

    /// Unmounts `target`.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Creates a subvolume at `path`.
    fn create_subvolume(&self, path: &Path) -> Result<()>;

    /// Deletes the subvolume at `path`.
    fn delete_subvolume(&self, path: &Path) -> Result<()>;

    /// Snapshots `source` into `dest`.
    fn snapshot_subvolume(&self, source: &Path, dest: &Path, read_only: bool) -> Result<()>;

    /// Flushes pending writes to disk. Best-effort.
    fn flush(&self);

    /// Changes ownership of `path`.
    fn set_owner(&self, path: &Path, owner: OwnerIds, recursive: bool) -> Result<()>;

    /// Grants `owner` rwx through an access or default ACL on `paths`.
    fn set_acl(
        &self,
        paths: &[PathBuf],
        owner: OwnerIds,
        scope: AclScope,
        recursive: bool,
    ) -> Result<()>;
}

// =============================================================================
// Command Helpers
// =============================================================================

/// Runs a tool and returns its stdout. On non-zero exit the trimmed combined
/// output is attached to [`Error::CommandFailed`].
pub(crate) fn run_tool<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| Error::Spawn {
            program: program.to_string(),
            source,
        })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    Err(Error::command_failed(program, &combined, output.status))
}

/// Formats the ACL entry granting `owner` full access.
pub fn acl_spec(owner: OwnerIds) -> String {
    format!("u:{}:rwx,g:{}:rwx,m::rwx", owner.uid, owner.gid)
}

/// Parses `losetup -j` output into device paths.
pub fn parse_losetup_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().split(':').next())
        .filter(|dev| dev.starts_with("/dev/"))
        .map(str::to_string)
        .collect()
}

// =============================================================================
// System Host
// =============================================================================

/// [`Host`] backed by the real host tools.
#[derive(Debug, Default, Clone)]
pub struct SystemHost;

impl SystemHost {
    /// Creates a system host.
    pub fn new() -> Self {
        Self
    }

    fn is_root() -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };
        euid == 0
    }
}

impl Host for SystemHost {
    fn check_environment(&self) -> Result<()> {
        if !Self::is_root() {
            return Err(Error::NotRoot);
        }
        for (tool, package) in REQUIRED_TOOLS {
            if which::which(tool).is_err() {
                return Err(Error::MissingTool {
                    tool: (*tool).to_string(),
                    package: (*package).to_string(),
                });
            }
        }
        Ok(())
    }

    fn mounts(&self) -> Vec<MountInfo> {
        match std::fs::read_to_string(PROC_MOUNTS) {
            Ok(text) => parse_mounts(&text),
            Err(e) => {
                debug!(error = %e, "mount table unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    fn bound_devices(&self, backing: &Path) -> Result<Vec<String>> {
        let output = Command::new("losetup")
            .arg("-j")
            .arg(backing)
            .output()
            .map_err(|source| Error::Spawn {
                program: "losetup".to_string(),
                source,
            })?;

        if !output.status.success() {
            // Exit without diagnostics means "nothing bound".
            if output.stderr.iter().all(u8::is_ascii_whitespace) {
                return Ok(Vec::new());
            }
            return Err(Error::command_failed("losetup", &output.stderr, output.status));
        }

        Ok(parse_losetup_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    fn attach_device(&self, backing: &Path) -> Result<String> {
        let out = run_tool(
            "losetup",
            [
                OsStr::new("--find"),
                OsStr::new("--show"),
                OsStr::new("--nooverlap"),
                backing.as_os_str(),
            ],
        )?;
        let device = out.trim().to_string();
        if device.is_empty() {
            return Err(Error::DeviceNotBound(backing.to_path_buf()));
        }
        Ok(device)
    }

    fn detach_device(&self, device: &str) -> Result<()> {
        run_tool("losetup", ["-d", device]).map(drop)
    }

    fn filesystem_type(&self, device: &str) -> Result<Option<String>> {
        if which::which("blkid").is_ok()
            && let Ok(out) = run_tool("blkid", ["-o", "value", "-s", "TYPE", device])
        {
            let fstype = out.trim();
            if !fstype.is_empty() {
                return Ok(Some(fstype.to_string()));
            }
        }

        // blkid missing or silent: ask btrfs directly.
        match run_tool("btrfs", ["filesystem", "show", device]) {
            Ok(_) => Ok(Some("btrfs".to_string())),
            Err(_) => Ok(None),
        }
    }

    fn make_filesystem(&self, device: &str) -> Result<()> {
        run_tool("mkfs.btrfs", ["-f", device]).map(drop)
    }

    fn mount(&self, device: &str, target: &Path, subvolume: Option<&str>) -> Result<()> {
        let mut args: Vec<&OsStr> = vec![OsStr::new("-t"), OsStr::new("btrfs")];
        let option = subvolume.map(|s| format!("subvol={s}"));
        if let Some(option) = option.as_deref() {
            args.push(OsStr::new("-o"));
            args.push(OsStr::new(option));
        }
        args.push(OsStr::new(device));
        args.push(target.as_os_str());
        run_tool("mount", args).map(drop)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        run_tool("umount", [target]).map(drop)
    }

    fn create_subvolume(&self, path: &Path) -> Result<()> {
        run_tool(
            "btrfs",
            [OsStr::new("subvolume"), OsStr::new("create"), path.as_os_str()],
        )
        .map(drop)
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        run_tool(
            "btrfs",
            [OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()],
        )
        .map(drop)
    }

    fn snapshot_subvolume(&self, source: &Path, dest: &Path, read_only: bool) -> Result<()> {
        let mut args = vec![OsStr::new("subvolume"), OsStr::new("snapshot")];
        if read_only {
            args.push(OsStr::new("-r"));
        }
        args.push(source.as_os_str());
        args.push(dest.as_os_str());
        run_tool("btrfs", args).map(drop)
    }

    fn flush(&self) {
        if let Err(e) = run_tool("sync", std::iter::empty::<&str>()) {
            debug!(error = %e, "sync failed");
        }
    }

    fn set_owner(&self, path: &Path, owner: OwnerIds, recursive: bool) -> Result<()> {
        let spec = owner.to_string();
        let mut args = Vec::new();
        if recursive {
            args.push(OsStr::new("-R"));
        }
        args.push(OsStr::new(&spec));
        args.push(path.as_os_str());
        run_tool("chown", args).map(drop)
    }

    fn set_acl(
        &self,
        paths: &[PathBuf],
        owner: OwnerIds,
        scope: AclScope,
        recursive: bool,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let spec = acl_spec(owner);
        let mut args = Vec::new();
        if recursive {
            args.push(OsStr::new("-R"));
        }
        if scope == AclScope::Default {
            args.push(OsStr::new("-d"));
        }
        args.push(OsStr::new("-m"));
        args.push(OsStr::new(&spec));
        args.extend(paths.iter().map(|p| p.as_os_str()));
        run_tool("setfacl", args).map(drop)
    }
}
