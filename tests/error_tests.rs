//! Tests for error types.
//!
//! Validates display formatting and the kind classification callers use to
//! tell not-found from conflict.

use magikvol::{Error, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Environment Error Tests
// =============================================================================

#[test]
fn test_missing_tool_display() {
    let err = Error::MissingTool {
        tool: "mkfs.btrfs".to_string(),
        package: "btrfs-progs".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("mkfs.btrfs"), "should name the tool");
    assert!(msg.contains("btrfs-progs"), "should name the package");
    assert_eq!(err.kind(), ErrorKind::Environment);
}

#[test]
fn test_ambiguous_device_display() {
    let err = Error::AmbiguousDevice {
        path: PathBuf::from("/srv/apps/web/home.btrfs"),
        devices: vec!["/dev/loop1".to_string(), "/dev/loop2".to_string()],
    };
    let msg = err.to_string();

    assert!(msg.contains("/srv/apps/web/home.btrfs"));
    assert!(msg.contains("/dev/loop1, /dev/loop2"));
    assert_eq!(err.kind(), ErrorKind::Environment);
}

#[test]
fn test_not_root_display() {
    assert!(Error::NotRoot.to_string().contains("root"));
}

// =============================================================================
// State Error Tests
// =============================================================================

#[test]
fn test_mount_conflict_display() {
    let err = Error::MountConflict {
        target: PathBuf::from("/srv/apps/web/mount"),
        source_device: "/dev/sdb1".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("/srv/apps/web/mount"));
    assert!(msg.contains("/dev/sdb1"));
    assert_eq!(err.kind(), ErrorKind::State);
}

#[test]
fn test_subvolume_mismatch_display() {
    let err = Error::SubvolumeMismatch {
        target: PathBuf::from("/srv/apps/web/snapshots"),
        subvolume: "@snapshots".to_string(),
    };

    assert!(err.to_string().contains("@snapshots"));
    assert_eq!(err.kind(), ErrorKind::State);
}

// =============================================================================
// Classification Tests
// =============================================================================

#[test]
fn test_not_found_kinds() {
    for err in [
        Error::VolumeNotFound("web".to_string()),
        Error::SnapshotNotFound("v9".to_string()),
        Error::NoSnapshots("web".to_string()),
        Error::BranchNotFound("web--x".to_string()),
        Error::ContainerNotFound("magikvol-web".to_string()),
        Error::MergeBaseMissing {
            tag: "branch-base-20250101000000".to_string(),
        },
    ] {
        assert!(err.is_not_found(), "{err:?}");
        assert!(!err.is_conflict(), "{err:?}");
    }
}

#[test]
fn test_conflict_kinds() {
    for err in [
        Error::RestoreInProgress,
        Error::BranchExists("web--x".to_string()),
        Error::SnapshotExists("v1".to_string()),
    ] {
        assert!(err.is_conflict(), "{err:?}");
        assert!(!err.is_not_found(), "{err:?}");
    }
}

#[test]
fn test_usage_kinds() {
    let err = Error::InvalidName {
        name: "Bad Name!".to_string(),
        reason: "name has invalid characters".to_string(),
    };
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(err.to_string().contains("Bad Name!"));

    let err = Error::InvalidSnapshotRef("release".to_string());
    assert_eq!(err.kind(), ErrorKind::Usage);
}

// =============================================================================
// Tool Error Tests
// =============================================================================

#[test]
fn test_command_failed_display() {
    let err = Error::CommandFailed {
        program: "losetup".to_string(),
        output: "losetup: cannot find an unused loop device".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.starts_with("losetup failed"));
    assert!(msg.contains("unused loop device"));
    assert_eq!(err.kind(), ErrorKind::Tool);
}

#[test]
fn test_merge_conflict_is_verbatim() {
    let output = "CONFLICT (content): Merge conflict in file.txt\n\
                  Automatic merge failed; fix conflicts and then commit the result.";
    let err = Error::MergeConflict {
        output: output.to_string(),
    };

    assert_eq!(err.to_string(), output);
    assert_eq!(err.kind(), ErrorKind::MergeConflict);
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "waiting for container to run".to_string(),
        duration: Duration::from_secs(30),
    };
    let msg = err.to_string();

    assert!(msg.contains("30s"), "should include duration");
    assert!(msg.contains("waiting for container"));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

// =============================================================================
// Conversion Tests
// =============================================================================

#[test]
fn test_io_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: Error = io.into();

    assert!(matches!(err, Error::Io(_)));
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn test_json_conversion() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: Error = json_err.into();

    assert!(matches!(err, Error::Serialization(_)));
}

// =============================================================================
// Error Trait Implementation Tests
// =============================================================================

#[test]
fn test_error_is_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
}

#[test]
fn test_spawn_error_has_source() {
    use std::error::Error as StdError;

    let err = Error::Spawn {
        program: "btrfs".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
    };
    assert!(err.source().is_some());

    let err = Error::VolumeNotFound("web".to_string());
    assert!(err.source().is_none());
}
