//! Tests for branch naming, metadata and lifecycle.

mod common;

use chrono::{TimeZone, Utc};
use common::{Harness, have_tool};
use magikvol::branch::{read_branch_meta, write_branch_meta};
use magikvol::{BranchMeta, Error, derive_app_name, list_branch_metas_at};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn meta(base: &str, branch: &str) -> BranchMeta {
    BranchMeta {
        base_app: base.to_string(),
        branch: branch.to_string(),
        created_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
        base_snapshot_ref: "branch-base-20250102030405".to_string(),
        shadow_repo: Some(PathBuf::from(format!("/var/lib/magikvol/git/{base}.git"))),
    }
}

// =============================================================================
// Naming Tests
// =============================================================================

#[test]
fn test_derive_app_name_normalizes() {
    assert_eq!(
        derive_app_name("My-App", "Feature 1").unwrap(),
        "my-app--feature-1"
    );
}

#[test]
fn test_derive_app_name_rejects_long_result() {
    let err = derive_app_name(&"a".repeat(32), &"b".repeat(32)).unwrap_err();

    match err {
        Error::InvalidName { name, .. } => assert_eq!(name.len(), 66, "not truncated"),
        other => panic!("expected invalid name, got {other:?}"),
    }
}

#[test]
fn test_derive_app_name_rejects_bad_chars() {
    assert!(derive_app_name("web", "feat/x").is_err());
    assert!(derive_app_name("web", "-x").is_err());
    assert!(derive_app_name("", "x").is_err());
}

// =============================================================================
// Metadata Tests
// =============================================================================

#[test]
fn test_meta_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("web--feature").join("branch.json");
    let original = meta("web", "feature");

    write_branch_meta(&path, &original).unwrap();
    let loaded = read_branch_meta(&path).unwrap().unwrap();

    assert_eq!(loaded, original);
}

#[test]
fn test_meta_without_shadow_repo_loads() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("branch.json");
    fs::write(
        &path,
        r#"{"base_app":"web","branch":"x","created_at":"2025-01-02T03:04:05Z","base_snapshot_ref":"branch-base-20250102030405"}"#,
    )
    .unwrap();

    let loaded = read_branch_meta(&path).unwrap().unwrap();

    assert_eq!(loaded.shadow_repo, None);
}

#[test]
fn test_list_filters_by_base() {
    let tmp = TempDir::new().unwrap();
    for (base, branch) in [("web", "zeta"), ("api", "alpha"), ("web", "alpha")] {
        let dir = tmp.path().join(format!("{base}--{branch}"));
        write_branch_meta(&dir.join("branch.json"), &meta(base, branch)).unwrap();
    }
    fs::create_dir_all(tmp.path().join("web")).unwrap();
    fs::create_dir_all(tmp.path().join("broken")).unwrap();
    fs::write(tmp.path().join("broken/branch.json"), "{not json").unwrap();

    let branches: Vec<String> = list_branch_metas_at(tmp.path(), "web")
        .unwrap()
        .into_iter()
        .map(|m| m.branch)
        .collect();

    assert_eq!(branches, vec!["alpha", "zeta"]);
}

#[test]
fn test_list_missing_apps_dir() {
    let tmp = TempDir::new().unwrap();
    assert!(list_branch_metas_at(&tmp.path().join("nope"), "web").unwrap().is_empty());
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_create_requires_base_container() {
    let h = Harness::new();
    h.volumes.ensure_volume("web", true).unwrap();

    let err = h.branches.create_branch("web", "feature").unwrap_err();

    assert!(matches!(err, Error::ContainerNotFound(_)));
}

#[test]
fn test_create_requires_base_volume() {
    let h = Harness::new();
    h.runtime.add(&h.container("web"), true);

    let err = h.branches.create_branch("web", "feature").unwrap_err();

    assert!(matches!(err, Error::VolumeNotFound(_)));
}

#[test]
fn test_create_branch_seeds_from_base() {
    if !have_tool("tar") {
        return;
    }
    let h = Harness::new();
    let base = h.app("web");
    fs::write(base.mount_dir.join("app/file.txt"), "base").unwrap();

    let created = h.branches.create_branch("Web", "Feature 1").unwrap();

    assert_eq!(created.base_app, "web");
    assert_eq!(created.branch, "feature-1");
    assert!(created.base_snapshot_ref.starts_with("branch-base-"));
    assert_eq!(created.shadow_repo, Some(h.settings.shadow_repo_for("web")));
    assert!(base.snapshot_path(&created.base_snapshot_ref).is_dir());

    let branch_cfg = h.volumes.config_for("web--feature-1");
    assert_eq!(
        fs::read_to_string(branch_cfg.mount_dir.join("app/file.txt")).unwrap(),
        "base"
    );
    assert_eq!(h.branches.resolve_app("web--feature-1").unwrap(), created);
    assert_eq!(h.branches.list_branches("web").unwrap(), vec![created]);
}

#[test]
fn test_create_twice_is_conflict() {
    if !have_tool("tar") {
        return;
    }
    let h = Harness::new();
    h.app("web");
    h.branches.create_branch("web", "feature").unwrap();

    let err = h.branches.create_branch("web", "feature").unwrap_err();

    assert!(matches!(err, Error::BranchExists(_)));
    assert!(err.is_conflict());
}

#[test]
fn test_delete_branch() {
    if !have_tool("tar") {
        return;
    }
    let h = Harness::new();
    h.app("web");
    h.branches.create_branch("web", "feature").unwrap();
    h.runtime.add(&h.container("web--feature"), true);

    h.branches.delete_branch_for_app("web--feature").unwrap();

    assert!(!h.volumes.config_for("web--feature").base_dir.exists());
    assert!(h.runtime.calls().contains(&"rm magikvol-web--feature".to_string()));
    assert!(h.branches.list_branches("web").unwrap().is_empty());

    let err = h.branches.delete_branch("web", "feature").unwrap_err();
    assert!(matches!(err, Error::BranchNotFound(_)));
}

#[test]
fn test_resolve_unknown_app() {
    let h = Harness::new();

    let err = h.branches.resolve_app("web--nothing").unwrap_err();

    assert!(matches!(err, Error::BranchNotFound(_)));
    assert!(err.is_not_found());
}
