//! # magikvol
//!
//! **Copy-on-Write App Volumes with Snapshots, Branches and Merges**
//!
//! Every app owns a durable home filesystem that can be versioned
//! (snapshotted), forked (branched) and merged back (applied), much like a
//! version-control workflow but operating on raw filesystem trees.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            magikvol                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐        ┌──────────────────────────────┐   │
//! │  │  ShadowMergeEngine   │        │      RestoreCoordinator      │   │
//! │  │ synthesize → merge   │        │  single slot + wakeup signal │   │
//! │  └──────────┬───────────┘        └──────────────┬───────────────┘   │
//! │             │                                   │ run_session       │
//! │  ┌──────────▼───────────┐                       │                   │
//! │  │    BranchManager     │                       │                   │
//! │  │ derive │ fork │ meta │                       │                   │
//! │  └──────────┬───────────┘                       │                   │
//! │  ┌──────────▼───────────────────────────────────▼───────────────┐   │
//! │  │                      SnapshotManager                         │   │
//! │  │      v<N> / branch-base-* tags │ pause+flush │ restore       │   │
//! │  └──────────┬───────────────────────────────────────────────────┘   │
//! │  ┌──────────▼───────────────────────────────────────────────────┐   │
//! │  │                        VolumeStore                           │   │
//! │  │  sparse file → loop device → btrfs → @home / @snapshots      │   │
//! │  └──────────┬───────────────────────────────────────────────────┘   │
//! ├─────────────┼───────────────────────────────────────────────────────┤
//! │   Host (losetup, mkfs.btrfs, mount, setfacl) │ ContainerRuntime     │
//! │   IdResolver (image uid/gid)                 │ (docker CLI)         │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency Model
//!
//! Volume, snapshot, branch and merge operations are synchronous and block
//! the calling thread. They rely on OS-visible state (mount table, bound
//! devices, existing files) to detect conflicting calls; callers must run at
//! most one structural operation per app at a time, and at most one apply
//! per base app.
//!
//! The [`RestoreCoordinator`] is the only concurrent primitive. It accepts
//! one restore request at a time and wakes the session loop
//! ([`session::run_session`]) without ever blocking the producer.
//!
//! # Error Model
//!
//! All fallible operations return [`Result`]. [`Error::kind`] classifies
//! errors into environment, state, not-found, conflict, usage, tool,
//! merge-conflict, timeout and I/O so a control layer can map them onto its
//! own responses.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikvol::{BranchManager, DockerCli, Settings, ShadowMergeEngine, SnapshotManager, VolumeStore};
//! use std::sync::Arc;
//!
//! fn main() -> magikvol::Result<()> {
//!     let volumes = Arc::new(VolumeStore::system(Settings::from_env()));
//!     let snapshots = Arc::new(SnapshotManager::new(volumes, Arc::new(DockerCli::new())));
//!     let branches = Arc::new(BranchManager::new(Arc::clone(&snapshots)));
//!
//!     branches.create_branch("web", "feature")?;
//!     // ... edit the branch ...
//!     ShadowMergeEngine::new(branches).apply_branch("web", "feature")?;
//!     Ok(())
//! }
//! ```

pub mod branch;
pub mod config;
pub mod constants;
pub mod container;
pub mod error;
pub mod host;
pub mod identity;
pub mod merge;
pub mod restore;
pub mod session;
pub mod snapshot;
pub mod tree;
pub mod volume;

// Re-exports
pub use branch::{BranchManager, BranchMeta, derive_app_name, list_branch_metas_at, normalize_name};
pub use config::{ReadinessPoll, Settings};
pub use container::{ContainerRuntime, DockerCli};
pub use error::{Error, ErrorKind, Result};
pub use host::{AclScope, Host, MountInfo, OwnerIds, SystemHost};
pub use identity::{DockerIdResolver, IdResolver, MemoizingResolver};
pub use merge::{ShadowMergeEngine, ensure_shadow_repo, merge_trees};
pub use restore::RestoreCoordinator;
pub use session::{ContainerSession, SessionHost, run_session, wait_for_running};
pub use snapshot::{SnapshotInfo, SnapshotManager, SnapshotTag};
pub use volume::{VolumeConfig, VolumeMeta, VolumeStore, sanitize_app_name};
