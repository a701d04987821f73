//! Error types for the volume engine.

use std::path::PathBuf;

/// Result type alias for volume engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
///
/// Callers map kinds onto their own responses (a conflict becomes a
/// "409"-style answer, not-found a "404"-style one) without matching every
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Host is missing a tool or privilege. Never retried.
    Environment,
    /// On-disk state needs manual intervention.
    State,
    /// Volume, snapshot, branch or container does not exist.
    NotFound,
    /// Operation collides with existing state or an in-flight request.
    Conflict,
    /// Caller passed an invalid name or reference.
    Usage,
    /// An external tool exited non-zero.
    Tool,
    /// The three-way merge could not be resolved.
    MergeConflict,
    /// A bounded wait expired.
    Timeout,
    /// Local I/O failed.
    Io,
    /// Internal error.
    Internal,
}

/// Errors that can occur in the volume engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Environment Errors
    // =========================================================================
    /// Volume operations require root.
    #[error("must run as root; re-run with sudo")]
    NotRoot,

    /// A required host tool is not on PATH.
    #[error("missing {tool} on host; install {package}")]
    MissingTool { tool: String, package: String },

    /// More than one block device is bound to the same backing file.
    #[error("multiple loop devices attached to {}: {}", .path.display(), .devices.join(", "))]
    AmbiguousDevice { path: PathBuf, devices: Vec<String> },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// Backing file exists but has zero length.
    #[error("backing file exists but is empty: {}", .0.display())]
    EmptyBackingFile(PathBuf),

    /// Existing device does not carry the expected filesystem.
    #[error("device {device} is not a {expected} filesystem")]
    WrongFilesystem { device: String, expected: String },

    /// Mount point is claimed by a different device.
    #[error("mount {} already in use by {source_device}", .target.display())]
    MountConflict {
        target: PathBuf,
        source_device: String,
    },

    /// Mount point carries the right device but the wrong subvolume.
    #[error("mount {} is not using subvol {subvolume}", .target.display())]
    SubvolumeMismatch { target: PathBuf, subvolume: String },

    /// No block device is bound to an existing backing file.
    #[error("loop device not found for {}", .0.display())]
    DeviceNotBound(PathBuf),

    // =========================================================================
    // Not-Found Errors
    // =========================================================================
    /// App volume does not exist.
    #[error("app volume does not exist: {0}")]
    VolumeNotFound(String),

    /// Snapshot tag does not exist.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Volume has no snapshots at all.
    #[error("no snapshots found for {0}")]
    NoSnapshots(String),

    /// Branch metadata does not exist.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// Container does not exist.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The fork-point snapshot recorded for a branch is gone.
    #[error("merge base snapshot {tag} is missing; re-create the branch")]
    MergeBaseMissing { tag: String },

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    /// A restore request is already pending or running.
    #[error("restore already in progress")]
    RestoreInProgress,

    /// Derived app already has branch metadata or a backing file.
    #[error("branch already exists: {0}")]
    BranchExists(String),

    /// Snapshot tag already exists.
    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),

    // =========================================================================
    // Usage Errors
    // =========================================================================
    /// App or branch name failed validation.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Snapshot reference is empty or not a valid tag.
    #[error("invalid snapshot name: {0}")]
    InvalidSnapshotRef(String),

    /// Stored branch metadata disagrees with the requested base/branch.
    #[error("branch metadata mismatch for {app}: expected {expected}, found {found}")]
    BranchMismatch {
        app: String,
        expected: String,
        found: String,
    },

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    /// An external tool exited non-zero.
    #[error("{program} failed: {output}")]
    CommandFailed { program: String, output: String },

    /// An external tool could not be spawned.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The merge tool reported a conflict. Output is the tool's own text.
    #[error("{output}")]
    MergeConflict { output: String },

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRoot | Self::MissingTool { .. } | Self::AmbiguousDevice { .. } => {
                ErrorKind::Environment
            }
            Self::EmptyBackingFile(_)
            | Self::WrongFilesystem { .. }
            | Self::MountConflict { .. }
            | Self::SubvolumeMismatch { .. }
            | Self::DeviceNotBound(_) => ErrorKind::State,
            Self::VolumeNotFound(_)
            | Self::SnapshotNotFound(_)
            | Self::NoSnapshots(_)
            | Self::BranchNotFound(_)
            | Self::ContainerNotFound(_)
            | Self::MergeBaseMissing { .. } => ErrorKind::NotFound,
            Self::RestoreInProgress | Self::BranchExists(_) | Self::SnapshotExists(_) => {
                ErrorKind::Conflict
            }
            Self::InvalidName { .. } | Self::InvalidSnapshotRef(_) | Self::BranchMismatch { .. } => {
                ErrorKind::Usage
            }
            Self::CommandFailed { .. } | Self::Spawn { .. } => ErrorKind::Tool,
            Self::MergeConflict { .. } => ErrorKind::MergeConflict,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for not-found errors.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true for conflict errors.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Builds a [`Error::CommandFailed`] from raw tool output, trimming it
    /// and falling back to the exit status when the tool printed nothing.
    pub(crate) fn command_failed(
        program: &str,
        output: &[u8],
        status: std::process::ExitStatus,
    ) -> Self {
        let trimmed = String::from_utf8_lossy(output).trim().to_string();
        Self::CommandFailed {
            program: program.to_string(),
            output: if trimmed.is_empty() {
                status.to_string()
            } else {
                trimmed
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
