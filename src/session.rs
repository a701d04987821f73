//! # Session Loop
//!
//! The interactive session runs the container's attached foreground process
//! and, at the same time, waits for restore requests from a
//! [`RestoreCoordinator`]. A request preempts the foreground process:
//!
//! ```text
//!   run_foreground ─┬─ exits on its own ──► pending restore? ─ yes ─► restore ─► loop
//!                   │                                        └ no ──► return status
//!                   └─ restore signal ──► stop container
//!                                         wait for foreground exit
//!                                         restore
//!                                         wait until running (bounded)
//!                                         loop
//! ```
//!
//! A request accepted while the foreground process is exiting is still
//! carried out before the loop returns.

use crate::config::ReadinessPoll;
use crate::container::ContainerRuntime;
use crate::error::{Error, Result};
use crate::restore::RestoreCoordinator;
use crate::snapshot::SnapshotManager;
use async_trait::async_trait;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the session loop drives.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Runs the attached foreground process to completion and returns its
    /// exit code.
    async fn run_foreground(&self) -> Result<i32>;

    /// Stops the container, which ends the foreground process.
    async fn stop_container(&self) -> Result<()>;

    /// Restores the volume from `reference` and brings the container back.
    async fn restore(&self, reference: &str) -> Result<()>;

    /// Returns true if the container is running.
    async fn is_running(&self) -> Result<bool>;
}

enum Event {
    Exited(Result<i32>),
    Signal,
}

/// Runs the session until the foreground process exits with no restore
/// pending. Returns the foreground exit code.
pub async fn run_session(
    host: &dyn SessionHost,
    restores: &RestoreCoordinator,
    ready: ReadinessPoll,
) -> Result<i32> {
    loop {
        let foreground = host.run_foreground();
        tokio::pin!(foreground);

        let preempted = loop {
            let event = tokio::select! {
                status = &mut foreground => Event::Exited(status),
                _ = restores.consume_signal() => Event::Signal,
            };

            match event {
                Event::Exited(status) => {
                    if !restores.is_pending()? {
                        return status;
                    }
                    restores.try_consume_signal();
                    debug!("foreground exited with a restore pending");
                    break false;
                }
                Event::Signal => {
                    // Leftover wakeup from a request that was already handled.
                    if !restores.is_pending()? {
                        continue;
                    }
                    if let Err(e) = host.stop_container().await {
                        if let Err(release) = restores.finish() {
                            warn!(error = %release, "restore slot not released");
                        }
                        return Err(e);
                    }
                    let status = (&mut foreground).await;
                    debug!(?status, "foreground ended for restore");
                    break true;
                }
            }
        };

        if let Err(e) = perform_restore(host, restores, ready).await {
            warn!(error = %e, preempted, "restore failed");
        }
    }
}

async fn perform_restore(
    host: &dyn SessionHost,
    restores: &RestoreCoordinator,
    ready: ReadinessPoll,
) -> Result<()> {
    let Some(reference) = restores.current_ref()? else {
        return restores.finish();
    };

    let result = async {
        host.restore(&reference).await?;
        wait_for_running(host, ready).await
    }
    .await;

    let released = restores.finish();
    result?;
    released?;
    info!(reference = %reference, "session resumed after restore");
    Ok(())
}

/// Polls until the container runs or `ready.timeout` elapses.
///
/// # Errors
///
/// [`Error::Timeout`] when the container is not running in time.
pub async fn wait_for_running(host: &dyn SessionHost, ready: ReadinessPoll) -> Result<()> {
    let deadline = Instant::now() + ready.timeout;
    loop {
        if host.is_running().await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                operation: "waiting for container to run".to_string(),
                duration: ready.timeout,
            });
        }
        tokio::time::sleep(ready.interval).await;
    }
}

// =============================================================================
// Container Session
// =============================================================================

/// [`SessionHost`] that attaches to an app container with `docker exec`.
pub struct ContainerSession {
    snapshots: Arc<SnapshotManager>,
    app: String,
    container: String,
    command: Vec<String>,
}

impl ContainerSession {
    /// Creates a session running a login shell in the app's container.
    pub fn new(snapshots: Arc<SnapshotManager>, app: impl Into<String>) -> Self {
        let app = app.into();
        let container = snapshots.volumes().settings().container_name(&app);
        Self {
            snapshots,
            app,
            container,
            command: vec!["bash".to_string(), "-l".to_string()],
        }
    }

    /// Replaces the foreground command.
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(self.snapshots.runtime())
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl SessionHost for ContainerSession {
    async fn run_foreground(&self) -> Result<i32> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("exec").arg("-i");
        if std::io::stdin().is_terminal() {
            cmd.arg("-t");
        }
        cmd.arg(&self.container).args(&self.command);

        let status = cmd.status().await.map_err(|source| Error::Spawn {
            program: "docker".to_string(),
            source,
        })?;
        // Killed by a signal: report as generic failure.
        Ok(status.code().unwrap_or(1))
    }

    async fn stop_container(&self) -> Result<()> {
        let runtime = self.runtime();
        let name = self.container.clone();
        blocking(move || runtime.stop(&name)).await
    }

    async fn restore(&self, reference: &str) -> Result<()> {
        let snapshots = Arc::clone(&self.snapshots);
        let app = self.app.clone();
        let container = self.container.clone();
        let reference = reference.to_string();
        blocking(move || {
            let tag = snapshots.resolve_snapshot_ref(&app, &reference)?;
            snapshots.restore_snapshot(&container, &app, &tag)
        })
        .await
    }

    async fn is_running(&self) -> Result<bool> {
        let runtime = self.runtime();
        let name = self.container.clone();
        blocking(move || runtime.is_running(&name)).await
    }
}
