//! # Container Runtime Seam
//!
//! The volume engine needs only a handful of container operations: pause
//! around a snapshot, stop/start around a restore, remove on branch delete.
//! [`ContainerRuntime`] captures exactly those; [`DockerCli`] implements them
//! with the `docker` command line.
//!
//! Container names are formed by [`Settings::container_name`](crate::config::Settings::container_name).

use crate::error::{Error, Result};
use std::process::{Command, Output};
use tracing::debug;

/// Container operations used by the volume engine.
pub trait ContainerRuntime: Send + Sync {
    /// Returns true if a container with this name exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Returns true if the container is running. Missing reads as not running.
    fn is_running(&self, name: &str) -> Result<bool>;

    /// Freezes the container's processes.
    fn pause(&self, name: &str) -> Result<()>;

    /// Thaws a paused container.
    fn unpause(&self, name: &str) -> Result<()>;

    /// Stops the container.
    fn stop(&self, name: &str) -> Result<()>;

    /// Starts a stopped container.
    fn start(&self, name: &str) -> Result<()>;

    /// Force-removes the container.
    fn remove(&self, name: &str) -> Result<()>;
}

/// [`ContainerRuntime`] driven by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Uses `docker` from PATH.
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    /// Uses a specific compatible CLI (for example `podman`).
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let output = self.output(args)?;
        if !output.status.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            return Err(Error::command_failed(&self.program, &combined, output.status));
        }
        debug!(program = %self.program, ?args, "container command ok");
        Ok(())
    }
}

impl ContainerRuntime for DockerCli {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.output(&["inspect", name])?.status.success())
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        let output = self.output(&["inspect", "-f", "{{.State.Running}}", name])?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    fn pause(&self, name: &str) -> Result<()> {
        self.run(&["pause", name])
    }

    fn unpause(&self, name: &str) -> Result<()> {
        self.run(&["unpause", name])
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.run(&["stop", name])
    }

    fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name])
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.run(&["rm", "-f", name])
    }
}

/// Unpauses a container when dropped.
///
/// Held across a snapshot so the container resumes on every exit path,
/// including early returns through `?`.
pub(crate) struct PauseGuard<'a> {
    runtime: &'a dyn ContainerRuntime,
    name: String,
}

impl<'a> PauseGuard<'a> {
    /// Pauses `name` if it is running. Returns `None` when there was nothing
    /// to pause.
    pub(crate) fn pause_if_running(
        runtime: &'a dyn ContainerRuntime,
        name: &str,
    ) -> Result<Option<Self>> {
        if !runtime.is_running(name)? {
            return Ok(None);
        }
        runtime.pause(name)?;
        Ok(Some(Self {
            runtime,
            name: name.to_string(),
        }))
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.unpause(&self.name) {
            tracing::warn!(container = %self.name, error = %e, "failed to unpause container");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        running: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ContainerRuntime for Recorder {
        fn exists(&self, _: &str) -> Result<bool> {
            Ok(true)
        }
        fn is_running(&self, _: &str) -> Result<bool> {
            Ok(self.running)
        }
        fn pause(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("pause {name}"));
            Ok(())
        }
        fn unpause(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("unpause {name}"));
            Ok(())
        }
        fn stop(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn start(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn remove(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_guard_unpauses_on_drop() {
        let runtime = Recorder {
            running: true,
            ..Default::default()
        };
        {
            let guard = PauseGuard::pause_if_running(&runtime, "c").unwrap();
            assert!(guard.is_some());
        }
        assert_eq!(*runtime.calls.lock().unwrap(), vec!["pause c", "unpause c"]);
    }

    #[test]
    fn test_guard_skips_stopped_container() {
        let runtime = Recorder::default();
        let guard = PauseGuard::pause_if_running(&runtime, "c").unwrap();
        assert!(guard.is_none());
        assert!(runtime.calls.lock().unwrap().is_empty());
    }
}
