//! Directory tree synchronization.
//!
//! [`replace_tree`] makes `dest` an exact copy of `src`, preserving
//! permissions, ownership and symlinks. The copy is a `tar` pipe
//! (`tar -C src -cf - . | tar -C dest -xpf -`), which handles special files,
//! hard links and extended attributes the same way the host's archiver does.

use crate::error::{Error, Result};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

/// Replaces the contents of `dest` with the contents of `src`.
///
/// Entries of `dest` are removed first so files deleted in `src` disappear.
/// When `exclude` is set, entries with that name are not copied from `src`
/// at any depth, and a top-level entry with that name is kept in `dest`.
pub fn replace_tree(src: &Path, dest: &Path, exclude: Option<&str>) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("source tree {} does not exist", src.display()),
        )));
    }

    fs::create_dir_all(dest)?;
    clear_dir(dest, exclude)?;

    let mut pack = Command::new("tar");
    pack.arg("-C").arg(src);
    if let Some(name) = exclude {
        pack.arg(format!("--exclude={name}"));
    }
    pack.args(["-cf", "-", "."]).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut packer = pack.spawn().map_err(|source| Error::Spawn {
        program: "tar".to_string(),
        source,
    })?;

    let (Some(stream), Some(mut warnings)) = (packer.stdout.take(), packer.stderr.take()) else {
        let _ = packer.kill();
        return Err(Error::Internal("tar pipes not captured".to_string()));
    };
    // Drained concurrently so a chatty packer cannot block on a full pipe.
    let drain = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = warnings.read_to_end(&mut buf);
        buf
    });

    let unpacked = Command::new("tar")
        .arg("-C")
        .arg(dest)
        .args(["-xpf", "-"])
        .stdin(Stdio::from(stream))
        .output()
        .map_err(|source| Error::Spawn {
            program: "tar".to_string(),
            source,
        })?;

    let packed = packer.wait()?;
    let packed_stderr = drain.join().unwrap_or_default();

    // The unpacking side fails first; the packer then only reports a broken pipe.
    if !unpacked.status.success() {
        let mut combined = unpacked.stdout;
        combined.extend_from_slice(&unpacked.stderr);
        return Err(Error::command_failed("tar", &combined, unpacked.status));
    }
    if !packed.success() {
        return Err(Error::command_failed("tar", &packed_stderr, packed));
    }

    debug!(src = %src.display(), dest = %dest.display(), "tree replaced");
    Ok(())
}

/// Removes every entry of `dir` except a top-level `exclude`.
fn clear_dir(dir: &Path, exclude: Option<&str>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if exclude.is_some_and(|name| entry.file_name() == name) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
