//! Container user resolution.
//!
//! The live tree must be owned by the uid/gid the container image runs as.
//! [`DockerIdResolver`] asks the image directly; [`MemoizingResolver`] keeps
//! the answer for the lifetime of the store so repeated ensures do not
//! start a throwaway container each time.

use crate::error::{Error, Result};
use crate::host::OwnerIds;
use std::collections::HashMap;
use std::process::Command;
use std::sync::RwLock;
use tracing::debug;

/// Resolves the numeric owner of a container image.
pub trait IdResolver: Send + Sync {
    /// Returns the uid/gid the image runs as.
    fn resolve(&self, image: &str) -> Result<OwnerIds>;
}

/// Resolver that runs `id` inside a throwaway container of the image.
#[derive(Debug, Default, Clone)]
pub struct DockerIdResolver;

impl DockerIdResolver {
    fn query(image: &str, flag: &str) -> Result<u32> {
        let output = Command::new("docker")
            .args(["run", "--rm", "--entrypoint", "id", image, flag])
            .output()
            .map_err(|source| Error::Spawn {
                program: "docker".to_string(),
                source,
            })?;

        if !output.status.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            return Err(Error::command_failed("docker", &combined, output.status));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        text.trim().parse::<u32>().map_err(|e| {
            Error::Internal(format!("unexpected `id {flag}` output '{}': {e}", text.trim()))
        })
    }
}

impl IdResolver for DockerIdResolver {
    fn resolve(&self, image: &str) -> Result<OwnerIds> {
        let uid = Self::query(image, "-u")?;
        let gid = Self::query(image, "-g")?;
        debug!(image, uid, gid, "resolved container user");
        Ok(OwnerIds { uid, gid })
    }
}

/// Caches another resolver's answers per image.
pub struct MemoizingResolver<R> {
    inner: R,
    cache: RwLock<HashMap<String, OwnerIds>>,
}

impl<R: IdResolver> MemoizingResolver<R> {
    /// Wraps `inner` with an empty cache.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: IdResolver> IdResolver for MemoizingResolver<R> {
    fn resolve(&self, image: &str) -> Result<OwnerIds> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
            if let Some(ids) = cache.get(image) {
                return Ok(*ids);
            }
        }

        let ids = self.inner.resolve(image)?;
        self.cache
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?
            .insert(image.to_string(), ids);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl IdResolver for Counting {
        fn resolve(&self, image: &str) -> Result<OwnerIds> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if image == "broken" {
                return Err(Error::Internal("no such image".to_string()));
            }
            Ok(OwnerIds {
                uid: 1000,
                gid: 1000,
            })
        }
    }

    #[test]
    fn test_memoizes_per_image() {
        let resolver = MemoizingResolver::new(Counting(AtomicUsize::new(0)));

        let first = resolver.resolve("img:1").unwrap();
        let second = resolver.resolve("img:1").unwrap();
        resolver.resolve("img:2").unwrap();

        assert_eq!(first, second);
        assert_eq!(resolver.inner.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failures_not_cached() {
        let resolver = MemoizingResolver::new(Counting(AtomicUsize::new(0)));

        assert!(resolver.resolve("broken").is_err());
        assert!(resolver.resolve("broken").is_err());
        assert_eq!(resolver.inner.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_poisoned_cache_is_internal_error() {
        let resolver = std::sync::Arc::new(MemoizingResolver::new(Counting(AtomicUsize::new(0))));
        let holder = std::sync::Arc::clone(&resolver);
        let _ = std::thread::spawn(move || {
            let _guard = holder.cache.write().unwrap();
            panic!("poison the cache");
        })
        .join();

        assert!(matches!(resolver.resolve("img:1"), Err(Error::Internal(_))));
    }
}
