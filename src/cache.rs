//! Content-addressed fixture cache.
//!
//! Cache entries are directories named `{kind}_{md5-of-key-inputs}` under a
//! base directory. Producers populate a temporary sibling directory that is
//! renamed into place on success, so readers never observe a partial entry
//! and concurrent suite runs race safely.

use crate::fsx;
use md5::{Digest, Md5};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Error type for cache operations.
#[derive(Debug)]
pub enum CacheError {
    Io {
        context: String,
        source: io::Error,
    },
    /// The producer failed; the staging directory was discarded.
    Producer {
        entry: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io { context, source } => write!(f, "{context}: {source}"),
            CacheError::Producer { entry, source } => {
                write!(f, "producing cache entry {entry}: {source}")
            }
        }
    }
}

impl std::error::Error for CacheError {}

impl CacheError {
    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> CacheError {
        let context = context.into();
        move |source| CacheError::Io { context, source }
    }
}

/// Hex md5 over key inputs joined with `:`. Stable across runs and platforms;
/// the same inputs always name the same entry.
pub fn cache_key(key_inputs: &[&str]) -> String {
    let joined = key_inputs.join(":");
    format!("{:x}", Md5::digest(joined.as_bytes()))
}

/// A directory of reusable fixture entries.
#[derive(Debug, Clone)]
pub struct FixtureCache {
    base: PathBuf,
}

impl FixtureCache {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        FixtureCache { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path an entry would occupy, whether or not it exists.
    pub fn entry_path(&self, kind: &str, key_inputs: &[&str]) -> PathBuf {
        self.base.join(format!("{kind}_{}", cache_key(key_inputs)))
    }

    /// Return the entry for `(kind, key_inputs)`, producing it on first use.
    ///
    /// The producer receives an empty staging directory and must populate it
    /// fully; the staging directory is renamed into place afterwards. On
    /// producer failure nothing is left behind. If another process wins the
    /// rename race the already-published entry is returned.
    pub fn get_or_create<F>(
        &self,
        kind: &str,
        key_inputs: &[&str],
        producer: F,
    ) -> Result<PathBuf, CacheError>
    where
        F: FnOnce(&Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>>,
    {
        let entry = self.entry_path(kind, key_inputs);
        if entry.exists() {
            tracing::debug!(entry = %entry.display(), "cache hit");
            return Ok(entry);
        }

        std::fs::create_dir_all(&self.base)
            .map_err(CacheError::io(format!("creating cache base {}", self.base.display())))?;

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{kind}-staging-"))
            .tempdir_in(&self.base)
            .map_err(CacheError::io("creating staging directory"))?;

        tracing::debug!(entry = %entry.display(), "cache miss, producing");
        producer(staging.path()).map_err(|source| CacheError::Producer {
            entry: entry.display().to_string(),
            source,
        })?;

        let staged = staging.keep();
        if entry.exists() {
            // Lost a cross-process race; the winner's entry is as good as ours.
            let _ = fsx::remove_dir(&staged);
            return Ok(entry);
        }
        match std::fs::rename(&staged, &entry) {
            Ok(()) => Ok(entry),
            Err(e) if entry.exists() => {
                tracing::debug!(error = %e, "rename lost race, using published entry");
                let _ = fsx::remove_dir(&staged);
                Ok(entry)
            }
            Err(source) => {
                let _ = fsx::remove_dir(&staged);
                Err(CacheError::Io {
                    context: format!("publishing cache entry {}", entry.display()),
                    source,
                })
            }
        }
    }

    /// Deep-copy an entry to `dest`. The entry itself is never mutated.
    pub fn materialize(&self, cache_path: &Path, dest: &Path) -> Result<(), CacheError> {
        fsx::copy_dir(cache_path, dest).map_err(CacheError::io(format!(
            "materializing {} into {}",
            cache_path.display(),
            dest.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn key_is_stable_and_input_sensitive() {
        let a = cache_key(&["install", "6.5", "subdir"]);
        let b = cache_key(&["install", "6.5", "subdir"]);
        let c = cache_key(&["install", "6.5", "other"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn producer_runs_once_per_key() {
        let base = tempdir().unwrap();
        let cache = FixtureCache::new(base.path());
        let mut calls = 0;

        let first = cache
            .get_or_create("install", &["key"], |dir| {
                calls += 1;
                fs::write(dir.join("data.txt"), "payload")?;
                Ok(())
            })
            .unwrap();

        let second = cache
            .get_or_create("install", &["key"], |_| {
                calls += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls, 1);
        assert_eq!(
            fs::read_to_string(first.join("data.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn failed_producer_leaves_no_entry() {
        let base = tempdir().unwrap();
        let cache = FixtureCache::new(base.path());

        let err = cache
            .get_or_create("install", &["key"], |dir| {
                fs::write(dir.join("partial.txt"), "junk")?;
                Err("simulated download failure".into())
            })
            .unwrap_err();
        assert!(matches!(err, CacheError::Producer { .. }));

        // Neither the entry nor any staging leftovers are visible.
        assert!(!cache.entry_path("install", &["key"]).exists());
        let leftovers: Vec<_> = fs::read_dir(base.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");

        // A later attempt with a working producer succeeds.
        let entry = cache
            .get_or_create("install", &["key"], |dir| {
                fs::write(dir.join("ok.txt"), "ok")?;
                Ok(())
            })
            .unwrap();
        assert!(entry.join("ok.txt").exists());
    }

    #[test]
    fn materialize_copies_without_mutating_entry() {
        let base = tempdir().unwrap();
        let cache = FixtureCache::new(base.path());
        let entry = cache
            .get_or_create("download", &["6.5"], |dir| {
                fs::create_dir(dir.join("sub"))?;
                fs::write(dir.join("sub/file.txt"), "contents")?;
                Ok(())
            })
            .unwrap();

        let dest = tempdir().unwrap();
        let target = dest.path().join("work");
        cache.materialize(&entry, &target).unwrap();

        fs::write(target.join("sub/file.txt"), "scribbled").unwrap();
        assert_eq!(
            fs::read_to_string(entry.join("sub/file.txt")).unwrap(),
            "contents"
        );
    }

    #[test]
    fn distinct_kinds_do_not_collide() {
        let base = tempdir().unwrap();
        let cache = FixtureCache::new(base.path());
        let a = cache.entry_path("install", &["k"]);
        let b = cache.entry_path("config", &["k"]);
        assert_ne!(a, b);
    }
}
