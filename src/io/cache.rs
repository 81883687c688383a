//! Byte caches for fetched inputs, keyed by source identifier.
//!
//! [`FsCache`] stores each source under a file name derived from a SHA-256 of the full source
//! string plus a sanitized basename, so query strings (tokens, signed parameters) never show up
//! in cache file names and two URLs with the same basename never collide.

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

/// Cache collaborator: `exists`, `put`, `get` keyed by source.
pub trait CacheStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be queried.
    fn exists(&self, source: &str) -> Result<bool>;

    /// # Errors
    ///
    /// Returns an error if the bytes cannot be stored.
    fn put(&self, source: &str, bytes: &[u8]) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if `source` is not cached or cannot be read.
    fn get(&self, source: &str) -> Result<Vec<u8>>;
}

/// In-process cache, handy for tests and single-run pipelines.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCache {
    fn exists(&self, source: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(source))
    }

    fn put(&self, source: &str, bytes: &[u8]) -> Result<()> {
        self.lock()?.insert(source.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, source: &str) -> Result<Vec<u8>> {
        self.lock()?
            .get(source)
            .cloned()
            .with_context(|| format!("{source} is not cached"))
    }
}

impl MemoryCache {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("cache mutex poisoned"))
    }
}

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("static regex"));

/// Directory-backed cache.
#[derive(Clone, Debug)]
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        create_dir_all(&root).with_context(|| format!("mkdir -p {}", root.display()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `source` lives (or would live) inside the cache directory.
    #[must_use]
    pub fn path_for(&self, source: &str) -> PathBuf {
        self.root.join(cache_file_name(source))
    }
}

impl CacheStore for FsCache {
    fn exists(&self, source: &str) -> Result<bool> {
        Ok(self.path_for(source).is_file())
    }

    fn put(&self, source: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(source);
        // A cached file is either absent or complete.
        let tmp = path.with_extension("partial");
        let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("sync {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }

    fn get(&self, source: &str) -> Result<Vec<u8>> {
        let path = self.path_for(source);
        fs::read(&path).with_context(|| format!("read cached {source} at {}", path.display()))
    }
}

/// `<first 16 hex chars of sha256(source)>-<sanitized basename without query>`.
#[must_use]
pub fn cache_file_name(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    let without_query = source.split(['?', '#']).next().unwrap_or(source);
    let base = without_query
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("input");
    let base = UNSAFE_CHARS.replace_all(base, "_");
    format!("{hash}-{base}")
}
