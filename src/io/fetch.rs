//! Fetching raw source bytes.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::Path;

/// Reads the bytes behind a source identifier.
pub trait SourceFetcher: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    fn fetch(&self, source: &str) -> Result<Vec<u8>>;
}

/// Fetches plain filesystem paths and `file://` URLs. Query strings are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFetcher;

impl SourceFetcher for LocalFetcher {
    fn fetch(&self, source: &str) -> Result<Vec<u8>> {
        let path = local_path(source)?;
        fs::read(path).with_context(|| format!("fetch {source}"))
    }
}

fn local_path(source: &str) -> Result<&Path> {
    let trimmed = source.split('?').next().unwrap_or(source);
    if let Some(rest) = trimmed.strip_prefix("file://") {
        return Ok(Path::new(rest));
    }
    if let Some((scheme, _)) = trimmed.split_once("://") {
        bail!("LocalFetcher cannot fetch `{scheme}` sources: {source}");
    }
    Ok(Path::new(trimmed))
}
