//! File globbing for building sequence patterns from local inputs.
//!
//! Results are sorted lexicographically so the position of each file, which becomes its
//! concat index, is deterministic across runs.
//!
//! ```no_run
//! use chunkforge::io::glob::expand_glob;
//!
//! let days = expand_glob("data/daily/*.json")?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Context, Result, ensure};
use glob::glob;
use std::path::PathBuf;

/// Matching regular files, in lexicographic path order.
///
/// Directories are skipped. Zero matches is not an error here; see [`expand_glob_required`].
///
/// # Errors
///
/// Returns an error if the pattern is invalid or a matched entry cannot be read.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in glob(pattern).with_context(|| format!("parse glob `{pattern}`"))? {
        let path = entry.with_context(|| format!("read a match of `{pattern}`"))?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Like [`expand_glob`], but zero matches is an error.
///
/// # Errors
///
/// Returns an error if the pattern is invalid, unreadable, or matches nothing.
pub fn expand_glob_required(pattern: &str) -> Result<Vec<PathBuf>> {
    let files = expand_glob(pattern)?;
    ensure!(!files.is_empty(), "glob `{pattern}` matched no files");
    Ok(files)
}
