//! Per-input metadata recorded while caching, so the target can be laid out without reopening
//! inputs.
//!
//! An [`InputMetadata`] record holds an input's length along the concat dimension, the shape
//! and attributes of every variable, and the full data of variables that do not run along the
//! concat dimension (coordinates such as `lat` and `lon`). Records are keyed by the input key's
//! display form, e.g. `(time=3, variable=foo)`.

use super::cache::cache_file_name;
use crate::dataset::{Dataset, Variable};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;

/// Dims, shape and attributes of one variable in one input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableSchema {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputMetadata {
    /// Length along the concat dimension; `None` when no variable runs along it.
    pub concat_len: Option<usize>,
    pub variables: BTreeMap<String, VariableSchema>,
    /// Variables without the concat dimension, kept whole.
    #[serde(default)]
    pub fixed: BTreeMap<String, Variable>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

impl InputMetadata {
    /// Summarize a decoded input.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset's variables disagree on their length along `concat_dim`.
    pub fn describe(ds: &Dataset, concat_dim: &str) -> Result<Self> {
        let concat_len = ds.len_along(concat_dim)?;
        let mut variables = BTreeMap::new();
        let mut fixed = BTreeMap::new();
        for (name, var) in &ds.variables {
            variables.insert(
                name.clone(),
                VariableSchema {
                    dims: var.dims.clone(),
                    shape: var.shape.clone(),
                    attrs: var.attrs.clone(),
                },
            );
            if !var.leads_with(concat_dim) {
                fixed.insert(name.clone(), var.clone());
            }
        }
        Ok(Self { concat_len, variables, fixed, attrs: ds.attrs.clone() })
    }
}

/// Metadata collaborator: `get` and `put` keyed by input key.
pub trait MetadataStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if a stored record exists but cannot be read.
    fn get(&self, key: &str) -> Result<Option<InputMetadata>>;

    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn put(&self, key: &str, metadata: &InputMetadata) -> Result<()>;
}

/// In-process metadata store, shared between clones.
#[derive(Clone, Debug, Default)]
pub struct MemoryMetadata {
    records: Arc<Mutex<HashMap<String, InputMetadata>>>,
}

impl MemoryMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataStore for MemoryMetadata {
    fn get(&self, key: &str) -> Result<Option<InputMetadata>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).cloned())
    }

    fn put(&self, key: &str, metadata: &InputMetadata) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(key.to_string(), metadata.clone());
        Ok(())
    }
}

/// One JSON document per input under a directory.
#[derive(Clone, Debug)]
pub struct FsMetadata {
    root: PathBuf,
}

impl FsMetadata {
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        create_dir_all(&root).with_context(|| format!("mkdir -p {}", root.display()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", cache_file_name(key)))
    }
}

impl MetadataStore for FsMetadata {
    fn get(&self, key: &str) -> Result<Option<InputMetadata>> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("parse metadata for {key} at {}", path.display()))
    }

    fn put(&self, key: &str, metadata: &InputMetadata) -> Result<()> {
        let path = self.path_for(key);
        let mut tmp = NamedTempFile::new_in(&self.root)
            .with_context(|| format!("create temp in {}", self.root.display()))?;
        serde_json::to_writer(&mut tmp, metadata)
            .with_context(|| format!("serialize metadata for {key}"))?;
        tmp.flush()?;
        tmp.persist(&path).with_context(|| format!("persist {}", path.display()))?;
        Ok(())
    }
}
