//! Chunked output store.
//!
//! [`FsTarget`] lays a store out on disk the way chunked columnar formats do: one directory per
//! variable holding a `.zarray` metadata document and one file per chunk, named by the chunk's
//! index along the leading dimension. [`TargetStore::consolidate_metadata`] gathers every
//! metadata document into a single `.zmetadata` file at the root.
//!
//! Region writes touch only their own chunk file, so concurrent writers of distinct regions
//! need no coordination.

use crate::dataset::Variable;
use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fs::{self, File, create_dir_all};
use std::io::{BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const ARRAY_META: &str = ".zarray";
pub const ATTRS_META: &str = ".zattrs";
pub const CONSOLIDATED_META: &str = ".zmetadata";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

impl ArraySchema {
    /// Rows per chunk along the leading dimension (the whole array for scalars).
    #[must_use]
    pub fn chunk_rows(&self) -> usize {
        self.chunks.first().copied().unwrap_or(1).max(1)
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        match self.shape.first() {
            Some(&rows) => rows.div_ceil(self.chunk_rows()).max(1),
            None => 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub arrays: BTreeMap<String, ArraySchema>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

/// Output store collaborator.
pub trait TargetStore: Send + Sync {
    /// Create the store structure and per-array metadata. Existing chunk data is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be written.
    fn init(&self, schema: &StoreSchema) -> Result<()>;

    /// Write an entire variable in one piece.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unknown or does not match its schema.
    fn write_variable(&self, name: &str, data: &Variable) -> Result<()>;

    /// Write `data` into leading-axis rows `rows` of variable `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is not chunk-aligned or does not match `data`.
    fn write_region(&self, name: &str, rows: Range<usize>, data: &Variable) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if metadata cannot be read or written.
    fn consolidate_metadata(&self) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct FsTarget {
    root: PathBuf,
}

impl FsTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load one array's metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the array has not been initialized.
    pub fn array_schema(&self, name: &str) -> Result<ArraySchema> {
        read_json(&self.root.join(name).join(ARRAY_META))
            .with_context(|| format!("load metadata for `{name}`"))
    }

    /// Names of every array in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be read.
    pub fn array_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("read store {}", self.root.display()))?
        {
            let entry = entry?;
            if entry.path().join(ARRAY_META).is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    #[must_use]
    pub fn is_consolidated(&self) -> bool {
        self.root.join(CONSOLIDATED_META).is_file()
    }

    /// Consolidated metadata document, if [`TargetStore::consolidate_metadata`] has run.
    ///
    /// # Errors
    ///
    /// Returns an error if the document exists but cannot be parsed.
    pub fn consolidated(&self) -> Result<Option<Value>> {
        let path = self.root.join(CONSOLIDATED_META);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Reassemble a whole variable from its chunk files.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata or any chunk is missing.
    pub fn read_variable(&self, name: &str) -> Result<Variable> {
        let schema = self.array_schema(name)?;
        let mut data = Vec::new();
        for idx in 0..schema.chunk_count() {
            let path = self.chunk_path(name, idx);
            let chunk: Vec<f64> =
                read_json(&path).with_context(|| format!("read chunk {idx} of `{name}`"))?;
            data.extend(chunk);
        }
        Variable::new(schema.dims, schema.shape, data)
            .map(|v| v.with_attrs(schema.attrs))
            .with_context(|| format!("assemble `{name}`"))
    }

    fn chunk_path(&self, name: &str, index: usize) -> PathBuf {
        self.root.join(name).join(index.to_string())
    }
}

impl TargetStore for FsTarget {
    fn init(&self, schema: &StoreSchema) -> Result<()> {
        create_dir_all(&self.root).with_context(|| format!("mkdir -p {}", self.root.display()))?;
        write_json(&self.root.join(ATTRS_META), &schema.attrs)?;
        for (name, array) in &schema.arrays {
            ensure!(
                array.dims.len() == array.shape.len() && array.shape.len() == array.chunks.len(),
                "array `{name}` has inconsistent dims/shape/chunks"
            );
            let dir = self.root.join(name);
            create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
            write_json(&dir.join(ARRAY_META), array)?;
        }
        Ok(())
    }

    fn write_variable(&self, name: &str, data: &Variable) -> Result<()> {
        let schema = self.array_schema(name)?;
        ensure!(
            schema.shape == data.shape,
            "`{name}` expects shape {:?}, got {:?}",
            schema.shape,
            data.shape
        );
        if schema.chunk_count() == 1 {
            return write_json(&self.chunk_path(name, 0), &data.data);
        }
        let rows = schema.shape[0];
        let step = schema.chunk_rows();
        for start in (0..rows).step_by(step) {
            let end = (start + step).min(rows);
            self.write_region(name, start..end, &data.slice_rows(start, end)?)?;
        }
        Ok(())
    }

    fn write_region(&self, name: &str, rows: Range<usize>, data: &Variable) -> Result<()> {
        let schema = self.array_schema(name)?;
        let Some(&total) = schema.shape.first() else {
            bail!("`{name}` is a scalar; use write_variable");
        };
        let step = schema.chunk_rows();
        ensure!(
            rows.start.is_multiple_of(step),
            "region {rows:?} of `{name}` does not start on a chunk boundary (chunk rows {step})"
        );
        ensure!(
            rows.end == (rows.start + step).min(total),
            "region {rows:?} of `{name}` does not cover exactly one chunk (chunk rows {step}, total {total})"
        );
        ensure!(
            data.shape.first() == Some(&rows.len()) && data.shape[1..] == schema.shape[1..],
            "region {rows:?} of `{name}` expects {} rows of {:?}, got shape {:?}",
            rows.len(),
            &schema.shape[1..],
            data.shape
        );
        write_json(&self.chunk_path(name, rows.start / step), &data.data)
    }

    fn consolidate_metadata(&self) -> Result<()> {
        let mut metadata = Map::new();
        let attrs: Value = read_json(&self.root.join(ATTRS_META)).unwrap_or_else(|_| json!({}));
        metadata.insert(ATTRS_META.to_string(), attrs);
        for name in self.array_names()? {
            let schema = serde_json::to_value(self.array_schema(&name)?)?;
            metadata.insert(format!("{name}/{ARRAY_META}"), schema);
        }
        write_json(
            &self.root.join(CONSOLIDATED_META),
            &json!({ "metadata": metadata, "consolidated_format": 1 }),
        )
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    // Readers see either the previous file or the complete new one.
    let tmp = NamedTempFile::new_in(dir).with_context(|| format!("create temp in {}", dir.display()))?;
    let mut w = BufWriter::new(tmp.as_file());
    serde_json::to_writer(&mut w, value)
        .with_context(|| format!("serialize to {}", path.display()))?;
    w.flush()?;
    drop(w);
    tmp.persist(path).with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(f)).with_context(|| format!("parse {}", path.display()))
}
