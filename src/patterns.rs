//! Dimensions, patterns, and input keys.
//!
//! A [`Pattern`] is the Cartesian product of named [`Dimension`]s plus a pure formatting
//! function that turns each point of the product (an [`InputKey`]) into a source identifier,
//! usually a URL or a path.
//!
//! Dimensions come in two kinds:
//!
//! - **concat** dimensions are contiguous and order-meaningful (time steps). Each index value
//!   stands for `items_per_step` underlying elements, which the chunk planner uses for sizing.
//! - **merge** dimensions are independent alternatives (variable names). Every combination of
//!   merge values exists for every concat position.
//!
//! Keys are always laid out in canonical order: concat dimensions first, then merge dimensions,
//! each group in declaration order. Enumeration walks that order like an odometer, last
//! dimension fastest.
//!
//! ```
//! use chunkforge::patterns::{Dimension, Pattern};
//!
//! let pattern = Pattern::combine(
//!     |key| Ok(format!("s3://bucket/{}_{:03}.json", key.value_of("variable")?, key.value_of("time")?)),
//!     [
//!         Dimension::merge("variable", ["foo", "bar"]),
//!         Dimension::concat("time", 0..10i64, 1),
//!     ],
//! )?;
//!
//! assert_eq!(pattern.len(), 20);
//! let first = pattern.keys().next().unwrap();
//! assert_eq!(pattern.source_of(&first)?, "s3://bucket/foo_000.json");
//! # Ok::<(), chunkforge::ForgeError>(())
//! ```

use crate::error::{ForgeError, Result};
use crate::utils::Odometer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

/// One index value along a dimension.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimValue {
    Int(i64),
    Str(String),
}

impl DimValue {
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            DimValue::Int(v) => Some(*v),
            DimValue::Str(_) => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DimValue::Str(s) => Some(s),
            DimValue::Int(_) => None,
        }
    }
}

impl Display for DimValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DimValue::Int(v) => Display::fmt(v, f),
            DimValue::Str(s) => Display::fmt(s, f),
        }
    }
}

impl From<i64> for DimValue {
    fn from(v: i64) -> Self {
        DimValue::Int(v)
    }
}

impl From<i32> for DimValue {
    fn from(v: i32) -> Self {
        DimValue::Int(i64::from(v))
    }
}

impl From<u32> for DimValue {
    fn from(v: u32) -> Self {
        DimValue::Int(i64::from(v))
    }
}

impl From<&str> for DimValue {
    fn from(v: &str) -> Self {
        DimValue::Str(v.to_string())
    }
}

impl From<String> for DimValue {
    fn from(v: String) -> Self {
        DimValue::Str(v)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimKind {
    Concat { items_per_step: usize },
    Merge,
}

/// A named axis of the pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    name: String,
    values: Vec<DimValue>,
    kind: DimKind,
}

impl Dimension {
    /// A concatenation dimension; each value stands for `items_per_step` elements.
    pub fn concat<I, V>(name: impl Into<String>, values: I, items_per_step: usize) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DimValue>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
            kind: DimKind::Concat { items_per_step },
        }
    }

    /// A merge dimension of independent alternatives.
    pub fn merge<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DimValue>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
            kind: DimKind::Merge,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn values(&self) -> &[DimValue] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn kind(&self) -> DimKind {
        self.kind
    }

    #[must_use]
    pub fn is_concat(&self) -> bool {
        matches!(self.kind, DimKind::Concat { .. })
    }

    /// Elements per index value; `None` for merge dimensions.
    #[must_use]
    pub fn items_per_step(&self) -> Option<usize> {
        match self.kind {
            DimKind::Concat { items_per_step } => Some(items_per_step),
            DimKind::Merge => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.values.is_empty() {
            return Err(ForgeError::InvalidPattern(format!(
                "dimension `{}` has no values",
                self.name
            )));
        }
        if self.items_per_step() == Some(0) {
            return Err(ForgeError::InvalidPattern(format!(
                "concat dimension `{}` must have items_per_step >= 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// One component of an [`InputKey`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyEntry {
    pub dim: String,
    pub position: usize,
    pub value: DimValue,
}

/// A point in the pattern's index space, entries in canonical dimension order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InputKey {
    entries: Vec<KeyEntry>,
}

impl InputKey {
    #[must_use]
    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    #[must_use]
    pub fn value(&self, dim: &str) -> Option<&DimValue> {
        self.entry(dim).map(|e| &e.value)
    }

    #[must_use]
    pub fn position(&self, dim: &str) -> Option<usize> {
        self.entry(dim).map(|e| e.position)
    }

    /// Like [`InputKey::value`], but an error for formatting functions to `?` on.
    ///
    /// # Errors
    ///
    /// Returns an error if the key has no such dimension.
    pub fn value_of(&self, dim: &str) -> anyhow::Result<&DimValue> {
        self.value(dim)
            .ok_or_else(|| anyhow::anyhow!("key {self} has no dimension `{dim}`"))
    }

    fn entry(&self, dim: &str) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.dim == dim)
    }
}

impl Display for InputKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", e.dim, e.value)?;
        }
        write!(f, ")")
    }
}

/// Pure mapping from an input key to its source identifier.
pub type FormatFn = Arc<dyn Fn(&InputKey) -> anyhow::Result<String> + Send + Sync>;

/// The product index space of a set of dimensions.
#[derive(Clone)]
pub struct Pattern {
    dims: Vec<Dimension>,
    format: FormatFn,
}

impl Debug for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern").field("dims", &self.dims).finish_non_exhaustive()
    }
}

impl Pattern {
    /// Build the product space of `dims`.
    ///
    /// # Errors
    ///
    /// [`ForgeError::DimensionConflict`] if two dimensions share a name,
    /// [`ForgeError::InvalidPattern`] if there are no dimensions or one of them is empty.
    pub fn combine<F>(format: F, dims: impl IntoIterator<Item = Dimension>) -> Result<Self>
    where
        F: Fn(&InputKey) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        let dims: Vec<Dimension> = dims.into_iter().collect();
        if dims.is_empty() {
            return Err(ForgeError::InvalidPattern(
                "a pattern needs at least one dimension".into(),
            ));
        }
        let mut seen = HashSet::new();
        for d in &dims {
            if !seen.insert(d.name.as_str()) {
                return Err(ForgeError::DimensionConflict(d.name.clone()));
            }
            d.validate()?;
        }

        // Canonical order: concat dims, then merge dims, each stable.
        let (mut ordered, merges): (Vec<_>, Vec<_>) = dims.into_iter().partition(Dimension::is_concat);
        ordered.extend(merges);

        Ok(Self { dims: ordered, format: Arc::new(format) })
    }

    /// Dimensions in canonical order.
    #[must_use]
    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    #[must_use]
    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|d| d.name == name)
    }

    pub fn concat_dims(&self) -> impl Iterator<Item = &Dimension> {
        self.dims.iter().filter(|d| d.is_concat())
    }

    pub fn merge_dims(&self) -> impl Iterator<Item = &Dimension> {
        self.dims.iter().filter(|d| !d.is_concat())
    }

    /// `(name, cardinality)` per dimension in canonical order.
    #[must_use]
    pub fn shape(&self) -> Vec<(&str, usize)> {
        self.dims.iter().map(|d| (d.name(), d.len())).collect()
    }

    /// Number of input keys: the product of all cardinalities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dims.iter().map(Dimension::len).product()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enumerate every input key in canonical order. Calling again restarts from the beginning.
    #[must_use]
    pub fn keys(&self) -> InputKeys<'_> {
        InputKeys {
            pattern: self,
            positions: Odometer::new(self.dims.iter().map(Dimension::len).collect()),
        }
    }

    /// Each input key paired with its formatted source.
    pub fn items(&self) -> impl Iterator<Item = (InputKey, Result<String>)> + '_ {
        self.keys().map(|k| {
            let source = self.source_of(&k);
            (k, source)
        })
    }

    /// Build the key at `positions` (one per dimension, canonical order).
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::InvalidPattern`] if the arity is wrong or a position is out of range.
    pub fn key_at(&self, positions: &[usize]) -> Result<InputKey> {
        if positions.len() != self.dims.len() {
            return Err(ForgeError::InvalidPattern(format!(
                "expected {} positions, got {}",
                self.dims.len(),
                positions.len()
            )));
        }
        let mut entries = Vec::with_capacity(positions.len());
        for (d, &p) in self.dims.iter().zip(positions) {
            let value = d.values.get(p).ok_or_else(|| {
                ForgeError::InvalidPattern(format!(
                    "position {p} out of range for dimension `{}` (len {})",
                    d.name,
                    d.len()
                ))
            })?;
            entries.push(KeyEntry { dim: d.name.clone(), position: p, value: value.clone() });
        }
        Ok(InputKey { entries })
    }

    /// Evaluate the formatting function for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Formatting`] carrying the key if the function fails.
    pub fn source_of(&self, key: &InputKey) -> Result<String> {
        (self.format)(key).map_err(|e| ForgeError::Formatting {
            key: key.to_string(),
            message: format!("{e:#}"),
        })
    }
}

/// Lazy enumeration of a pattern's keys.
pub struct InputKeys<'a> {
    pattern: &'a Pattern,
    positions: Odometer,
}

impl Iterator for InputKeys<'_> {
    type Item = InputKey;

    fn next(&mut self) -> Option<InputKey> {
        let positions = self.positions.next()?;
        let entries = self
            .pattern
            .dims
            .iter()
            .zip(positions)
            .map(|(d, p)| KeyEntry { dim: d.name.clone(), position: p, value: d.values[p].clone() })
            .collect();
        Some(InputKey { entries })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.positions.size_hint()
    }
}

impl ExactSizeIterator for InputKeys<'_> {}

/// A single concat dimension over a flat list of sources; the index is the list position.
///
/// # Errors
///
/// Returns [`ForgeError::InvalidPattern`] for an empty list or `items_per_step == 0`.
pub fn pattern_from_sequence<I, S>(sources: I, dim: &str, items_per_step: usize) -> Result<Pattern>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let sources: Arc<Vec<String>> = Arc::new(sources.into_iter().map(Into::into).collect());
    let positions = (0i64..).take(sources.len());
    let dim_name = dim.to_string();
    let lookup = Arc::clone(&sources);
    Pattern::combine(
        move |key: &InputKey| {
            let p = key
                .position(&dim_name)
                .ok_or_else(|| anyhow::anyhow!("key {key} has no dimension `{dim_name}`"))?;
            lookup
                .get(p)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("position {p} is past the end of the sequence"))
        },
        [Dimension::concat(dim, positions, items_per_step)],
    )
}

/// Expand a filesystem glob into a sequence pattern (see [`pattern_from_sequence`]).
///
/// # Errors
///
/// Returns an error if the glob is invalid or matches no files.
#[cfg(feature = "glob-patterns")]
pub fn pattern_from_glob(glob: &str, dim: &str, items_per_step: usize) -> Result<Pattern> {
    let files = crate::io::glob::expand_glob_required(glob)?;
    pattern_from_sequence(files.iter().map(|p| p.display().to_string()), dim, items_per_step)
}
