//! Chunk planning: grouping input keys into output chunks.
//!
//! Every concat dimension is walked in windows of `inputs_per_chunk` positions (the last window
//! may be shorter). Merge dimensions are never windowed: each [`ChunkKey`] fixes one value per
//! merge dimension, so a plan has `|windows| × |merge combinations|` keys.
//!
//! `subset_inputs` splits each input of a concat dimension into equal parts along its
//! elements, one chunk per part. The part count must divide `items_per_step`, and subsetting
//! only applies when every chunk holds a single input.
//!
//! Without subsetting, the chunks partition the input keys: every key belongs to exactly one
//! chunk, and [`ChunkKey::input_keys`] recovers the members by range product rather than by
//! scanning the pattern.

use crate::error::{ForgeError, Result};
use crate::patterns::{InputKey, KeyEntry, Pattern};
use crate::utils::Odometer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::ops::Range;

/// Which part of a split input a chunk covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subset {
    pub part: usize,
    pub parts: usize,
}

/// Positions `[start, end)` of one concat dimension.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub dim: String,
    pub start: usize,
    pub end: usize,
    /// Ordinal of this chunk along `dim`.
    pub index: usize,
    pub subset: Option<Subset>,
}

impl ChunkRange {
    #[must_use]
    pub fn positions(&self) -> Range<usize> {
        self.start..self.end
    }

    #[must_use]
    pub fn contains(&self, position: usize) -> bool {
        self.positions().contains(&position)
    }
}

/// One output chunk: a range per concat dimension and a fixed value per merge dimension.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    ranges: Vec<ChunkRange>,
    merges: Vec<KeyEntry>,
}

impl ChunkKey {
    #[must_use]
    pub fn ranges(&self) -> &[ChunkRange] {
        &self.ranges
    }

    #[must_use]
    pub fn merges(&self) -> &[KeyEntry] {
        &self.merges
    }

    #[must_use]
    pub fn range(&self, dim: &str) -> Option<&ChunkRange> {
        self.ranges.iter().find(|r| r.dim == dim)
    }

    #[must_use]
    pub fn merge_entry(&self, dim: &str) -> Option<&KeyEntry> {
        self.merges.iter().find(|m| m.dim == dim)
    }

    /// Whether `key` falls inside this chunk.
    #[must_use]
    pub fn contains(&self, key: &InputKey) -> bool {
        self.ranges
            .iter()
            .all(|r| key.position(&r.dim).is_some_and(|p| r.contains(p)))
            && self
                .merges
                .iter()
                .all(|m| key.position(&m.dim) == Some(m.position))
    }

    /// The input keys this chunk reads, in canonical order.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk was not planned from `pattern`.
    pub fn input_keys(&self, pattern: &Pattern) -> Result<Vec<InputKey>> {
        let axes: Vec<Vec<usize>> = self
            .ranges
            .iter()
            .map(|r| r.positions().collect())
            .chain(self.merges.iter().map(|m| vec![m.position]))
            .collect();
        let radices = axes.iter().map(Vec::len).collect();
        Odometer::new(radices)
            .map(|digits| {
                let positions: Vec<usize> =
                    digits.iter().zip(&axes).map(|(&d, axis)| axis[d]).collect();
                pattern.key_at(&positions)
            })
            .collect()
    }

    /// Element offsets along concat dimension `dim` covered by this chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if `dim` is not a concat dimension of this chunk.
    pub fn element_region(&self, pattern: &Pattern, dim: &str) -> Result<Range<usize>> {
        let range = self
            .range(dim)
            .ok_or_else(|| ForgeError::InvalidChunking(format!("chunk {self} has no range over `{dim}`")))?;
        let items = pattern
            .dimension(dim)
            .and_then(|d| d.items_per_step())
            .ok_or_else(|| ForgeError::InvalidChunking(format!("`{dim}` is not a concat dimension")))?;
        let base = range.start * items;
        Ok(match range.subset {
            Some(Subset { part, parts }) => {
                let len = items / parts;
                base + part * len..base + (part + 1) * len
            }
            None => base..range.end * items,
        })
    }
}

impl Display for ChunkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for r in &self.ranges {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}={}..{}", r.dim, r.start, r.end)?;
            if let Some(s) = r.subset {
                write!(f, "[{}/{}]", s.part + 1, s.parts)?;
            }
        }
        for m in &self.merges {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}={}", m.dim, m.value)?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Debug)]
enum Slot {
    Range(ChunkRange),
    Merge(KeyEntry),
}

/// The chunk layout of a pattern. Enumeration is lazy and restartable.
#[derive(Clone, Debug)]
pub struct ChunkPlan {
    axes: Vec<Vec<Slot>>,
    rows_per_chunk: BTreeMap<String, usize>,
    inputs_per_chunk: usize,
}

impl ChunkPlan {
    /// Number of chunk keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.axes.iter().map(Vec::len).product()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn inputs_per_chunk(&self) -> usize {
        self.inputs_per_chunk
    }

    /// Nominal elements per chunk along a concat dimension (the last chunk may be shorter).
    #[must_use]
    pub fn rows_per_chunk(&self, dim: &str) -> Option<usize> {
        self.rows_per_chunk.get(dim).copied()
    }

    /// Chunk keys ordered by range start, merge values varying fastest.
    #[must_use]
    pub fn keys(&self) -> ChunkKeys<'_> {
        ChunkKeys {
            plan: self,
            digits: Odometer::new(self.axes.iter().map(Vec::len).collect()),
        }
    }
}

pub struct ChunkKeys<'a> {
    plan: &'a ChunkPlan,
    digits: Odometer,
}

impl Iterator for ChunkKeys<'_> {
    type Item = ChunkKey;

    fn next(&mut self) -> Option<ChunkKey> {
        let digits = self.digits.next()?;
        let mut key = ChunkKey { ranges: Vec::new(), merges: Vec::new() };
        for (axis, d) in self.plan.axes.iter().zip(digits) {
            match &axis[d] {
                Slot::Range(r) => key.ranges.push(r.clone()),
                Slot::Merge(m) => key.merges.push(m.clone()),
            }
        }
        Some(key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.digits.size_hint()
    }
}

impl ExactSizeIterator for ChunkKeys<'_> {}

/// Plan the chunks of `pattern`.
///
/// # Errors
///
/// - [`ForgeError::InvalidChunking`] if `inputs_per_chunk` is zero.
/// - [`ForgeError::SubsetMismatch`] if a subset names an unknown or merge dimension, does not
///   divide that dimension's `items_per_step`, or is combined with `inputs_per_chunk > 1`.
pub fn plan_chunks(
    pattern: &Pattern,
    inputs_per_chunk: usize,
    subset_inputs: &BTreeMap<String, usize>,
) -> Result<ChunkPlan> {
    if inputs_per_chunk == 0 {
        return Err(ForgeError::InvalidChunking("inputs_per_chunk must be at least 1".into()));
    }
    for (dim, &parts) in subset_inputs {
        let mismatch = |reason: String| ForgeError::SubsetMismatch { dim: dim.clone(), reason };
        let d = pattern
            .dimension(dim)
            .ok_or_else(|| mismatch("no such dimension".into()))?;
        let items = d
            .items_per_step()
            .ok_or_else(|| mismatch("only concat dimensions can be subset".into()))?;
        if parts == 0 {
            return Err(mismatch("part count must be at least 1".into()));
        }
        if !items.is_multiple_of(parts) {
            return Err(mismatch(format!(
                "{parts} parts do not evenly divide {items} items per input"
            )));
        }
        if parts > 1 && inputs_per_chunk > 1 {
            return Err(mismatch(format!(
                "subsetting requires inputs_per_chunk = 1, got {inputs_per_chunk}"
            )));
        }
    }

    let mut axes = Vec::with_capacity(pattern.dims().len());
    let mut rows_per_chunk = BTreeMap::new();
    for d in pattern.dims() {
        match d.items_per_step() {
            Some(items) => {
                let parts = subset_inputs.get(d.name()).copied().unwrap_or(1);
                let mut slots = Vec::new();
                for (window, start) in (0..d.len()).step_by(inputs_per_chunk).enumerate() {
                    let end = (start + inputs_per_chunk).min(d.len());
                    if parts > 1 {
                        slots.extend((0..parts).map(|part| {
                            Slot::Range(ChunkRange {
                                dim: d.name().to_string(),
                                start,
                                end,
                                index: window * parts + part,
                                subset: Some(Subset { part, parts }),
                            })
                        }));
                    } else {
                        slots.push(Slot::Range(ChunkRange {
                            dim: d.name().to_string(),
                            start,
                            end,
                            index: window,
                            subset: None,
                        }));
                    }
                }
                let rows = if parts > 1 { items / parts } else { items * inputs_per_chunk };
                rows_per_chunk.insert(d.name().to_string(), rows);
                axes.push(slots);
            }
            None => {
                axes.push(
                    d.values()
                        .iter()
                        .enumerate()
                        .map(|(position, value)| {
                            Slot::Merge(KeyEntry {
                                dim: d.name().to_string(),
                                position,
                                value: value.clone(),
                            })
                        })
                        .collect(),
                );
            }
        }
    }

    Ok(ChunkPlan { axes, rows_per_chunk, inputs_per_chunk })
}
