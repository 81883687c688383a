//! Minimal labeled-array model used between the codec and the target store.
//!
//! A [`Dataset`] is a set of named [`Variable`]s. Each variable is a dense row-major `f64`
//! array with named dimensions. Concatenation only happens along a variable's leading
//! dimension, which keeps slicing and appending a matter of contiguous row ranges.

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

impl Variable {
    /// # Errors
    ///
    /// Returns an error if `dims` and `shape` disagree in length or `data` has the wrong size.
    pub fn new(dims: Vec<String>, shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let v = Self { dims, shape, data, attrs: Map::new() };
        v.check()?;
        Ok(v)
    }

    #[must_use]
    pub fn with_attrs(mut self, attrs: Map<String, Value>) -> Self {
        self.attrs = attrs;
        self
    }

    /// # Errors
    ///
    /// Returns an error if the variable is internally inconsistent.
    pub fn check(&self) -> Result<()> {
        ensure!(
            self.dims.len() == self.shape.len(),
            "dims {:?} do not match shape {:?}",
            self.dims,
            self.shape
        );
        let expected: usize = self.shape.iter().product();
        ensure!(
            expected == self.data.len(),
            "shape {:?} needs {expected} values, found {}",
            self.shape,
            self.data.len()
        );
        Ok(())
    }

    /// Whether `dim` is this variable's leading dimension.
    #[must_use]
    pub fn leads_with(&self, dim: &str) -> bool {
        self.dims.first().is_some_and(|d| d == dim)
    }

    /// Number of values per leading-axis row.
    #[must_use]
    pub fn row_size(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Rows `[start, end)` along the leading dimension.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds or the variable is a scalar.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self> {
        let Some(&rows) = self.shape.first() else {
            bail!("cannot slice a scalar variable");
        };
        ensure!(start <= end && end <= rows, "row range {start}..{end} out of bounds for {rows}");
        let row = self.row_size();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Ok(Self {
            dims: self.dims.clone(),
            shape,
            data: self.data[start * row..end * row].to_vec(),
            attrs: self.attrs.clone(),
        })
    }

    /// Append `parts` along the leading dimension, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if `parts` is empty or trailing dimensions disagree.
    pub fn concat_rows(parts: &[Self]) -> Result<Self> {
        let Some(first) = parts.first() else {
            bail!("nothing to concatenate");
        };
        ensure!(!first.shape.is_empty(), "cannot concatenate scalar variables");
        let mut out = first.clone();
        for p in &parts[1..] {
            ensure!(
                p.dims == first.dims && p.shape[1..] == first.shape[1..],
                "cannot concatenate {:?}{:?} onto {:?}{:?}",
                p.dims,
                p.shape,
                first.dims,
                first.shape
            );
            out.shape[0] += p.shape[0];
            out.data.extend_from_slice(&p.data);
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub variables: BTreeMap<String, Variable>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

impl Dataset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, var: Variable) -> Self {
        self.variables.insert(name.into(), var);
        self
    }

    /// Length along `dim`, taken from the variables that lead with it.
    ///
    /// # Errors
    ///
    /// Returns an error if variables disagree or a variable holds `dim` in a non-leading position.
    pub fn len_along(&self, dim: &str) -> Result<Option<usize>> {
        let mut len = None;
        for (name, v) in &self.variables {
            if v.leads_with(dim) {
                let rows = v.shape[0];
                match len {
                    None => len = Some(rows),
                    Some(l) if l != rows => {
                        bail!("variable `{name}` has {rows} rows along `{dim}`, expected {l}")
                    }
                    Some(_) => {}
                }
            } else if v.dims.iter().any(|d| d == dim) {
                bail!("variable `{name}` has `{dim}` in a non-leading position");
            }
        }
        Ok(len)
    }

    /// Rows `[start, end)` of every variable that leads with `dim`; others are kept as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if any slice is out of bounds.
    pub fn slice_along(&self, dim: &str, start: usize, end: usize) -> Result<Self> {
        let mut out = Self { variables: BTreeMap::new(), attrs: self.attrs.clone() };
        for (name, v) in &self.variables {
            let v = if v.leads_with(dim) {
                v.slice_rows(start, end)
                    .with_context(|| format!("slice variable `{name}`"))?
            } else {
                v.clone()
            };
            out.variables.insert(name.clone(), v);
        }
        Ok(out)
    }

    /// Concatenate datasets along `dim`. Variables without `dim` come from the first part.
    ///
    /// # Errors
    ///
    /// Returns an error if `parts` is empty or the parts do not share the same variables.
    pub fn concat_along(dim: &str, parts: &[Self]) -> Result<Self> {
        let Some(first) = parts.first() else {
            bail!("nothing to concatenate along `{dim}`");
        };
        let mut out = Self { variables: BTreeMap::new(), attrs: first.attrs.clone() };
        for (name, v) in &first.variables {
            if !v.leads_with(dim) {
                out.variables.insert(name.clone(), v.clone());
                continue;
            }
            let pieces = parts
                .iter()
                .map(|p| {
                    p.variables
                        .get(name)
                        .cloned()
                        .with_context(|| format!("variable `{name}` missing from a part"))
                })
                .collect::<Result<Vec<_>>>()?;
            let joined = Variable::concat_rows(&pieces)
                .with_context(|| format!("concatenate variable `{name}` along `{dim}`"))?;
            out.variables.insert(name.clone(), joined);
        }
        Ok(out)
    }

    /// Union of variables. A name present in several parts must hold identical data.
    ///
    /// # Errors
    ///
    /// Returns an error on conflicting variables.
    pub fn merge(parts: Vec<Self>) -> Result<Self> {
        let mut out = Self::new();
        for part in parts {
            for (k, v) in part.attrs {
                out.attrs.entry(k).or_insert(v);
            }
            for (name, v) in part.variables {
                if let Some(existing) = out.variables.get(&name) {
                    ensure!(*existing == v, "conflicting definitions of variable `{name}`");
                } else {
                    out.variables.insert(name, v);
                }
            }
        }
        Ok(out)
    }
}
