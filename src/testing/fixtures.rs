//! A small daily gridded dataset split across JSON input files.

use crate::dataset::{Dataset, Variable};
use crate::io::{ArrayCodec, JsonCodec};
use crate::patterns::{Dimension, InputKey, Pattern};
use anyhow::{Context, Result, ensure};
use serde_json::{Map, json};
use std::fs;
use std::path::{Path, PathBuf};

pub const DAYS: usize = 10;
pub const NLAT: usize = 18;
pub const NLON: usize = 36;
pub const VARIABLES: [&str; 2] = ["bar", "foo"];

/// How the dataset is split into files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DailyLayout {
    /// Days per file along `time`; must divide the day count.
    pub days_per_file: usize,
    /// Write each data variable to its own file set, adding a `variable` merge dimension.
    pub split_variables: bool,
}

impl Default for DailyLayout {
    fn default() -> Self {
        Self { days_per_file: 1, split_variables: false }
    }
}

pub struct DailyFixture {
    pub dir: PathBuf,
    pub pattern: Pattern,
    pub expected: Dataset,
    pub files: Vec<PathBuf>,
}

fn value_at(var: &str, t: usize, i: usize, j: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let base = t as f64 + (i * NLON + j) as f64 / 1000.0;
    if var == "foo" { base } else { -base }
}

/// The whole dataset: `time`, `lat`, `lon` coordinates plus `foo` and `bar` over all three.
///
/// # Errors
///
/// Returns an error only if a variable is built inconsistently.
#[allow(clippy::cast_precision_loss)]
pub fn daily_dataset() -> Result<Dataset> {
    let mut attrs = Map::new();
    attrs.insert("title".into(), json!("daily test dataset"));
    let mut ds = Dataset { attrs, ..Dataset::default() }
        .with_variable(
            "time",
            Variable::new(vec!["time".into()], vec![DAYS], (0..DAYS).map(|t| t as f64).collect())?,
        )
        .with_variable(
            "lat",
            Variable::new(
                vec!["lat".into()],
                vec![NLAT],
                (0..NLAT).map(|i| -85.0 + 10.0 * i as f64).collect(),
            )?,
        )
        .with_variable(
            "lon",
            Variable::new(
                vec!["lon".into()],
                vec![NLON],
                (0..NLON).map(|j| 5.0 + 10.0 * j as f64).collect(),
            )?,
        );
    for var in VARIABLES {
        let mut data = Vec::with_capacity(DAYS * NLAT * NLON);
        for t in 0..DAYS {
            for i in 0..NLAT {
                for j in 0..NLON {
                    data.push(value_at(var, t, i, j));
                }
            }
        }
        let mut vattrs = Map::new();
        vattrs.insert("units".into(), json!("K"));
        ds = ds.with_variable(
            var,
            Variable::new(
                vec!["time".into(), "lat".into(), "lon".into()],
                vec![DAYS, NLAT, NLON],
                data,
            )?
            .with_attrs(vattrs),
        );
    }
    Ok(ds)
}

fn file_name(variable: Option<&str>, index: usize) -> String {
    match variable {
        Some(v) => format!("{v}_{index:03}.json"),
        None => format!("{index:03}.json"),
    }
}

/// Write the daily dataset under `dir` according to `layout`.
///
/// # Errors
///
/// Returns an error if the layout does not divide the days evenly or a file cannot be written.
pub fn write_daily_dataset(dir: impl AsRef<Path>, layout: DailyLayout) -> Result<DailyFixture> {
    let dir = dir.as_ref().to_path_buf();
    let per_file = layout.days_per_file;
    ensure!(
        per_file > 0 && DAYS.is_multiple_of(per_file),
        "{per_file} days per file does not divide {DAYS} days"
    );
    fs::create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;

    let expected = daily_dataset()?;
    let nfiles = DAYS / per_file;
    let variables: Vec<Option<&str>> = if layout.split_variables {
        VARIABLES.iter().copied().map(Some).collect()
    } else {
        vec![None]
    };

    let mut files = Vec::new();
    for index in 0..nfiles {
        let day_slice = expected.slice_along("time", index * per_file, (index + 1) * per_file)?;
        for &variable in &variables {
            let mut part = day_slice.clone();
            if let Some(keep) = variable {
                part.variables.retain(|name, _| {
                    !VARIABLES.contains(&name.as_str()) || name == keep
                });
            }
            let path = dir.join(file_name(variable, index));
            fs::write(&path, JsonCodec.encode(&part)?)
                .with_context(|| format!("write {}", path.display()))?;
            files.push(path);
        }
    }

    let mut dims = vec![Dimension::concat("time", (0..nfiles).map(|i| i as i64), per_file)];
    if layout.split_variables {
        dims.push(Dimension::merge("variable", VARIABLES));
    }
    let root = dir.clone();
    let pattern = Pattern::combine(
        move |key: &InputKey| {
            let index = key
                .position("time")
                .context("key has no `time` dimension")?;
            let variable = key.value("variable").and_then(|v| v.as_str());
            Ok(root.join(file_name(variable, index)).display().to_string())
        },
        dims,
    )?;

    Ok(DailyFixture { dir, pattern, expected, files })
}
