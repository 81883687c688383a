//! Backend-agnostic description of a phased workflow.
//!
//! A [`Pipeline`] is an ordered list of uniquely named [`Stage`]s plus one immutable
//! [`Config`]. It performs no execution; executors in [`crate::executors`] compile it into a
//! plan and run it.
//!
//! A stage is either a singleton (its function runs once with no item) or mapped over a
//! collection of opaque JSON items (its function runs once per item, in no particular order).
//!
//! ```
//! use chunkforge::pipeline::{Pipeline, Stage};
//! use chunkforge::Config;
//! use serde_json::json;
//!
//! let p = Pipeline::new(
//!     vec![
//!         Stage::new("setup", |_, _| Ok(())),
//!         Stage::mapped("work", |item, _| { let _ = item; Ok(()) }, vec![json!("a"), json!(3)]),
//!     ],
//!     Config::new().with("prefix", "p-"),
//! )?;
//!
//! assert_eq!(p.names().collect::<Vec<_>>(), ["setup", "work"]);
//! assert!(p.stage("work")?.is_mappable());
//! # Ok::<(), chunkforge::ForgeError>(())
//! ```

use crate::config::Config;
use crate::error::{ForgeError, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Uniform stage body: `(item, config)`, item is `None` for singleton stages.
pub type StageFn = Arc<dyn Fn(Option<&Value>, &Config) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Stage {
    name: String,
    function: StageFn,
    mappable: Option<Arc<[Value]>>,
}

impl Stage {
    /// A singleton stage.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Option<&Value>, &Config) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { name: name.into(), function: Arc::new(function), mappable: None }
    }

    /// A stage run once per item of `items`.
    pub fn mapped<F>(name: impl Into<String>, function: F, items: Vec<Value>) -> Self
    where
        F: Fn(Option<&Value>, &Config) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { name: name.into(), function: Arc::new(function), mappable: Some(items.into()) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn function(&self) -> &StageFn {
        &self.function
    }

    /// Items this stage is mapped over; `None` for singletons.
    #[must_use]
    pub fn mappable(&self) -> Option<&[Value]> {
        self.mappable.as_deref()
    }

    /// True only for stages built with a non-empty collection.
    #[must_use]
    pub fn is_mappable(&self) -> bool {
        self.mappable.as_ref().is_some_and(|items| !items.is_empty())
    }

    /// Number of invocations this stage will make.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.mappable.as_ref().map_or(1, |items| items.len())
    }
}

impl Debug for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("mappable", &self.mappable)
            .finish_non_exhaustive()
    }
}

/// Equal when name, items and the function object itself are shared.
impl PartialEq for Stage {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.mappable == other.mappable
            && Arc::ptr_eq(&self.function, &other.function)
    }
}

#[derive(Clone, Debug)]
pub struct Pipeline {
    stages: Arc<[Stage]>,
    config: Arc<Config>,
}

impl Pipeline {
    /// # Errors
    ///
    /// Returns [`ForgeError::DuplicateStageName`] if two stages share a name.
    pub fn new(stages: Vec<Stage>, config: Config) -> Result<Self> {
        let mut seen = HashSet::new();
        for s in &stages {
            if !seen.insert(s.name.as_str()) {
                return Err(ForgeError::DuplicateStageName(s.name.clone()));
            }
        }
        Ok(Self { stages: stages.into(), config: Arc::new(config) })
    }

    /// A pipeline with the empty configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::DuplicateStageName`] if two stages share a name.
    pub fn with_stages(stages: Vec<Stage>) -> Result<Self> {
        Self::new(stages, Config::default())
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the config, for plans that outlive a borrow of the pipeline.
    #[must_use]
    pub fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Stage names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(Stage::name)
    }

    /// # Errors
    ///
    /// Returns [`ForgeError::StageNotFound`] for unknown names.
    pub fn stage(&self, name: &str) -> Result<&Stage> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ForgeError::StageNotFound(name.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`ForgeError::StageNotFound`] for unknown names.
    pub fn is_mappable(&self, name: &str) -> Result<bool> {
        self.stage(name).map(Stage::is_mappable)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<'a> IntoIterator for &'a Pipeline {
    type Item = &'a str;
    type IntoIter = std::iter::Map<std::slice::Iter<'a, Stage>, fn(&'a Stage) -> &'a str>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.iter().map(Stage::name as fn(&'a Stage) -> &'a str)
    }
}
