//! Four-phase recipe that assembles many input files into one chunked store.
//!
//! 1. `cache_input` (mapped over input keys): copy each source into the cache and, when a
//!    [`MetadataStore`] is attached, record the input's [`InputMetadata`].
//! 2. `prepare_target` (singleton): derive the store layout and write non-chunked variables,
//!    from recorded metadata where available.
//! 3. `store_chunk` (mapped over chunk keys): read, concatenate and write one chunk region.
//! 4. `finalize_target` (singleton): consolidate store metadata.
//!
//! [`StoreRecipe::to_pipeline`] expresses these phases as a [`Pipeline`], so any executor can
//! run them; [`StoreRecipe::run_manually`] performs the same side effects directly.
//!
//! ```no_run
//! use chunkforge::io::{FsCache, FsTarget};
//! use chunkforge::patterns::pattern_from_sequence;
//! use chunkforge::recipe::{RecipeOptions, StoreRecipe};
//! use chunkforge::executors::{ParallelExecutor, PipelineExecutor};
//!
//! let pattern = pattern_from_sequence(["day0.json", "day1.json"], "time", 24)?;
//! let recipe = StoreRecipe::new(pattern, FsTarget::new("out.store"), RecipeOptions::default())?
//!     .with_cache(FsCache::new("cache")?);
//! ParallelExecutor::new().run(&recipe.to_pipeline()?)?;
//! # Ok::<(), chunkforge::ForgeError>(())
//! ```

use crate::chunks::{ChunkKey, ChunkKeys, ChunkPlan, plan_chunks};
use crate::config::Config;
use crate::dataset::Dataset;
use crate::error::{ForgeError, Result};
use crate::executors::{
    Flow, FlowExecutor, GraphExecutor, PipelineExecutor, SequentialExecutor, TaskGraph,
};
use crate::io::{
    ArrayCodec, ArraySchema, CacheStore, InputMetadata, JsonCodec, LocalFetcher, MetadataStore,
    SourceFetcher, StoreSchema, TargetStore,
};
use crate::patterns::{InputKey, InputKeys, Pattern};
use crate::pipeline::{Pipeline, Stage};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use tracing::{debug, info};

pub const CACHE_STAGE: &str = "cache_input";
pub const PREPARE_STAGE: &str = "prepare_target";
pub const STORE_STAGE: &str = "store_chunk";
pub const FINALIZE_STAGE: &str = "finalize_target";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeOptions {
    /// Consecutive inputs along the concat dimension written into one chunk.
    pub inputs_per_chunk: usize,
    /// Concat dimension name to the number of parts each input is split into.
    pub subset_inputs: BTreeMap<String, usize>,
    /// Copy inputs into the cache before reading them. Needs a cache to take effect.
    pub cache_inputs: bool,
}

impl Default for RecipeOptions {
    fn default() -> Self {
        Self { inputs_per_chunk: 1, subset_inputs: BTreeMap::new(), cache_inputs: true }
    }
}

impl RecipeOptions {
    #[must_use]
    pub fn with_inputs_per_chunk(mut self, n: usize) -> Self {
        self.inputs_per_chunk = n;
        self
    }

    #[must_use]
    pub fn with_subset(mut self, dim: impl Into<String>, parts: usize) -> Self {
        self.subset_inputs.insert(dim.into(), parts);
        self
    }

    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.cache_inputs = false;
        self
    }
}

/// A pattern bound to chunking options and the collaborators that move data.
#[derive(Clone)]
pub struct StoreRecipe {
    pattern: Pattern,
    options: RecipeOptions,
    plan: ChunkPlan,
    concat_dim: String,
    items_per_step: usize,
    target: Arc<dyn TargetStore>,
    cache: Option<Arc<dyn CacheStore>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    fetcher: Arc<dyn SourceFetcher>,
    codec: Arc<dyn ArrayCodec>,
}

impl Debug for StoreRecipe {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRecipe")
            .field("pattern", &self.pattern)
            .field("options", &self.options)
            .field("chunks", &self.plan.len())
            .field("caches_inputs", &self.caches_inputs())
            .field("records_metadata", &self.metadata.is_some())
            .finish_non_exhaustive()
    }
}

impl StoreRecipe {
    /// Bind `pattern` to `target` with [`LocalFetcher`], [`JsonCodec`] and no cache.
    ///
    /// # Errors
    ///
    /// - [`ForgeError::Recipe`] unless the pattern has exactly one concat dimension.
    /// - Any chunk planning error for `options`.
    pub fn new(
        pattern: Pattern,
        target: impl TargetStore + 'static,
        options: RecipeOptions,
    ) -> Result<Self> {
        let concat: Vec<_> = pattern.concat_dims().collect();
        let [dim] = concat.as_slice() else {
            return Err(ForgeError::Recipe(format!(
                "a store recipe needs exactly one concat dimension, found {}",
                concat.len()
            )));
        };
        let concat_dim = dim.name().to_string();
        let items_per_step = dim.items_per_step().unwrap_or(1);
        let plan = plan_chunks(&pattern, options.inputs_per_chunk, &options.subset_inputs)?;
        Ok(Self {
            pattern,
            options,
            plan,
            concat_dim,
            items_per_step,
            target: Arc::new(target),
            cache: None,
            metadata: None,
            fetcher: Arc::new(LocalFetcher),
            codec: Arc::new(JsonCodec),
        })
    }

    #[must_use]
    pub fn with_cache(mut self, cache: impl CacheStore + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Record per-input metadata in `store` and read it back in `prepare_target`.
    #[must_use]
    pub fn with_metadata(mut self, store: impl MetadataStore + 'static) -> Self {
        self.metadata = Some(Arc::new(store));
        self
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: impl SourceFetcher + 'static) -> Self {
        self.fetcher = Arc::new(fetcher);
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: impl ArrayCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    #[must_use]
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    #[must_use]
    pub fn options(&self) -> &RecipeOptions {
        &self.options
    }

    #[must_use]
    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    #[must_use]
    pub fn concat_dim(&self) -> &str {
        &self.concat_dim
    }

    /// Whether inputs go through the cache: requested and a cache is attached.
    #[must_use]
    pub fn caches_inputs(&self) -> bool {
        self.options.cache_inputs && self.cache.is_some()
    }

    pub fn iter_inputs(&self) -> InputKeys<'_> {
        self.pattern.keys()
    }

    pub fn iter_chunks(&self) -> ChunkKeys<'_> {
        self.plan.keys()
    }

    /// Copy one input into the cache and record its metadata. A cached input is not fetched
    /// again, and an input with recorded metadata is not decoded again.
    ///
    /// # Errors
    ///
    /// Returns an error if formatting, fetching, decoding or a store write fails.
    pub fn cache_input(&self, key: &InputKey) -> Result<()> {
        let Some(cache) = self.cache.as_ref().filter(|_| self.options.cache_inputs) else {
            debug!(%key, "input caching disabled");
            return Ok(());
        };
        let source = self.pattern.source_of(key)?;
        let bytes = if cache.exists(&source)? {
            if !self.lacks_metadata(key)? {
                debug!(%key, %source, "cache hit");
                return Ok(());
            }
            cache.get(&source)?
        } else {
            let bytes = self
                .fetcher
                .fetch(&source)
                .with_context(|| format!("fetch input {key}"))?;
            cache.put(&source, &bytes)?;
            info!(%key, %source, bytes = bytes.len(), "cached input");
            bytes
        };
        if let Some(store) = &self.metadata {
            let ds = self.decode(key, &source, &bytes)?;
            let meta = InputMetadata::describe(&ds, &self.concat_dim)?;
            store.put(&key.to_string(), &meta)?;
            debug!(%key, len = ?meta.concat_len, "recorded input metadata");
        }
        Ok(())
    }

    fn lacks_metadata(&self, key: &InputKey) -> Result<bool> {
        match &self.metadata {
            Some(store) => Ok(store.get(&key.to_string())?.is_none()),
            None => Ok(false),
        }
    }

    fn read_source(&self, key: &InputKey, source: &str) -> Result<Vec<u8>> {
        match &self.cache {
            Some(cache) if self.options.cache_inputs && cache.exists(source)? => {
                debug!(%key, "reading from cache");
                Ok(cache.get(source)?)
            }
            _ => Ok(self.fetcher.fetch(source).with_context(|| format!("fetch input {key}"))?),
        }
    }

    fn decode(&self, key: &InputKey, source: &str, bytes: &[u8]) -> Result<Dataset> {
        Ok(self
            .codec
            .decode(bytes)
            .with_context(|| format!("decode input {key} from {source}"))?)
    }

    fn check_len(&self, key: &InputKey, len: Option<usize>) -> Result<()> {
        if len == Some(self.items_per_step) {
            return Ok(());
        }
        Err(ForgeError::Recipe(format!(
            "input {key} has {} items along `{}`, expected {}",
            len.map_or_else(|| "no".to_string(), |n| n.to_string()),
            self.concat_dim,
            self.items_per_step
        )))
    }

    /// Recorded metadata for `key`, or a summary of the freshly opened input (recorded too
    /// when a store is attached).
    fn input_metadata(&self, key: &InputKey) -> Result<InputMetadata> {
        let name = key.to_string();
        if let Some(store) = &self.metadata
            && let Some(meta) = store.get(&name)?
        {
            debug!(%key, "using recorded metadata");
            return Ok(meta);
        }
        let source = self.pattern.source_of(key)?;
        let ds = self.decode(key, &source, &self.read_source(key, &source)?)?;
        let meta = InputMetadata::describe(&ds, &self.concat_dim)?;
        if let Some(store) = &self.metadata {
            store.put(&name, &meta)?;
        }
        Ok(meta)
    }

    fn open_input(&self, key: &InputKey) -> Result<Dataset> {
        let source = self.pattern.source_of(key)?;
        let ds = self.decode(key, &source, &self.read_source(key, &source)?)?;
        let len = ds.len_along(&self.concat_dim)?;
        self.check_len(key, len)?;
        if let Some(store) = &self.metadata
            && let Some(meta) = store.get(&key.to_string())?
            && meta.concat_len != len
        {
            return Err(ForgeError::Recipe(format!(
                "input {key} changed since its metadata was recorded"
            )));
        }
        Ok(ds)
    }

    /// Lay out the target from the first input of every merge combination and write the
    /// variables that do not run along the concat dimension.
    ///
    /// # Errors
    ///
    /// Returns an error if an input cannot be opened or the target cannot be initialized.
    pub fn prepare_target(&self) -> Result<()> {
        let total_rows = self.pattern.dimension(&self.concat_dim).map_or(0, |d| d.len())
            * self.items_per_step;
        let chunk_rows = self.plan.rows_per_chunk(&self.concat_dim).unwrap_or(total_rows);

        let mut schema = StoreSchema::default();
        let mut fixed = Vec::new();
        for key in self.iter_inputs().filter(|k| k.position(&self.concat_dim) == Some(0)) {
            let meta = self.input_metadata(&key)?;
            self.check_len(&key, meta.concat_len)?;
            for (k, v) in meta.attrs {
                schema.attrs.entry(k).or_insert(v);
            }
            for (name, var) in meta.variables {
                let mut shape = var.shape.clone();
                let mut chunks = var.shape;
                if var.dims.first() == Some(&self.concat_dim) {
                    shape[0] = total_rows;
                    chunks[0] = chunk_rows;
                }
                let array = ArraySchema { dims: var.dims, shape, chunks, attrs: var.attrs };
                match schema.arrays.get(&name) {
                    Some(existing) if *existing != array => {
                        return Err(ForgeError::Recipe(format!(
                            "inputs disagree on the layout of variable `{name}`"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        schema.arrays.insert(name, array);
                    }
                }
            }
            fixed.push(Dataset { variables: meta.fixed, attrs: Map::new() });
        }
        self.target.init(&schema)?;

        for (name, var) in &Dataset::merge(fixed)?.variables {
            self.target.write_variable(name, var)?;
        }
        info!(arrays = schema.arrays.len(), rows = total_rows, chunk_rows, "target prepared");
        Ok(())
    }

    /// Read every input of `chunk`, concatenate them and write the chunk's region.
    ///
    /// # Errors
    ///
    /// Returns an error if an input is malformed or the region write fails.
    pub fn store_chunk(&self, chunk: &ChunkKey) -> Result<()> {
        let range = chunk.range(&self.concat_dim).ok_or_else(|| {
            ForgeError::Recipe(format!("chunk {chunk} has no range over `{}`", self.concat_dim))
        })?;
        let mut parts = Vec::new();
        for key in chunk.input_keys(&self.pattern)? {
            let ds = self.open_input(&key)?;
            parts.push(match range.subset {
                Some(s) => {
                    let len = self.items_per_step / s.parts;
                    ds.slice_along(&self.concat_dim, s.part * len, (s.part + 1) * len)?
                }
                None => ds,
            });
        }
        let combined = Dataset::concat_along(&self.concat_dim, &parts)?;
        let region = chunk.element_region(&self.pattern, &self.concat_dim)?;
        for (name, var) in &combined.variables {
            if var.leads_with(&self.concat_dim) {
                self.target
                    .write_region(name, region.clone(), var)
                    .with_context(|| format!("store chunk {chunk}"))?;
            }
        }
        info!(%chunk, rows = ?region, "stored chunk");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if metadata consolidation fails.
    pub fn finalize_target(&self) -> Result<()> {
        self.target.consolidate_metadata()?;
        info!("target finalized");
        Ok(())
    }

    /// The recipe as a pipeline with the empty config.
    ///
    /// # Errors
    ///
    /// Returns an error if a key cannot be serialized.
    pub fn to_pipeline(&self) -> Result<Pipeline> {
        self.to_pipeline_with_config(Config::default())
    }

    /// The recipe as a pipeline carrying `config`. The cache stage is left out when inputs
    /// are not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if a key cannot be serialized.
    pub fn to_pipeline_with_config(&self, config: Config) -> Result<Pipeline> {
        let recipe = Arc::new(self.clone());
        let mut stages = Vec::with_capacity(4);

        if self.caches_inputs() {
            let inputs = to_items(self.iter_inputs())?;
            let r = Arc::clone(&recipe);
            stages.push(Stage::mapped(
                CACHE_STAGE,
                move |item, _| Ok(r.cache_input(&from_item::<InputKey>(item)?)?),
                inputs,
            ));
        }

        let r = Arc::clone(&recipe);
        stages.push(Stage::new(PREPARE_STAGE, move |_, _| Ok(r.prepare_target()?)));

        let chunks = to_items(self.iter_chunks())?;
        let r = Arc::clone(&recipe);
        stages.push(Stage::mapped(
            STORE_STAGE,
            move |item, _| Ok(r.store_chunk(&from_item::<ChunkKey>(item)?)?),
            chunks,
        ));

        let r = recipe;
        stages.push(Stage::new(FINALIZE_STAGE, move |_, _| Ok(r.finalize_target()?)));

        Pipeline::new(stages, config)
    }

    /// A closure that runs the whole recipe sequentially each time it is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline cannot be built.
    pub fn to_function(&self) -> Result<impl Fn() -> Result<()> + Send + Sync + use<>> {
        let executor = SequentialExecutor::new();
        let plan = executor.compile(&self.to_pipeline()?)?;
        Ok(move || executor.execute(&plan))
    }

    /// # Errors
    ///
    /// Returns an error if the pipeline cannot be built.
    pub fn to_graph(&self) -> Result<TaskGraph> {
        GraphExecutor::new().compile(&self.to_pipeline()?)
    }

    /// # Errors
    ///
    /// Returns an error if the pipeline cannot be built.
    pub fn to_flow(&self) -> Result<Flow> {
        FlowExecutor::new().compile(&self.to_pipeline()?)
    }

    /// Run every phase in order on the calling thread, without a pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first phase error.
    pub fn run_manually(&self) -> Result<()> {
        if self.caches_inputs() {
            for key in self.iter_inputs() {
                self.cache_input(&key)?;
            }
        }
        self.prepare_target()?;
        for chunk in self.iter_chunks() {
            self.store_chunk(&chunk)?;
        }
        self.finalize_target()
    }
}

fn to_items<T: Serialize>(keys: impl Iterator<Item = T>) -> Result<Vec<Value>> {
    keys.map(|k| serde_json::to_value(&k).context("serialize stage item"))
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(ForgeError::from)
}

fn from_item<T: DeserializeOwned>(item: Option<&Value>) -> anyhow::Result<T> {
    let item = item.context("mapped stage invoked without an item")?;
    serde_json::from_value(item.clone()).with_context(|| format!("decode stage item {item}"))
}
