//! End-to-end tests for the four-phase store recipe.

use anyhow::Result;
use chunkforge::executors::{
    FlowExecutor, GraphExecutor, ParallelExecutor, PipelineExecutor, SequentialExecutor,
};
use chunkforge::dataset::Dataset;
use chunkforge::io::{
    ArrayCodec, FsCache, FsMetadata, FsTarget, JsonCodec, LocalFetcher, MemoryCache,
    MemoryMetadata, MetadataStore, SourceFetcher,
};
use chunkforge::patterns::{Dimension, InputKey, Pattern};
use chunkforge::recipe::{
    CACHE_STAGE, FINALIZE_STAGE, PREPARE_STAGE, RecipeOptions, STORE_STAGE, StoreRecipe,
};
use chunkforge::testing::{DailyFixture, DailyLayout, write_daily_dataset};
use chunkforge::ForgeError;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

#[macro_use]
mod macros;

#[derive(Clone, Default)]
struct CountingFetcher {
    fetches: Arc<AtomicUsize>,
}

impl SourceFetcher for CountingFetcher {
    fn fetch(&self, source: &str) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        LocalFetcher.fetch(source)
    }
}

#[derive(Clone, Default)]
struct CountingCodec {
    decodes: Arc<AtomicUsize>,
}

impl ArrayCodec for CountingCodec {
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Dataset> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        JsonCodec.decode(bytes)
    }

    fn encode(&self, dataset: &Dataset) -> anyhow::Result<Vec<u8>> {
        JsonCodec.encode(dataset)
    }
}

struct OfflineFetcher;

impl SourceFetcher for OfflineFetcher {
    fn fetch(&self, source: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("offline: cannot fetch {source}")
    }
}

fn assert_store_matches(store: &Path, fixture: &DailyFixture) -> Result<()> {
    let target = FsTarget::new(store);
    assert_eq!(target.array_names()?, ["bar", "foo", "lat", "lon", "time"]);
    for (name, expected) in &fixture.expected.variables {
        let actual = target.read_variable(name)?;
        assert_variable_close!(actual, expected, name);
        assert_eq!(actual.attrs, expected.attrs, "attrs of {name}");
    }
    assert!(target.is_consolidated());
    Ok(())
}

#[test]
fn manual_run_writes_the_full_store() -> Result<()> {
    let tmp = TempDir::new()?;
    let fixture = write_daily_dataset(tmp.path().join("inputs"), DailyLayout::default())?;
    let store = tmp.path().join("store");
    let cache = MemoryCache::new();

    let recipe = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(&store),
        RecipeOptions::default(),
    )?
    .with_cache(cache.clone());
    assert_eq!(recipe.plan().len(), 10);
    recipe.run_manually()?;

    assert_eq!(cache.len(), 10);
    assert_store_matches(&store, &fixture)?;

    let schema = FsTarget::new(&store).array_schema("foo")?;
    assert_eq!(schema.shape, [10, 18, 36]);
    assert_eq!(schema.chunks, [1, 18, 36]);
    Ok(())
}

#[test]
fn every_executor_builds_the_same_store() -> Result<()> {
    let tmp = TempDir::new()?;
    let layout = DailyLayout { days_per_file: 2, split_variables: true };
    let fixture = write_daily_dataset(tmp.path().join("inputs"), layout)?;
    let options = RecipeOptions::default().with_inputs_per_chunk(2);

    let recipe_for = |name: &str| -> Result<StoreRecipe> {
        let cache = FsCache::new(tmp.path().join(format!("cache-{name}")))?;
        Ok(StoreRecipe::new(
            fixture.pattern.clone(),
            FsTarget::new(tmp.path().join(name)),
            options.clone(),
        )?
        .with_cache(cache))
    };

    recipe_for("manual")?.run_manually()?;
    SequentialExecutor::new().run(&recipe_for("sequential")?.to_pipeline()?)?;
    ParallelExecutor::new().with_threads(4).run(&recipe_for("parallel")?.to_pipeline()?)?;
    GraphExecutor::new().execute(&recipe_for("graph")?.to_graph()?)?;
    FlowExecutor::new().execute(&recipe_for("flow")?.to_flow()?)?;
    (recipe_for("function")?.to_function()?)()?;

    for name in ["manual", "sequential", "parallel", "graph", "flow", "function"] {
        assert_store_matches(&tmp.path().join(name), &fixture)?;
        let schema = FsTarget::new(tmp.path().join(name)).array_schema("time")?;
        assert_eq!(schema.chunks, [4], "{name}");
    }
    Ok(())
}

#[test]
fn subset_inputs_write_one_chunk_per_part() -> Result<()> {
    let tmp = TempDir::new()?;
    let layout = DailyLayout { days_per_file: 2, split_variables: false };
    let fixture = write_daily_dataset(tmp.path().join("inputs"), layout)?;
    let store = tmp.path().join("store");

    let recipe = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(&store),
        RecipeOptions::default().with_subset("time", 2).without_cache(),
    )?;
    assert_eq!(recipe.plan().len(), 10);
    ParallelExecutor::new().run(&recipe.to_pipeline()?)?;

    assert_store_matches(&store, &fixture)?;
    assert_eq!(FsTarget::new(&store).array_schema("foo")?.chunks, [1, 18, 36]);
    Ok(())
}

#[test]
fn cache_input_is_idempotent() -> Result<()> {
    let tmp = TempDir::new()?;
    let fixture = write_daily_dataset(tmp.path().join("inputs"), DailyLayout::default())?;
    let fetcher = CountingFetcher::default();
    let recipe = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(tmp.path().join("store")),
        RecipeOptions::default(),
    )?
    .with_cache(FsCache::new(tmp.path().join("cache"))?)
    .with_fetcher(fetcher.clone());

    let first = fixture.pattern.key_at(&[0])?;
    recipe.cache_input(&first)?;
    recipe.cache_input(&first)?;
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    for key in recipe.iter_inputs() {
        recipe.cache_input(&key)?;
    }
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 10);

    // Storing reads only from the cache.
    recipe.prepare_target()?;
    for chunk in recipe.iter_chunks() {
        recipe.store_chunk(&chunk)?;
    }
    recipe.finalize_target()?;
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 10);
    Ok(())
}

#[test]
fn recorded_metadata_spares_prepare_from_reopening_inputs() -> Result<()> {
    let tmp = TempDir::new()?;
    let fixture = write_daily_dataset(tmp.path().join("inputs"), DailyLayout::default())?;
    let store = tmp.path().join("store");
    let fetcher = CountingFetcher::default();
    let codec = CountingCodec::default();
    let metadata = MemoryMetadata::new();
    let recipe = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(&store),
        RecipeOptions::default(),
    )?
    .with_cache(MemoryCache::new())
    .with_metadata(metadata.clone())
    .with_fetcher(fetcher.clone())
    .with_codec(codec.clone());

    for key in recipe.iter_inputs() {
        recipe.cache_input(&key)?;
    }
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 10);
    assert_eq!(codec.decodes.load(Ordering::SeqCst), 10);
    assert_eq!(metadata.len(), 10);

    let first = fixture.pattern.key_at(&[0])?;
    let meta = metadata.get(&first.to_string())?.expect("recorded while caching");
    assert_eq!(meta.concat_len, Some(1));
    assert_eq!(meta.variables["foo"].shape, [1, 18, 36]);
    assert_eq!(meta.fixed.keys().collect::<Vec<_>>(), ["lat", "lon"]);

    recipe.prepare_target()?;
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 10);
    assert_eq!(codec.decodes.load(Ordering::SeqCst), 10);

    for chunk in recipe.iter_chunks() {
        recipe.store_chunk(&chunk)?;
    }
    recipe.finalize_target()?;
    assert_store_matches(&store, &fixture)?;
    Ok(())
}

#[test]
fn metadata_on_disk_outlives_the_recipe_that_wrote_it() -> Result<()> {
    let tmp = TempDir::new()?;
    let layout = DailyLayout { days_per_file: 2, split_variables: true };
    let fixture = write_daily_dataset(tmp.path().join("inputs"), layout)?;
    let fetcher = CountingFetcher::default();
    let cache = FsCache::new(tmp.path().join("cache"))?;

    // Warm the cache first, then attach a metadata store to the same cache.
    let warm = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(tmp.path().join("warm")),
        RecipeOptions::default(),
    )?
    .with_cache(cache.clone())
    .with_fetcher(fetcher.clone());
    for key in warm.iter_inputs() {
        warm.cache_input(&key)?;
    }
    let described = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(tmp.path().join("described")),
        RecipeOptions::default(),
    )?
    .with_cache(cache)
    .with_metadata(FsMetadata::new(tmp.path().join("meta"))?)
    .with_fetcher(fetcher.clone());
    for key in described.iter_inputs() {
        described.cache_input(&key)?;
    }
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 10);

    let meta = FsMetadata::new(tmp.path().join("meta"))?;
    let first = fixture.pattern.key_at(&[0, 1])?;
    assert!(meta.path_for(&first.to_string()).is_file());

    let store = tmp.path().join("store");
    let offline = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(&store),
        RecipeOptions::default().without_cache(),
    )?
    .with_metadata(meta)
    .with_fetcher(OfflineFetcher);
    offline.prepare_target()?;

    let target = FsTarget::new(&store);
    assert_eq!(target.array_names()?, ["bar", "foo", "lat", "lon", "time"]);
    assert_eq!(target.array_schema("foo")?.shape, [10, 18, 36]);
    assert_eq!(target.array_schema("time")?.chunks, [2]);
    let lat = target.read_variable("lat")?;
    assert_variable_close!(lat, &fixture.expected.variables["lat"], "lat");
    Ok(())
}

#[test]
fn stale_metadata_is_rejected() -> Result<()> {
    let tmp = TempDir::new()?;
    let fixture = write_daily_dataset(tmp.path().join("inputs"), DailyLayout::default())?;
    let metadata = MemoryMetadata::new();
    let recipe = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(tmp.path().join("store")),
        RecipeOptions::default().without_cache(),
    )?
    .with_metadata(metadata.clone());

    recipe.prepare_target()?;
    assert_eq!(metadata.len(), 1, "only the first input along time is described");

    let first = fixture.pattern.key_at(&[0])?;
    let mut meta = metadata.get(&first.to_string())?.expect("described by prepare");
    meta.concat_len = Some(2);
    metadata.put(&first.to_string(), &meta)?;

    let err = recipe.prepare_target().expect_err("recorded length is wrong");
    assert!(format!("{err:#}").contains("expected 1"), "{err:#}");

    let chunk = recipe.iter_chunks().next().expect("plan has chunks");
    let err = recipe.store_chunk(&chunk).expect_err("input no longer matches");
    assert!(format!("{err:#}").contains("changed since"), "{err:#}");
    Ok(())
}

#[test]
fn pipeline_shape_follows_caching() -> Result<()> {
    let tmp = TempDir::new()?;
    let fixture = write_daily_dataset(tmp.path().join("inputs"), DailyLayout::default())?;

    let cached = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(tmp.path().join("a")),
        RecipeOptions::default(),
    )?
    .with_cache(MemoryCache::new());
    let p = cached.to_pipeline()?;
    assert_eq!(
        p.names().collect::<Vec<_>>(),
        [CACHE_STAGE, PREPARE_STAGE, STORE_STAGE, FINALIZE_STAGE]
    );
    assert_eq!(p.stage(CACHE_STAGE)?.invocation_count(), 10);
    assert_eq!(p.stage(STORE_STAGE)?.invocation_count(), 10);
    assert!(!p.is_mappable(PREPARE_STAGE)?);

    // Caching requested without a cache, and a cache with caching turned off.
    let no_cache = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(tmp.path().join("b")),
        RecipeOptions::default(),
    )?;
    let disabled = StoreRecipe::new(
        fixture.pattern.clone(),
        FsTarget::new(tmp.path().join("c")),
        RecipeOptions::default().without_cache(),
    )?
    .with_cache(MemoryCache::new());
    for recipe in [no_cache, disabled] {
        assert!(!recipe.caches_inputs());
        assert_eq!(
            recipe.to_pipeline()?.names().collect::<Vec<_>>(),
            [PREPARE_STAGE, STORE_STAGE, FINALIZE_STAGE]
        );
    }
    Ok(())
}

#[test]
fn recipe_needs_exactly_one_concat_dimension() -> Result<()> {
    let tmp = TempDir::new()?;
    let format = |k: &InputKey| Ok(k.to_string());

    let two = Pattern::combine(
        format,
        [Dimension::concat("time", 0..2, 1), Dimension::concat("depth", 0..2, 1)],
    )?;
    let none = Pattern::combine(format, [Dimension::merge("variable", ["foo"])])?;

    for pattern in [two, none] {
        let err = StoreRecipe::new(pattern, FsTarget::new(tmp.path()), RecipeOptions::default())
            .expect_err("not exactly one concat dimension");
        assert!(matches!(err, ForgeError::Recipe(_)), "{err}");
    }
    Ok(())
}

#[test]
fn malformed_input_fails_the_stage_that_reads_it() -> Result<()> {
    let tmp = TempDir::new()?;
    let fixture = write_daily_dataset(tmp.path().join("inputs"), DailyLayout::default())?;
    let dir = fixture.dir.clone();
    // Files hold one day each, but the pattern claims three.
    let wrong = Pattern::combine(
        move |k: &InputKey| {
            let t = k.position("time").unwrap_or_default();
            Ok(dir.join(format!("{t:03}.json")).display().to_string())
        },
        [Dimension::concat("time", 0..10, 3)],
    )?;
    let recipe = StoreRecipe::new(
        wrong,
        FsTarget::new(tmp.path().join("store")),
        RecipeOptions::default(),
    )?;

    let err = SequentialExecutor::new()
        .run(&recipe.to_pipeline()?)
        .expect_err("inputs are one day long");
    assert_eq!(err.failed_stage(), Some(PREPARE_STAGE));
    assert!(format!("{err:#}").contains("expected 3"), "{err:#}");
    Ok(())
}

#[test]
fn options_deserialize_with_defaults() -> Result<()> {
    let options: RecipeOptions = serde_json::from_str(r#"{"subset_inputs": {"time": 2}}"#)?;
    assert_eq!(options.inputs_per_chunk, 1);
    assert!(options.cache_inputs);
    assert_eq!(options.subset_inputs.get("time"), Some(&2));
    Ok(())
}
