//! Tests for caches, fetchers, codecs and the filesystem target.

use anyhow::Result;
use chunkforge::dataset::{Dataset, Variable};
use chunkforge::io::cache::cache_file_name;
use chunkforge::io::{
    ArrayCodec, ArraySchema, CacheStore, FsCache, FsMetadata, FsTarget, InputMetadata, JsonCodec,
    LocalFetcher, MemoryCache, MetadataStore, SourceFetcher, StoreSchema, TargetStore,
};
use serde_json::{Map, json};
use std::collections::BTreeMap;
use std::fs;
use tempfile::TempDir;

#[macro_use]
mod macros;

fn rows(dim: &str, n: usize, width: usize, offset: f64) -> Result<Variable> {
    #[allow(clippy::cast_precision_loss)]
    let data = (0..n * width).map(|i| offset + i as f64).collect();
    Ok(Variable::new(vec![dim.into(), "x".into()], vec![n, width], data)?)
}

#[test]
fn cache_names_hide_query_strings() {
    let a = cache_file_name("https://data.example/day_001.json?token=s3cr3t");
    let b = cache_file_name("https://data.example/day_001.json?token=other");
    assert!(a.ends_with("-day_001.json"), "{a}");
    assert!(!a.contains("s3cr3t"));
    assert_ne!(a, b);
    assert_eq!(a, cache_file_name("https://data.example/day_001.json?token=s3cr3t"));

    let odd = cache_file_name("/data/with space/f(1).json");
    assert!(odd.ends_with("-f_1_.json"), "{odd}");
}

#[test]
fn memory_cache_round_trip() -> Result<()> {
    let cache = MemoryCache::new();
    assert!(cache.is_empty());
    assert!(!cache.exists("a")?);
    cache.put("a", b"bytes")?;
    assert!(cache.exists("a")?);
    assert_eq!(cache.get("a")?, b"bytes");
    assert!(cache.get("b").is_err());
    assert_eq!(cache.len(), 1);
    Ok(())
}

#[test]
fn fs_cache_stores_under_hashed_names() -> Result<()> {
    let dir = TempDir::new()?;
    let cache = FsCache::new(dir.path().join("cache"))?;
    let source = "file:///inputs/a.json?sig=abc";
    cache.put(source, b"{}")?;
    assert!(cache.exists(source)?);
    assert_eq!(cache.get(source)?, b"{}");

    let names: Vec<String> = fs::read_dir(cache.root())?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    assert_eq!(names, [cache_file_name(source)]);
    Ok(())
}

#[test]
fn local_fetcher_reads_paths_and_file_urls() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("in.json");
    fs::write(&path, "hello")?;

    assert_eq!(LocalFetcher.fetch(&path.display().to_string())?, b"hello");
    assert_eq!(LocalFetcher.fetch(&format!("file://{}?x=1", path.display()))?, b"hello");
    assert!(LocalFetcher.fetch("s3://bucket/in.json").is_err());
    assert!(LocalFetcher.fetch(&dir.path().join("missing").display().to_string()).is_err());
    Ok(())
}

#[test]
fn json_codec_rejects_inconsistent_variables() -> Result<()> {
    let ds = Dataset::new().with_variable("v", rows("time", 2, 3, 0.0)?);
    let decoded = JsonCodec.decode(&JsonCodec.encode(&ds)?)?;
    assert_eq!(decoded.len_along("time")?, Some(2));

    let bad = json!({"variables": {"v": {"dims": ["time"], "shape": [3], "data": [1.0]}}});
    assert!(JsonCodec.decode(bad.to_string().as_bytes()).is_err());
    Ok(())
}

#[test]
fn dataset_concat_and_slice_along_leading_dim() -> Result<()> {
    let lat = Variable::new(vec!["lat".into()], vec![2], vec![-1.0, 1.0])?;
    let a = Dataset::new().with_variable("v", rows("time", 2, 2, 0.0)?).with_variable("lat", lat.clone());
    let b = Dataset::new().with_variable("v", rows("time", 1, 2, 10.0)?).with_variable("lat", lat);

    let joined = Dataset::concat_along("time", &[a, b])?;
    assert_eq!(joined.len_along("time")?, Some(3));
    assert_eq!(joined.variables["v"].data, [0.0, 1.0, 2.0, 3.0, 10.0, 11.0]);
    assert_eq!(joined.variables["lat"].shape, [2]);

    let tail = joined.slice_along("time", 1, 3)?;
    assert_eq!(tail.variables["v"].data, [2.0, 3.0, 10.0, 11.0]);
    assert!(joined.slice_along("time", 2, 5).is_err());
    Ok(())
}

#[test]
fn dataset_merge_rejects_conflicts() -> Result<()> {
    let a = Dataset::new().with_variable("v", rows("time", 1, 2, 0.0)?);
    let same = a.clone();
    let other = Dataset::new().with_variable("v", rows("time", 1, 2, 5.0)?);
    assert_eq!(Dataset::merge(vec![a.clone(), same])?.variables.len(), 1);
    assert!(Dataset::merge(vec![a, other]).is_err());
    Ok(())
}

fn schema(total_rows: usize, chunk_rows: usize) -> StoreSchema {
    let mut attrs = Map::new();
    attrs.insert("title".into(), json!("t"));
    StoreSchema {
        arrays: BTreeMap::from([
            (
                "v".to_string(),
                ArraySchema {
                    dims: vec!["time".into(), "x".into()],
                    shape: vec![total_rows, 2],
                    chunks: vec![chunk_rows, 2],
                    attrs: Map::new(),
                },
            ),
            (
                "x".to_string(),
                ArraySchema {
                    dims: vec!["x".into()],
                    shape: vec![2],
                    chunks: vec![2],
                    attrs: Map::new(),
                },
            ),
        ]),
        attrs,
    }
}

#[test]
fn target_regions_assemble_in_chunk_order() -> Result<()> {
    let dir = TempDir::new()?;
    let target = FsTarget::new(dir.path().join("store"));
    target.init(&schema(5, 2))?;
    assert_eq!(target.array_schema("v")?.chunk_count(), 3);

    // Regions may land in any order.
    target.write_region("v", 4..5, &rows("time", 1, 2, 40.0)?)?;
    target.write_region("v", 0..2, &rows("time", 2, 2, 0.0)?)?;
    target.write_region("v", 2..4, &rows("time", 2, 2, 20.0)?)?;
    target.write_variable("x", &Variable::new(vec!["x".into()], vec![2], vec![7.0, 8.0])?)?;

    let v = target.read_variable("v")?;
    assert_eq!(v.shape, [5, 2]);
    for (actual, expected) in v.data.iter().zip([0.0, 1.0, 2.0, 3.0, 20.0, 21.0, 22.0, 23.0, 40.0, 41.0]) {
        assert_approx_eq!(*actual, expected);
    }
    assert_eq!(target.read_variable("x")?.data, [7.0, 8.0]);
    Ok(())
}

#[test]
fn target_rejects_misaligned_regions() -> Result<()> {
    let dir = TempDir::new()?;
    let target = FsTarget::new(dir.path());
    target.init(&schema(6, 2))?;
    assert!(target.write_region("v", 1..3, &rows("time", 2, 2, 0.0)?).is_err());
    assert!(target.write_region("v", 0..4, &rows("time", 4, 2, 0.0)?).is_err());
    assert!(target.write_region("v", 0..2, &rows("time", 1, 2, 0.0)?).is_err());
    assert!(target.write_region("missing", 0..2, &rows("time", 2, 2, 0.0)?).is_err());
    Ok(())
}

#[test]
fn consolidation_gathers_all_metadata() -> Result<()> {
    let dir = TempDir::new()?;
    let target = FsTarget::new(dir.path());
    target.init(&schema(4, 2))?;
    assert!(!target.is_consolidated());
    assert!(target.consolidated()?.is_none());

    target.consolidate_metadata()?;
    let doc = target.consolidated()?.unwrap_or_default();
    assert_eq!(doc["consolidated_format"], 1);
    assert_eq!(doc["metadata"][".zattrs"]["title"], "t");
    assert_eq!(doc["metadata"]["v/.zarray"]["chunks"], json!([2, 2]));
    assert_eq!(doc["metadata"]["x/.zarray"]["shape"], json!([2]));
    Ok(())
}

#[test]
fn input_metadata_describes_and_persists() -> Result<()> {
    let ds = Dataset::new()
        .with_variable("v", rows("time", 3, 2, 0.0)?)
        .with_variable("lat", Variable::new(vec!["lat".into()], vec![2], vec![10.0, 20.0])?);
    let meta = InputMetadata::describe(&ds, "time")?;
    assert_eq!(meta.concat_len, Some(3));
    assert_eq!(meta.variables["v"].dims, ["time", "x"]);
    assert_eq!(meta.variables["lat"].shape, [2]);
    assert_eq!(meta.fixed.keys().collect::<Vec<_>>(), ["lat"]);

    let dir = TempDir::new()?;
    let store = FsMetadata::new(dir.path().join("meta"))?;
    let key = "(time=0, variable=v)";
    assert_eq!(store.get(key)?, None);
    store.put(key, &meta)?;
    assert_eq!(store.get(key)?, Some(meta));
    assert_eq!(fs::read_dir(store.root())?.count(), 1);

    fs::write(store.path_for(key), b"not json")?;
    assert!(store.get(key).is_err());
    Ok(())
}
