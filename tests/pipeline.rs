//! Tests for the stage / pipeline model and its configuration.

use anyhow::Result;
use chunkforge::config::Config;
use chunkforge::pipeline::{Pipeline, Stage};
use chunkforge::ForgeError;
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn names_iterate_in_declaration_order() -> Result<()> {
    let p = Pipeline::with_stages(vec![
        Stage::new("c", |_, _| Ok(())),
        Stage::new("a", |_, _| Ok(())),
        Stage::new("b", |_, _| Ok(())),
    ])?;
    assert_eq!(p.names().collect::<Vec<_>>(), ["c", "a", "b"]);
    assert_eq!((&p).into_iter().collect::<Vec<_>>(), ["c", "a", "b"]);
    assert_eq!(p.len(), 3);
    Ok(())
}

#[test]
fn duplicate_stage_names_are_rejected() {
    let err = Pipeline::with_stages(vec![
        Stage::new("a", |_, _| Ok(())),
        Stage::new("a", |_, _| Ok(())),
    ])
    .unwrap_err();
    assert!(matches!(err, ForgeError::DuplicateStageName(ref n) if n == "a"));
}

#[test]
fn lookup_by_name() -> Result<()> {
    let p = Pipeline::with_stages(vec![
        Stage::new("a", |_, _| Ok(())),
        Stage::mapped("b", |_, _| Ok(()), vec![json!("x"), json!("y"), json!(3)]),
        Stage::mapped("c", |_, _| Ok(()), vec![]),
    ])?;

    assert!(!p.is_mappable("a")?);
    assert!(p.is_mappable("b")?);
    assert_eq!(p.stage("b")?.mappable().map(<[_]>::len), Some(3));
    assert_eq!(p.stage("b")?.invocation_count(), 3);

    // An empty collection is not mappable and makes no calls.
    assert!(!p.is_mappable("c")?);
    assert_eq!(p.stage("c")?.invocation_count(), 0);

    assert!(matches!(p.stage("z"), Err(ForgeError::StageNotFound(ref n)) if n == "z"));
    assert!(matches!(p.is_mappable("z"), Err(ForgeError::StageNotFound(_))));
    Ok(())
}

#[test]
fn missing_config_is_empty_object() -> Result<()> {
    let p = Pipeline::with_stages(vec![Stage::new("a", |_, _| Ok(()))])?;
    assert!(p.config().is_empty());
    assert_eq!(p.config().to_value(), json!({}));
    Ok(())
}

#[test]
fn config_builders_and_accessors() -> Result<()> {
    let config = Config::new().with("prefix", "p-").with("log_level", "debug").with("n", 3);
    assert_eq!(config.get_str("prefix"), Some("p-"));
    assert_eq!(config.log_level(), Some("debug"));
    assert_eq!(config.get("n"), Some(&json!(3)));
    assert_eq!(config.len(), 3);
    assert_eq!(config.as_map().keys().collect::<Vec<_>>(), ["log_level", "n", "prefix"]);

    assert_eq!(Config::from_value(json!(null))?, Config::new());
    assert!(Config::from_value(json!([1, 2])).is_err());
    Ok(())
}

#[test]
fn config_loads_from_json_file() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    write!(file, r#"{{"prefix": "p-", "log_level": "info"}}"#)?;
    let config = Config::from_json_file(file.path())?;
    assert_eq!(config.get_str("prefix"), Some("p-"));
    assert_eq!(config.log_level(), Some("info"));
    Ok(())
}

#[test]
fn stages_compare_by_shared_function() {
    let a = Stage::new("a", |_, _| Ok(()));
    let same = a.clone();
    let other = Stage::new("a", |_, _| Ok(()));
    assert_eq!(a, same);
    assert_ne!(a, other);
}

#[test]
fn logging_follows_config_and_installs_once() {
    let config = Config::new().with("log_level", "chunkforge=debug");
    assert_eq!(chunkforge::logging::filter_for(&config).to_string(), "chunkforge=debug");

    chunkforge::logging::init_from_config(&config);
    assert!(!chunkforge::logging::init_from_config(&Config::new()));
}
