//! Tests for the chunk planner.

use anyhow::Result;
use chunkforge::chunks::{ChunkKey, plan_chunks};
use chunkforge::patterns::{Dimension, InputKey, Pattern};
use chunkforge::ForgeError;
use std::collections::{BTreeMap, HashMap};

fn pattern(ntime: i64, items: usize, with_variable: bool) -> Result<Pattern> {
    let mut dims = vec![Dimension::concat("time", 0..ntime, items)];
    if with_variable {
        dims.push(Dimension::merge("variable", ["foo", "bar"]));
    }
    Ok(Pattern::combine(|k: &InputKey| Ok(k.to_string()), dims)?)
}

fn no_subset() -> BTreeMap<String, usize> {
    BTreeMap::new()
}

#[test]
fn chunks_partition_the_input_keys() -> Result<()> {
    let p = pattern(5, 2, true)?;
    for ipc in 1..=6 {
        let plan = plan_chunks(&p, ipc, &no_subset())?;
        let mut owners: HashMap<InputKey, usize> = HashMap::new();
        for (i, chunk) in plan.keys().enumerate() {
            for key in chunk.input_keys(&p)? {
                assert!(chunk.contains(&key));
                assert!(owners.insert(key, i).is_none(), "key in two chunks (ipc={ipc})");
            }
        }
        assert_eq!(owners.len(), p.len(), "ipc={ipc}");
    }
    Ok(())
}

#[test]
fn windows_step_by_inputs_per_chunk() -> Result<()> {
    let p = pattern(5, 2, false)?;
    let plan = plan_chunks(&p, 2, &no_subset())?;
    let ranges: Vec<(usize, usize)> = plan
        .keys()
        .map(|c| {
            let r = c.range("time").cloned().unwrap_or_else(|| panic!("no time range in {c}"));
            (r.start, r.end)
        })
        .collect();
    assert_eq!(ranges, [(0, 2), (2, 4), (4, 5)]);
    assert_eq!(plan.rows_per_chunk("time"), Some(4));
    Ok(())
}

#[test]
fn merge_dims_are_fixed_per_chunk() -> Result<()> {
    let p = pattern(4, 1, true)?;
    let plan = plan_chunks(&p, 2, &no_subset())?;
    assert_eq!(plan.len(), 2 * 2);
    let first: ChunkKey = plan.keys().next().unwrap_or_else(|| panic!("empty plan"));
    assert_eq!(first.to_string(), "(time=0..2, variable=foo)");
    assert_eq!(first.input_keys(&p)?.len(), 2);
    assert_eq!(plan.inputs_per_chunk(), 2);

    let variable = first.merge_entry("variable").unwrap_or_else(|| panic!("no merge entry"));
    assert_eq!((variable.position, variable.value.as_str()), (0, Some("foo")));
    assert!(first.merge_entry("time").is_none());
    Ok(())
}

#[test]
fn element_region_scales_by_items_per_step() -> Result<()> {
    let p = pattern(5, 3, false)?;
    let plan = plan_chunks(&p, 2, &no_subset())?;
    let regions: Vec<_> = plan
        .keys()
        .map(|c| c.element_region(&p, "time"))
        .collect::<Result<_, _>>()?;
    assert_eq!(regions, [0..6, 6..12, 12..15]);
    Ok(())
}

#[test]
fn subsetting_splits_each_input() -> Result<()> {
    let p = pattern(3, 4, false)?;
    let subset = BTreeMap::from([("time".to_string(), 2)]);
    let plan = plan_chunks(&p, 1, &subset)?;
    assert_eq!(plan.len(), 6);
    assert_eq!(plan.rows_per_chunk("time"), Some(2));

    let regions: Vec<_> = plan
        .keys()
        .map(|c| c.element_region(&p, "time"))
        .collect::<Result<_, _>>()?;
    assert_eq!(regions, [0..2, 2..4, 4..6, 6..8, 8..10, 10..12]);

    let indices: Vec<usize> = plan
        .keys()
        .filter_map(|c| c.range("time").map(|r| r.index))
        .collect();
    assert_eq!(indices, [0, 1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn subset_mismatches_are_reported() -> Result<()> {
    let p = pattern(3, 4, true)?;
    let cases = [
        ("time", 3, 1),
        ("time", 0, 1),
        ("time", 2, 2),
        ("variable", 2, 1),
        ("depth", 2, 1),
    ];
    for (dim, parts, ipc) in cases {
        let subset = BTreeMap::from([(dim.to_string(), parts)]);
        match plan_chunks(&p, ipc, &subset) {
            Err(ForgeError::SubsetMismatch { dim: d, .. }) => assert_eq!(d, dim),
            other => panic!("{dim}/{parts}/{ipc}: expected SubsetMismatch, got {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn zero_inputs_per_chunk_is_invalid() -> Result<()> {
    let p = pattern(3, 1, false)?;
    assert!(matches!(plan_chunks(&p, 0, &no_subset()), Err(ForgeError::InvalidChunking(_))));
    Ok(())
}
