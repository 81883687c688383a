//! Decoding raw input bytes into [`Dataset`]s and back.

use crate::dataset::Dataset;
use anyhow::{Context, Result};

pub trait ArrayCodec: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoding.
    fn decode(&self, bytes: &[u8]) -> Result<Dataset>;

    /// # Errors
    ///
    /// Returns an error if the dataset cannot be encoded.
    fn encode(&self, dataset: &Dataset) -> Result<Vec<u8>>;
}

/// JSON documents shaped like [`Dataset`].
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl ArrayCodec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Dataset> {
        let ds: Dataset = serde_json::from_slice(bytes).context("decode JSON dataset")?;
        for (name, v) in &ds.variables {
            v.check().with_context(|| format!("variable `{name}`"))?;
        }
        Ok(ds)
    }

    fn encode(&self, dataset: &Dataset) -> Result<Vec<u8>> {
        serde_json::to_vec(dataset).context("encode JSON dataset")
    }
}
