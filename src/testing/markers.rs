use crate::config::Config;
use anyhow::{Result, ensure};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerKind {
    Start,
    Finish,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Marker {
    pub seq: usize,
    pub stage: String,
    pub item: Option<Value>,
    pub kind: MarkerKind,
}

/// Shared, ordered record of invocation start and finish markers.
#[derive(Clone, Default)]
pub struct MarkerLog {
    markers: Arc<Mutex<Vec<Marker>>>,
}

impl MarkerLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: &str, item: Option<&Value>, kind: MarkerKind) {
        let mut markers = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = markers.len();
        markers.push(Marker { seq, stage: stage.to_string(), item: item.cloned(), kind });
    }

    /// Wrap a stage body so every call records a start marker and, on success, a finish marker.
    pub fn instrument<F>(
        &self,
        stage: &str,
        body: F,
    ) -> impl Fn(Option<&Value>, &Config) -> Result<()> + Send + Sync + 'static + use<F>
    where
        F: Fn(Option<&Value>, &Config) -> Result<()> + Send + Sync + 'static,
    {
        let log = self.clone();
        let stage = stage.to_string();
        move |item: Option<&Value>, config: &Config| {
            log.record(&stage, item, MarkerKind::Start);
            body(item, config)?;
            log.record(&stage, item, MarkerKind::Finish);
            Ok(())
        }
    }

    #[must_use]
    pub fn markers(&self) -> Vec<Marker> {
        self.markers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn count(&self, stage: &str, kind: MarkerKind) -> usize {
        self.markers().iter().filter(|m| m.stage == stage && m.kind == kind).count()
    }

    /// Items of `stage` that finished, in finishing order.
    #[must_use]
    pub fn finished_items(&self, stage: &str) -> Vec<Option<Value>> {
        self.markers()
            .into_iter()
            .filter(|m| m.stage == stage && m.kind == MarkerKind::Finish)
            .map(|m| m.item)
            .collect()
    }

    /// Check that, for each consecutive pair in `order`, every marker of the first stage comes
    /// before any marker of the second.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first pair whose markers interleave.
    pub fn check_barriers(&self, order: &[&str]) -> Result<()> {
        let markers = self.markers();
        for pair in order.windows(2) {
            let (before, after) = (pair[0], pair[1]);
            let last_before = markers.iter().filter(|m| m.stage == before).map(|m| m.seq).max();
            let first_after = markers.iter().filter(|m| m.stage == after).map(|m| m.seq).min();
            if let (Some(last), Some(first)) = (last_before, first_after) {
                ensure!(
                    last < first,
                    "stage `{after}` started (marker {first}) before `{before}` closed (marker {last})"
                );
            }
        }
        Ok(())
    }
}
