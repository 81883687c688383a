use super::{Observer, PipelineExecutor, StagePlan, bind, worker_count, worker_pool};
use crate::error::{ForgeError, Result};
#[cfg(feature = "metrics")]
use crate::metrics::MetricsCollector;
use crate::pipeline::Pipeline;
use rayon::prelude::*;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Runs the invocations of each stage concurrently on a bounded rayon pool.
///
/// A fresh pool is built per [`PipelineExecutor::execute`]; each worker installs the config's
/// log settings when it starts. Every call of a stage is submitted and the stage joins on all
/// of them, so a failing call does not cancel its siblings. The first failure to complete is
/// reported and no later stage starts.
#[derive(Clone, Default)]
pub struct ParallelExecutor {
    threads: Option<usize>,
    observer: Observer,
}

impl ParallelExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the pool at `threads` workers (the default is one per CPU).
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        worker_count(self.threads)
    }

    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.observer = Observer::with_metrics(metrics);
        self
    }
}

impl PipelineExecutor for ParallelExecutor {
    type Plan = StagePlan;

    fn compile(&self, pipeline: &Pipeline) -> Result<StagePlan> {
        Ok(bind(pipeline, &self.observer))
    }

    fn execute(&self, plan: &StagePlan) -> Result<()> {
        let pool = worker_pool(self.threads(), plan.shared_config())?;
        self.observer.run_started();
        let result = pool.install(|| {
            for stage in plan.stages() {
                info!(stage = stage.name(), calls = stage.calls().len(), "stage starting");
                let first_failure: Mutex<Option<ForgeError>> = Mutex::new(None);
                stage.calls().par_iter().for_each(|call| {
                    if let Err(e) = call.call() {
                        let mut slot = first_failure.lock().unwrap_or_else(PoisonError::into_inner);
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                });
                if let Some(e) = first_failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
                    warn!(stage = stage.name(), "stage failed; later stages skipped");
                    return Err(e);
                }
            }
            Ok(())
        });
        self.observer.run_finished();
        result
    }
}
