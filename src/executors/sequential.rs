use super::{Observer, PipelineExecutor, StagePlan, bind};
use crate::error::Result;
#[cfg(feature = "metrics")]
use crate::metrics::MetricsCollector;
use crate::pipeline::Pipeline;
use tracing::info;

/// Runs every invocation on the calling thread, in declaration and collection order.
///
/// Stops at the first failure, so later items of the failing stage are not attempted either.
#[derive(Clone, Default)]
pub struct SequentialExecutor {
    observer: Observer,
}

impl SequentialExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.observer = Observer::with_metrics(metrics);
        self
    }
}

impl PipelineExecutor for SequentialExecutor {
    type Plan = StagePlan;

    fn compile(&self, pipeline: &Pipeline) -> Result<StagePlan> {
        Ok(bind(pipeline, &self.observer))
    }

    fn execute(&self, plan: &StagePlan) -> Result<()> {
        self.observer.run_started();
        let result = plan.stages().iter().try_for_each(|stage| {
            info!(stage = stage.name(), calls = stage.calls().len(), "stage starting");
            stage.calls().iter().try_for_each(|call| call.call())
        });
        self.observer.run_finished();
        result
    }
}
