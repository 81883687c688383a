//! Execution backends for a [`Pipeline`].
//!
//! Every executor splits work into [`PipelineExecutor::compile`], which turns a pipeline into a
//! backend-native plan without calling any stage function, and [`PipelineExecutor::execute`],
//! which runs the plan. All backends honor the same barrier contract: every invocation of stage
//! `i` finishes successfully before any invocation of stage `i + 1` starts. The first failure is
//! reported as [`ForgeError::StageExecution`] and no later stage is started. Side effects of
//! invocations that already ran are left in place.
//!
//! | Executor | Scheduling |
//! |---|---|
//! | [`SequentialExecutor`] | direct calls in declaration and collection order |
//! | [`ParallelExecutor`] | a bounded rayon pool, one join per stage |
//! | [`GraphExecutor`] | a [`TaskGraph`] of call and barrier nodes run by a [`GraphRuntime`] |
//! | [`FlowExecutor`] | a gated [`Flow`] submitted to a [`FlowEngine`] |

pub mod flow;
pub mod graph;
pub mod parallel;
pub mod sequential;

pub use flow::{
    Flow, FlowEngine, FlowExecutor, FlowRun, FlowState, LocalFlowEngine, TaskId, TaskRecord,
    TaskState,
};
pub use graph::{GraphExecutor, GraphNode, GraphRuntime, LocalGraphRuntime, NodeKind, TaskGraph};
pub use parallel::ParallelExecutor;
pub use sequential::SequentialExecutor;

use crate::config::Config;
use crate::error::{ForgeError, Result};
#[cfg(feature = "metrics")]
use crate::metrics::MetricsCollector;
use crate::pipeline::{Pipeline, StageFn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A backend that can run a [`Pipeline`].
pub trait PipelineExecutor {
    /// Backend-native form of a pipeline.
    type Plan;

    /// Translate `pipeline` into a plan. Never calls stage functions.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline cannot be expressed on this backend.
    fn compile(&self, pipeline: &Pipeline) -> Result<Self::Plan>;

    /// Run a compiled plan to completion or first failure.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::StageExecution`] for the first failed invocation.
    fn execute(&self, plan: &Self::Plan) -> Result<()>;

    /// Compile then execute.
    ///
    /// # Errors
    ///
    /// Returns any error from [`PipelineExecutor::compile`] or [`PipelineExecutor::execute`].
    fn run(&self, pipeline: &Pipeline) -> Result<()> {
        let plan = self.compile(pipeline)?;
        self.execute(&plan)
    }
}

/// Optional instrumentation shared by an executor and the calls it compiles.
#[derive(Clone, Default)]
pub(crate) struct Observer {
    #[cfg(feature = "metrics")]
    metrics: Option<MetricsCollector>,
}

impl Observer {
    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(metrics: MetricsCollector) -> Self {
        Self { metrics: Some(metrics) }
    }

    pub(crate) fn run_started(&self) {
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.record_start();
        }
    }

    pub(crate) fn run_finished(&self) {
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.record_end();
        }
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn invocation(&self, stage: &str, started: Instant, ok: bool) {
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.record_invocation(stage, started.elapsed(), ok);
        }
    }
}

/// One stage function bound to its item and the pipeline's shared config.
#[derive(Clone)]
pub struct BoundCall {
    stage: Arc<str>,
    item: Option<Value>,
    function: StageFn,
    config: Arc<Config>,
    observer: Observer,
}

impl BoundCall {
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    #[must_use]
    pub fn item(&self) -> Option<&Value> {
        self.item.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Invoke the stage function.
    ///
    /// # Errors
    ///
    /// Wraps a failure of the function as [`ForgeError::StageExecution`].
    pub fn call(&self) -> Result<()> {
        let started = Instant::now();
        match self.item.as_ref() {
            Some(item) => debug!(stage = %self.stage, %item, "invoking"),
            None => debug!(stage = %self.stage, "invoking"),
        }
        let outcome = (self.function)(self.item.as_ref(), &self.config);
        self.observer.invocation(&self.stage, started, outcome.is_ok());
        outcome.map_err(|err| {
            warn!(stage = %self.stage, error = %format!("{err:#}"), "invocation failed");
            ForgeError::stage_failed(&self.stage, self.item.as_ref(), err)
        })
    }

    /// Serializable description: the stage name stands in for the function.
    #[must_use]
    pub fn describe(&self) -> CallSpec {
        CallSpec {
            stage: self.stage.to_string(),
            item: self.item.clone(),
            config: Config::clone(&self.config),
        }
    }
}

impl Debug for BoundCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundCall")
            .field("stage", &self.stage)
            .field("item", &self.item)
            .finish_non_exhaustive()
    }
}

/// What a [`BoundCall`] will do, in a form that can cross process boundaries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    pub config: Config,
}

/// All invocations of one stage.
#[derive(Clone, Debug)]
pub struct CompiledStage {
    name: Arc<str>,
    calls: Vec<BoundCall>,
}

impl CompiledStage {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn calls(&self) -> &[BoundCall] {
        &self.calls
    }
}

/// A pipeline with every invocation bound, stages in declaration order.
#[derive(Clone, Debug)]
pub struct StagePlan {
    stages: Vec<CompiledStage>,
    config: Arc<Config>,
}

impl StagePlan {
    #[must_use]
    pub fn stages(&self) -> &[CompiledStage] {
        &self.stages
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Total number of invocations across all stages.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.stages.iter().map(|s| s.calls.len()).sum()
    }

    /// Describe every invocation in execution order.
    #[must_use]
    pub fn describe(&self) -> Vec<CallSpec> {
        self.stages
            .iter()
            .flat_map(|s| s.calls.iter().map(BoundCall::describe))
            .collect()
    }
}

/// Bind every stage of `pipeline` to the shared config.
pub(crate) fn bind(pipeline: &Pipeline, observer: &Observer) -> StagePlan {
    let config = pipeline.shared_config();
    let stages = pipeline
        .stages()
        .iter()
        .map(|stage| {
            let name: Arc<str> = Arc::from(stage.name());
            let bound = |item: Option<Value>| BoundCall {
                stage: Arc::clone(&name),
                item,
                function: Arc::clone(stage.function()),
                config: Arc::clone(&config),
                observer: observer.clone(),
            };
            let calls = match stage.mappable() {
                Some(items) => items.iter().cloned().map(|v| bound(Some(v))).collect(),
                None => vec![bound(None)],
            };
            CompiledStage { name: Arc::clone(&name), calls }
        })
        .collect();
    StagePlan { stages, config }
}

/// Resolve a requested worker count, defaulting to the number of CPUs.
pub(crate) fn worker_count(requested: Option<usize>) -> usize {
    requested.unwrap_or_else(num_cpus::get).max(1)
}

/// Build a local worker pool whose threads install the config's log settings on start.
pub(crate) fn worker_pool(threads: usize, config: Arc<Config>) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("chunkforge-worker-{i}"))
        .start_handler(move |_| {
            crate::logging::init_worker(&config);
        })
        .build()
        .map_err(|e| ForgeError::Io(anyhow::Error::new(e).context("build worker pool")))
}
