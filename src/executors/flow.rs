//! Workflow-engine backend.
//!
//! A [`Flow`] is a list of gated groups of tasks: every task of group `i + 1` waits for all of
//! group `i`. A [`FlowEngine`] runs it and reports a [`FlowRun`] with a terminal [`FlowState`]
//! and the [`TaskState`] of every task. Engines report task failures inside the run rather
//! than as errors; [`FlowExecutor`] turns a failed run into an error.

use super::{BoundCall, Observer, PipelineExecutor, bind, worker_pool};
use crate::config::Config;
use crate::error::{ForgeError, Result};
#[cfg(feature = "metrics")]
use crate::metrics::MetricsCollector;
use crate::pipeline::Pipeline;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Completed,
    Failed,
    /// Not run because an earlier gate failed.
    UpstreamFailed,
}

/// Identity of one task: its stage plus, for mapped stages, the item's position.
///
/// Stage names are unique within a pipeline, so ids never collide. The display form
/// (`stage` or `stage[i]`) is only a label.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl TaskId {
    #[must_use]
    pub fn singleton(stage: impl Into<String>) -> Self {
        Self { stage: stage.into(), index: None }
    }

    #[must_use]
    pub fn mapped(stage: impl Into<String>, index: usize) -> Self {
        Self { stage: stage.into(), index: Some(index) }
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{i}]", self.stage),
            None => f.write_str(&self.stage),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FlowTask {
    id: TaskId,
    call: BoundCall,
}

impl FlowTask {
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    #[must_use]
    pub fn call(&self) -> &BoundCall {
        &self.call
    }
}

/// The tasks of one stage; the whole group must succeed before the next one starts.
#[derive(Clone, Debug)]
pub struct FlowGroup {
    stage: String,
    tasks: Vec<FlowTask>,
}

impl FlowGroup {
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    #[must_use]
    pub fn tasks(&self) -> &[FlowTask] {
        &self.tasks
    }
}

#[derive(Clone, Debug)]
pub struct Flow {
    name: String,
    groups: Vec<FlowGroup>,
    config: Arc<Config>,
}

impl Flow {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn groups(&self) -> &[FlowGroup] {
        &self.groups
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.groups.iter().map(|g| g.tasks.len()).sum()
    }

    /// Task ids in gate order.
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.groups.iter().flat_map(|g| g.tasks.iter().map(FlowTask::id))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task: TaskId,
    pub state: TaskState,
}

/// Outcome of one flow submission.
#[derive(Debug)]
pub struct FlowRun {
    state: FlowState,
    tasks: Vec<TaskRecord>,
    failure: Option<ForgeError>,
}

impl FlowRun {
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == FlowState::Failed
    }

    #[must_use]
    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    #[must_use]
    pub fn task_state(&self, task: &TaskId) -> Option<TaskState> {
        self.tasks.iter().find(|t| t.task == *task).map(|t| t.state)
    }

    /// Count of tasks in `state`.
    #[must_use]
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    /// `Ok` only for a completed run.
    ///
    /// # Errors
    ///
    /// Returns the first task failure, or [`ForgeError::FlowFailed`] if the engine recorded none.
    pub fn into_result(mut self) -> Result<()> {
        match (self.state, self.failure.take()) {
            (FlowState::Completed, _) => Ok(()),
            (FlowState::Failed, Some(e)) => Err(e),
            (FlowState::Failed, None) => Err(ForgeError::FlowFailed {
                message: format!(
                    "{} task(s) failed, {} never ran",
                    self.count(TaskState::Failed),
                    self.count(TaskState::UpstreamFailed)
                ),
            }),
        }
    }
}

/// Something that can run a [`Flow`].
pub trait FlowEngine: Send + Sync {
    /// # Errors
    ///
    /// Returns an error only if the engine itself cannot run; task failures are part of the
    /// returned [`FlowRun`].
    fn submit(&self, flow: &Flow) -> Result<FlowRun>;
}

/// Runs a flow in-process. Without workers every task runs on the calling thread; with
/// workers each gate's tasks share a local rayon pool.
#[derive(Clone, Debug, Default)]
pub struct LocalFlowEngine {
    workers: Option<usize>,
}

impl LocalFlowEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }
}

impl FlowEngine for LocalFlowEngine {
    fn submit(&self, flow: &Flow) -> Result<FlowRun> {
        let pool = self
            .workers
            .map(|n| worker_pool(n, Arc::clone(&flow.config)))
            .transpose()?;

        let mut tasks = Vec::with_capacity(flow.task_count());
        let mut failure: Option<ForgeError> = None;
        for group in &flow.groups {
            let record = |task: &FlowTask, state| TaskRecord { task: task.id.clone(), state };
            if failure.is_some() {
                tasks.extend(group.tasks.iter().map(|t| record(t, TaskState::UpstreamFailed)));
                continue;
            }
            let outcomes: Vec<Result<()>> = match &pool {
                Some(pool) => pool.install(|| group.tasks.par_iter().map(|t| t.call.call()).collect()),
                None => group.tasks.iter().map(|t| t.call.call()).collect(),
            };
            for (task, outcome) in group.tasks.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => tasks.push(record(task, TaskState::Completed)),
                    Err(e) => {
                        tasks.push(record(task, TaskState::Failed));
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }
            if failure.is_some() {
                warn!(flow = %flow.name, stage = %group.stage, "gate failed");
            }
        }

        let state = if failure.is_some() { FlowState::Failed } else { FlowState::Completed };
        info!(flow = %flow.name, ?state, tasks = tasks.len(), "flow run finished");
        Ok(FlowRun { state, tasks, failure })
    }
}

/// Compiles a pipeline into a gated [`Flow`] and submits it to a [`FlowEngine`].
#[derive(Clone)]
pub struct FlowExecutor<E = LocalFlowEngine> {
    engine: E,
    name: String,
    observer: Observer,
}

impl Default for FlowExecutor {
    fn default() -> Self {
        Self::with_engine(LocalFlowEngine::default())
    }
}

impl FlowExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: FlowEngine> FlowExecutor<E> {
    pub fn with_engine(engine: E) -> Self {
        Self { engine, name: "chunkforge".to_string(), observer: Observer::default() }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.observer = Observer::with_metrics(metrics);
        self
    }

    /// Submit `flow` and return the raw run, failed or not.
    ///
    /// # Errors
    ///
    /// Returns an error only if the engine cannot run.
    pub fn submit(&self, flow: &Flow) -> Result<FlowRun> {
        self.engine.submit(flow)
    }
}

impl<E: FlowEngine> PipelineExecutor for FlowExecutor<E> {
    type Plan = Flow;

    fn compile(&self, pipeline: &Pipeline) -> Result<Flow> {
        let plan = bind(pipeline, &self.observer);
        let groups = plan
            .stages()
            .iter()
            .map(|stage| {
                let mapped = pipeline.is_mappable(stage.name()).unwrap_or(false);
                let tasks = stage
                    .calls()
                    .iter()
                    .enumerate()
                    .map(|(i, call)| FlowTask {
                        id: if mapped {
                            TaskId::mapped(stage.name(), i)
                        } else {
                            TaskId::singleton(stage.name())
                        },
                        call: call.clone(),
                    })
                    .collect();
                FlowGroup { stage: stage.name().to_string(), tasks }
            })
            .collect();
        Ok(Flow { name: self.name.clone(), groups, config: plan.shared_config() })
    }

    fn execute(&self, plan: &Flow) -> Result<()> {
        self.observer.run_started();
        let run = self.submit(plan);
        self.observer.run_finished();
        run?.into_result()
    }
}
