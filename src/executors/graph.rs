//! Task-graph backend.
//!
//! A [`TaskGraph`] holds one call node per invocation and one barrier node per stage. Calls of
//! stage `i` depend on barrier `i - 1`, and barrier `i` depends on every call of stage `i`, so
//! the graph has `O(calls + stages)` edges instead of a full bipartite join between
//! neighbouring stages. A stage with no calls still gets a barrier, chained to the previous one.

use super::{BoundCall, CallSpec, Observer, PipelineExecutor, bind, worker_count, worker_pool};
use crate::config::Config;
use crate::error::{ForgeError, Result};
#[cfg(feature = "metrics")]
use crate::metrics::MetricsCollector;
use crate::pipeline::Pipeline;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Call {
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        item: Option<Value>,
    },
    Barrier {
        stage: String,
    },
}

#[derive(Clone, Debug)]
pub struct GraphNode {
    id: usize,
    kind: NodeKind,
    deps: Vec<usize>,
    call: Option<BoundCall>,
}

impl GraphNode {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Ids of the nodes that must complete before this one runs.
    #[must_use]
    pub fn dependencies(&self) -> &[usize] {
        &self.deps
    }

    #[must_use]
    pub fn is_barrier(&self) -> bool {
        matches!(self.kind, NodeKind::Barrier { .. })
    }

    /// Run the node. Barriers do nothing.
    ///
    /// # Errors
    ///
    /// Returns the call's [`ForgeError::StageExecution`].
    pub fn run(&self) -> Result<()> {
        self.call.as_ref().map_or(Ok(()), BoundCall::call)
    }
}

/// A dependency graph of invocations, nodes in topological order.
#[derive(Clone, Debug)]
pub struct TaskGraph {
    nodes: Vec<GraphNode>,
    config: Arc<Config>,
}

#[derive(Serialize)]
struct NodeSpec<'a> {
    id: usize,
    #[serde(flatten)]
    kind: &'a NodeKind,
    deps: &'a [usize],
}

impl TaskGraph {
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, id: usize) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Dependencies of node `id`; empty for unknown ids.
    #[must_use]
    pub fn dependencies(&self, id: usize) -> &[usize] {
        self.nodes.get(id).map(|n| n.deps.as_slice()).unwrap_or_default()
    }

    /// Nodes that depend on each node, indexed by id.
    #[must_use]
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.nodes.len()];
        for n in &self.nodes {
            for &d in &n.deps {
                out[d].push(n.id);
            }
        }
        out
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.deps.len()).sum()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Every call node, described, in topological order.
    #[must_use]
    pub fn calls(&self) -> Vec<CallSpec> {
        self.nodes
            .iter()
            .filter_map(|n| n.call.as_ref().map(BoundCall::describe))
            .collect()
    }

    /// The graph shape and shared config as JSON.
    #[must_use]
    pub fn to_spec(&self) -> Value {
        let nodes: Vec<NodeSpec<'_>> = self
            .nodes
            .iter()
            .map(|n| NodeSpec { id: n.id, kind: &n.kind, deps: &n.deps })
            .collect();
        serde_json::json!({
            "config": self.config.to_value(),
            "nodes": nodes,
        })
    }
}

/// Something that can run a [`TaskGraph`] respecting its dependencies.
pub trait GraphRuntime: Send + Sync {
    /// # Errors
    ///
    /// Returns the first node failure. Dependents of a failed node never run.
    fn run(&self, graph: &TaskGraph) -> Result<()>;
}

/// Runs ready nodes on a local rayon pool, releasing dependents through atomic counters.
#[derive(Clone, Debug, Default)]
pub struct LocalGraphRuntime {
    threads: Option<usize>,
}

impl LocalGraphRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }
}

struct RunState<'g> {
    graph: &'g TaskGraph,
    dependents: Vec<Vec<usize>>,
    waiting: Vec<AtomicUsize>,
    failed: AtomicBool,
    first_failure: Mutex<Option<ForgeError>>,
}

impl RunState<'_> {
    fn fail(&self, err: ForgeError) {
        self.failed.store(true, Ordering::SeqCst);
        let mut slot = self.first_failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

fn spawn_node<'s, 'g: 's>(scope: &rayon::Scope<'s>, id: usize, state: &'s RunState<'g>) {
    scope.spawn(move |s| {
        if state.failed.load(Ordering::SeqCst) {
            return;
        }
        let node = &state.graph.nodes[id];
        if let NodeKind::Barrier { stage } = &node.kind {
            debug!(stage = %stage, "barrier reached");
        }
        if let Err(e) = node.run() {
            state.fail(e);
            return;
        }
        for &next in &state.dependents[id] {
            if state.waiting[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                spawn_node(s, next, state);
            }
        }
    });
}

impl GraphRuntime for LocalGraphRuntime {
    fn run(&self, graph: &TaskGraph) -> Result<()> {
        let pool = worker_pool(worker_count(self.threads), graph.shared_config())?;
        let state = RunState {
            graph,
            dependents: graph.dependents(),
            waiting: graph.nodes.iter().map(|n| AtomicUsize::new(n.deps.len())).collect(),
            failed: AtomicBool::new(false),
            first_failure: Mutex::new(None),
        };
        pool.scope(|s| {
            for n in graph.nodes.iter().filter(|n| n.deps.is_empty()) {
                spawn_node(s, n.id, &state);
            }
        });
        match state.first_failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Compiles a pipeline into a [`TaskGraph`] and hands it to a [`GraphRuntime`].
#[derive(Clone, Default)]
pub struct GraphExecutor<R = LocalGraphRuntime> {
    runtime: R,
    observer: Observer,
}

impl GraphExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: GraphRuntime> GraphExecutor<R> {
    pub fn with_runtime(runtime: R) -> Self {
        Self { runtime, observer: Observer::default() }
    }

    #[must_use]
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.observer = Observer::with_metrics(metrics);
        self
    }
}

impl<R: GraphRuntime> PipelineExecutor for GraphExecutor<R> {
    type Plan = TaskGraph;

    fn compile(&self, pipeline: &Pipeline) -> Result<TaskGraph> {
        let plan = bind(pipeline, &self.observer);
        let mut nodes: Vec<GraphNode> = Vec::with_capacity(plan.call_count() + plan.stages().len());
        let mut previous_barrier: Option<usize> = None;
        for stage in plan.stages() {
            let gate: Vec<usize> = previous_barrier.into_iter().collect();
            let mut members = Vec::with_capacity(stage.calls().len());
            for call in stage.calls() {
                let id = nodes.len();
                nodes.push(GraphNode {
                    id,
                    kind: NodeKind::Call {
                        stage: stage.name().to_string(),
                        item: call.item().cloned(),
                    },
                    deps: gate.clone(),
                    call: Some(call.clone()),
                });
                members.push(id);
            }
            let id = nodes.len();
            nodes.push(GraphNode {
                id,
                kind: NodeKind::Barrier { stage: stage.name().to_string() },
                deps: if members.is_empty() { gate } else { members },
                call: None,
            });
            previous_barrier = Some(id);
        }
        info!(nodes = nodes.len(), stages = plan.stages().len(), "task graph compiled");
        Ok(TaskGraph { nodes, config: plan.shared_config() })
    }

    fn execute(&self, plan: &TaskGraph) -> Result<()> {
        self.observer.run_started();
        let result = self.runtime.run(plan);
        self.observer.run_finished();
        result
    }
}
