//! Fluent builder for checkpointed state-machine workflows.
//!
//! Nodes are skill invocations or async functions; plain edges chain
//! nodes (several outgoing plain edges fan out in parallel), conditional
//! edges route on a state selector. `END` terminates a path. A node may
//! have either plain edges or conditional edges, not both.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use omnihive_runner::SkillRunner;
use omnihive_schema::{GraphError, WorkflowState};

use crate::executor::CompiledGraph;

/// Sentinel for graph exit: use as a target in `add_edge` or a
/// conditional path map.
pub const END: &str = "__end__";

/// Per-invocation context handed to function nodes; lets a node request
/// an extra checkpoint after it completes.
#[derive(Default)]
pub struct NodeCtx {
    checkpoint_requested: AtomicBool,
}

impl NodeCtx {
    pub fn checkpoint(&self) {
        self.checkpoint_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn checkpoint_requested(&self) -> bool {
        self.checkpoint_requested.load(Ordering::SeqCst)
    }
}

/// A pure logic node: reads the state, returns a partial state to merge.
#[async_trait]
pub trait FunctionNode: Send + Sync {
    async fn run(&self, state: &WorkflowState, ctx: &NodeCtx) -> Result<WorkflowState>;
}

/// Blanket impl so plain async closures can be nodes.
pub struct FnNode<F>(pub F);

#[async_trait]
impl<F, Fut> FunctionNode for FnNode<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<WorkflowState>> + Send,
{
    async fn run(&self, state: &WorkflowState, _ctx: &NodeCtx) -> Result<WorkflowState> {
        (self.0)(state.clone()).await
    }
}

#[derive(Clone)]
pub(crate) enum GraphNode {
    Skill {
        skill: String,
        command: String,
        fixed_args: serde_json::Value,
        /// result field -> state key
        state_output: HashMap<String, String>,
    },
    Function(Arc<dyn FunctionNode>),
}

pub(crate) type Selector = Arc<dyn Fn(&WorkflowState) -> String + Send + Sync>;

#[derive(Clone)]
pub(crate) struct ConditionalEdges {
    pub selector: Selector,
    pub path_map: HashMap<String, String>,
}

pub struct GraphBuilder {
    pub(crate) nodes: HashMap<String, GraphNode>,
    pub(crate) edges: HashMap<String, Vec<String>>,
    pub(crate) conditional: HashMap<String, ConditionalEdges>,
    pub(crate) entry: Option<String>,
    pub(crate) order: Vec<String>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            conditional: HashMap::new(),
            entry: None,
            order: Vec::new(),
        }
    }

    /// A node that invokes `skill.command` through the runner, appends the
    /// result as a message, and optionally remaps result fields into
    /// workflow-state keys.
    pub fn add_skill_node(
        &mut self,
        name: impl Into<String>,
        skill: impl Into<String>,
        command: impl Into<String>,
        fixed_args: Option<serde_json::Value>,
        state_output: Option<HashMap<String, String>>,
    ) -> &mut Self {
        let name = name.into();
        self.track(&name);
        self.nodes.insert(
            name,
            GraphNode::Skill {
                skill: skill.into(),
                command: command.into(),
                fixed_args: fixed_args.unwrap_or_else(|| serde_json::json!({})),
                state_output: state_output.unwrap_or_default(),
            },
        );
        self
    }

    pub fn add_function_node(
        &mut self,
        name: impl Into<String>,
        node: Arc<dyn FunctionNode>,
    ) -> &mut Self {
        let name = name.into();
        self.track(&name);
        self.nodes.insert(name, GraphNode::Function(node));
        self
    }

    fn track(&mut self, name: &str) {
        if !self.order.iter().any(|n| n == name) {
            self.order.push(name.to_string());
        }
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.entry(from.into()).or_default().push(to.into());
        self
    }

    /// Chain nodes: `add_sequence(["a", "b", "c"])` adds a→b and b→c.
    pub fn add_sequence(&mut self, names: &[&str]) -> &mut Self {
        for pair in names.windows(2) {
            self.add_edge(pair[0], pair[1]);
        }
        self
    }

    /// Route from `from` based on `selector(state)`: the returned label is
    /// looked up in `path_map` (falling back to the label itself).
    pub fn add_conditional_edges(
        &mut self,
        from: impl Into<String>,
        selector: impl Fn(&WorkflowState) -> String + Send + Sync + 'static,
        path_map: HashMap<String, String>,
    ) -> &mut Self {
        self.conditional.insert(
            from.into(),
            ConditionalEdges {
                selector: Arc::new(selector),
                path_map,
            },
        );
        self
    }

    pub fn set_entry_point(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry = Some(name.into());
        self
    }

    /// Validate the graph and produce an executable. `interrupt_before`
    /// nodes suspend with a checkpoint before running (the HITL gate);
    /// `interrupt_after` nodes checkpoint right after completing.
    pub fn compile(
        self,
        runner: Arc<SkillRunner>,
        interrupt_before: Vec<String>,
        interrupt_after: Vec<String>,
    ) -> Result<CompiledGraph, GraphError> {
        let entry = self.entry.clone().ok_or(GraphError::MissingEntryPoint)?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::NodeNotFound(entry));
        }
        for (from, targets) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::NodeNotFound(from.clone()));
            }
            if self.conditional.contains_key(from) {
                return Err(GraphError::ConflictingEdges(from.clone()));
            }
            for to in targets {
                if to != END && !self.nodes.contains_key(to) {
                    return Err(GraphError::NodeNotFound(to.clone()));
                }
            }
        }
        for (from, edges) in &self.conditional {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::NodeNotFound(from.clone()));
            }
            for target in edges.path_map.values() {
                if target != END && !self.nodes.contains_key(target) {
                    return Err(GraphError::NodeNotFound(target.clone()));
                }
            }
        }
        for name in interrupt_before.iter().chain(interrupt_after.iter()) {
            if !self.nodes.contains_key(name) {
                return Err(GraphError::NodeNotFound(name.clone()));
            }
        }

        Ok(CompiledGraph::new(
            self,
            runner,
            interrupt_before.into_iter().collect::<HashSet<_>>(),
            interrupt_after.into_iter().collect::<HashSet<_>>(),
        ))
    }
}
