//! The compiled state-machine executor: per-thread checkpoint chains,
//! interrupt-before/after gates, cooperative cancellation and parallel
//! fan-out over plain multi-edges.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use omnihive_memory::{CheckpointStore, EmbeddingProvider};
use omnihive_runner::{RunOptions, SkillRunner};
use omnihive_schema::{GraphError, StateMessage, WorkflowState};

use crate::builder::{ConditionalEdges, GraphBuilder, GraphNode, NodeCtx, END};

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(WorkflowState),
    /// Suspended at an `interrupt_before` gate; `resume(thread_id)`
    /// continues from `next_node`.
    Suspended {
        state: WorkflowState,
        next_node: String,
    },
    Cancelled(WorkflowState),
}

enum Next {
    End,
    One(String),
    FanOut(Vec<String>),
}

pub struct CompiledGraph {
    nodes: HashMap<String, GraphNode>,
    edges: HashMap<String, Vec<String>>,
    conditional: HashMap<String, ConditionalEdges>,
    entry: String,
    order: Vec<String>,
    runner: Arc<SkillRunner>,
    interrupt_before: HashSet<String>,
    interrupt_after: HashSet<String>,
    checkpoints: Option<CheckpointStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("entry", &self.entry)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl CompiledGraph {
    pub(crate) fn new(
        builder: GraphBuilder,
        runner: Arc<SkillRunner>,
        interrupt_before: HashSet<String>,
        interrupt_after: HashSet<String>,
    ) -> Self {
        Self {
            nodes: builder.nodes,
            edges: builder.edges,
            conditional: builder.conditional,
            entry: builder.entry.unwrap_or_default(),
            order: builder.order,
            runner,
            interrupt_before,
            interrupt_after,
            checkpoints: None,
            embedder: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Persist state snapshots per thread. Without a store the graph still
    /// runs, but cannot suspend/resume across restarts.
    pub fn with_checkpointer(mut self, checkpoints: CheckpointStore) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Embed checkpoints (from `current_plan`, falling back to the
    /// serialized state) so prior runs are semantically searchable.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Cooperative cancellation: the executing node finishes, no further
    /// nodes are scheduled, a final `cancelled` checkpoint is written.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub async fn run(
        &self,
        thread_id: &str,
        mut initial: WorkflowState,
    ) -> Result<RunOutcome, GraphError> {
        initial.set(
            "thread_id",
            serde_json::Value::String(thread_id.to_string()),
        );
        let mut parent = self.latest_checkpoint_id(thread_id).await;
        parent = Some(
            self.checkpoint(thread_id, &initial, parent.as_deref(), "running", &self.entry)
                .await?,
        );
        self.exec_loop(thread_id, initial, self.entry.clone(), None, parent)
            .await
    }

    /// Continue a suspended thread from its latest checkpoint. A thread
    /// that already completed returns immediately with its final state.
    pub async fn resume(&self, thread_id: &str) -> Result<RunOutcome, GraphError> {
        let checkpoints = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| GraphError::NothingToResume(thread_id.to_string()))?;
        let latest = checkpoints
            .get_latest(thread_id)
            .await
            .map_err(|e| GraphError::NodeFailed {
                node: "resume".into(),
                message: e.to_string(),
            })?
            .ok_or_else(|| GraphError::NothingToResume(thread_id.to_string()))?;

        let state =
            WorkflowState::from_json_str(&latest.content).map_err(|e| GraphError::NodeFailed {
                node: "resume".into(),
                message: format!("corrupt checkpoint content: {e}"),
            })?;
        let status = latest
            .metadata
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("running");
        if status == "completed" || status == "cancelled" {
            return Ok(RunOutcome::Completed(state));
        }
        let next = latest
            .metadata
            .get("next_node")
            .and_then(|v| v.as_str())
            .unwrap_or(END)
            .to_string();
        if next == END {
            return Ok(RunOutcome::Completed(state));
        }

        let skip = Some(next.clone());
        self.exec_loop(
            thread_id,
            state,
            next,
            skip,
            Some(latest.checkpoint_id.clone()),
        )
        .await
    }

    async fn exec_loop(
        &self,
        thread_id: &str,
        mut state: WorkflowState,
        mut current: String,
        mut skip_interrupt: Option<String>,
        mut parent: Option<String>,
    ) -> Result<RunOutcome, GraphError> {
        loop {
            if current == END {
                self.checkpoint(thread_id, &state, parent.as_deref(), "completed", END)
                    .await?;
                return Ok(RunOutcome::Completed(state));
            }

            if self.cancel.load(Ordering::SeqCst) {
                self.checkpoint(thread_id, &state, parent.as_deref(), "cancelled", &current)
                    .await?;
                return Ok(RunOutcome::Cancelled(state));
            }

            if self.interrupt_before.contains(&current)
                && skip_interrupt.as_deref() != Some(current.as_str())
            {
                self.checkpoint(thread_id, &state, parent.as_deref(), "suspended", &current)
                    .await?;
                return Ok(RunOutcome::Suspended {
                    state,
                    next_node: current,
                });
            }
            skip_interrupt = None;

            let (partial, checkpoint_requested) = self.run_node(&current, &state).await?;
            state.merge(partial);

            if checkpoint_requested || self.interrupt_after.contains(&current) {
                parent = Some(
                    self.checkpoint(thread_id, &state, parent.as_deref(), "running", &current)
                        .await?,
                );
            }

            match self.next_of(&current, &state)? {
                Next::End => current = END.to_string(),
                Next::One(next) => current = next,
                Next::FanOut(branches) => {
                    current = self.run_fan_out(&branches, &mut state).await?;
                }
            }
        }
    }

    /// Run parallel branches on the same input snapshot; partials merge
    /// in arrival order. Branches must rejoin on one successor (or END).
    async fn run_fan_out(
        &self,
        branches: &[String],
        state: &mut WorkflowState,
    ) -> Result<String, GraphError> {
        let mut join: Option<String> = None;
        for branch in branches {
            let successor = match self.next_of_plain(branch)? {
                Some(next) => next,
                None => END.to_string(),
            };
            match &join {
                None => join = Some(successor),
                Some(existing) if *existing == successor => {}
                Some(existing) => {
                    return Err(GraphError::NodeFailed {
                        node: branch.clone(),
                        message: format!(
                            "fan-out branches diverge: {existing} vs {successor}"
                        ),
                    })
                }
            }
        }

        let snapshot = state.clone();
        let mut tasks: FuturesUnordered<_> = branches
            .iter()
            .map(|branch| {
                let snapshot = snapshot.clone();
                async move {
                    let result = self.run_node(branch, &snapshot).await;
                    (branch.clone(), result)
                }
            })
            .collect();

        while let Some((branch, result)) = tasks.next().await {
            tracing::debug!(branch = %branch, "fan-out branch finished");
            let (partial, _) = result?;
            state.merge(partial);
        }

        Ok(join.unwrap_or_else(|| END.to_string()))
    }

    async fn run_node(
        &self,
        name: &str,
        state: &WorkflowState,
    ) -> Result<(WorkflowState, bool), GraphError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))?;
        tracing::debug!(node = name, "running graph node");

        match node {
            GraphNode::Function(function) => {
                let ctx = NodeCtx::default();
                let partial =
                    function
                        .run(state, &ctx)
                        .await
                        .map_err(|e| GraphError::NodeFailed {
                            node: name.to_string(),
                            message: e.to_string(),
                        })?;
                Ok((partial, ctx.checkpoint_requested()))
            }
            GraphNode::Skill {
                skill,
                command,
                fixed_args,
                state_output,
            } => {
                let result = self
                    .runner
                    .run_skill(skill, command, fixed_args.clone(), RunOptions::default())
                    .await
                    .map_err(|e| GraphError::NodeFailed {
                        node: name.to_string(),
                        message: e.to_string(),
                    })?;

                let mut partial = WorkflowState::new();
                for (result_field, state_key) in state_output {
                    if let Some(value) = result.get(result_field) {
                        partial.set(state_key.clone(), value.clone());
                    }
                }
                partial.push_message(StateMessage {
                    role: "tool".into(),
                    content: result.to_string(),
                    tool_calls: None,
                });
                Ok((partial, false))
            }
        }
    }

    fn next_of(&self, current: &str, state: &WorkflowState) -> Result<Next, GraphError> {
        if let Some(conditional) = self.conditional.get(current) {
            let label = (conditional.selector)(state);
            let target = conditional
                .path_map
                .get(&label)
                .cloned()
                .unwrap_or_else(|| label.clone());
            if target == END {
                return Ok(Next::End);
            }
            if !self.nodes.contains_key(&target) {
                return Err(GraphError::UnknownRoute {
                    from: current.to_string(),
                    label,
                });
            }
            return Ok(Next::One(target));
        }

        match self.edges.get(current) {
            None => Ok(Next::End),
            Some(targets) => {
                let live: Vec<String> = targets.clone();
                match live.len() {
                    0 => Ok(Next::End),
                    1 => {
                        if live[0] == END {
                            Ok(Next::End)
                        } else {
                            Ok(Next::One(live[0].clone()))
                        }
                    }
                    _ => Ok(Next::FanOut(live)),
                }
            }
        }
    }

    /// Single plain successor of a fan-out branch (conditional gates are
    /// not allowed to converge fan-out).
    fn next_of_plain(&self, node: &str) -> Result<Option<String>, GraphError> {
        if self.conditional.contains_key(node) {
            return Err(GraphError::NodeFailed {
                node: node.to_string(),
                message: "fan-out branch cannot end at a conditional gate".into(),
            });
        }
        match self.edges.get(node) {
            None => Ok(None),
            Some(targets) if targets.len() == 1 => {
                if targets[0] == END {
                    Ok(None)
                } else {
                    Ok(Some(targets[0].clone()))
                }
            }
            Some(_) => Err(GraphError::NodeFailed {
                node: node.to_string(),
                message: "nested fan-out is not supported".into(),
            }),
        }
    }

    async fn latest_checkpoint_id(&self, thread_id: &str) -> Option<String> {
        let checkpoints = self.checkpoints.as_ref()?;
        checkpoints
            .get_latest(thread_id)
            .await
            .ok()
            .flatten()
            .map(|record| record.checkpoint_id)
    }

    async fn checkpoint(
        &self,
        thread_id: &str,
        state: &WorkflowState,
        parent: Option<&str>,
        status: &str,
        next_node: &str,
    ) -> Result<String, GraphError> {
        let Some(checkpoints) = &self.checkpoints else {
            // No persistence configured; chain ids are synthetic.
            return Ok(String::new());
        };

        let embedding = match &self.embedder {
            Some(embedder) => {
                let text = state
                    .current_plan()
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        let mut raw = state.to_canonical_json();
                        raw.truncate(512);
                        raw
                    });
                embedder.embed(&text).await.ok()
            }
            None => None,
        };

        let parent = match parent {
            Some(id) if !id.is_empty() => Some(id),
            _ => None,
        };
        checkpoints
            .save(
                thread_id,
                &state.to_canonical_json(),
                parent,
                Some(serde_json::json!({
                    "status": status,
                    "next_node": next_node,
                })),
                embedding,
            )
            .await
            .map_err(|e| match e.downcast::<omnihive_schema::CheckpointError>() {
                Ok(conflict) => GraphError::Checkpoint(conflict),
                Err(other) => GraphError::NodeFailed {
                    node: "checkpoint".into(),
                    message: other.to_string(),
                },
            })
    }

    /// Mermaid dump of the graph for debugging.
    pub fn visualize(&self) -> String {
        let mut lines = vec!["```mermaid".to_string(), "graph TD".to_string()];
        lines.push(format!("    __start__ --> {}", self.entry));
        for name in &self.order {
            if let Some(targets) = self.edges.get(name) {
                for target in targets {
                    lines.push(format!("    {name} --> {target}"));
                }
            }
            if let Some(conditional) = self.conditional.get(name) {
                let mut labels: Vec<&String> = conditional.path_map.keys().collect();
                labels.sort();
                for label in labels {
                    let target = &conditional.path_map[label];
                    lines.push(format!("    {name} -.->|{label}| {target}"));
                }
            }
            if self.interrupt_before.contains(name) {
                lines.push(format!("    {name}:::interrupt"));
            }
        }
        lines.push("```".to_string());
        lines.join("\n")
    }
}
