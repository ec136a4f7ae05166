//! Workflow graph scenarios: the human-in-the-loop commit flow,
//! checkpoint chains, cancellation, and parallel fan-out merges.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use omnihive_graph::{CompiledGraph, FnNode, GraphBuilder, RunOutcome, END};
use omnihive_memory::{CheckpointStore, VectorStore};
use omnihive_registry::{CommandHandler, SkillBundle, SkillManifest, SkillRegistry};
use omnihive_runner::SkillRunner;
use omnihive_schema::{SkillError, StateMessage, ToolRecord, WorkflowState};
use omnihive_swarm::{NodeConfig, SwarmPool};
use serde_json::json;

struct StaticHandler(serde_json::Value);

#[async_trait]
impl CommandHandler for StaticHandler {
    async fn execute(&self, _args: serde_json::Value) -> Result<serde_json::Value, SkillError> {
        Ok(self.0.clone())
    }
}

fn record(skill: &str, command: &str) -> ToolRecord {
    ToolRecord {
        skill_name: skill.into(),
        command_name: command.into(),
        description: format!("{command} command"),
        input_schema: serde_json::Value::Null,
        routing_keywords: vec![],
        intents: vec![],
        category: None,
        file_path: format!("skills/{skill}/scripts/mod.py"),
        weight: 1.0,
        cache_ttl_seconds: 0,
        pure: false,
        isolated: false,
    }
}

fn git_runner() -> Arc<SkillRunner> {
    let registry = Arc::new(SkillRegistry::new());
    registry.apply_bundles(
        &["git".into()],
        vec![SkillBundle {
            manifest: SkillManifest {
                name: "git".into(),
                description: "git skill".into(),
                version: "1.0.0".into(),
                routing_keywords: vec![],
                intents: vec![],
                authors: vec![],
            },
            commands: vec![record("git", "stage_and_scan"), record("git", "commit")],
            dir: "skills/git".into(),
            mtime: 1,
        }],
    );
    registry.register_handler(
        "git.stage_and_scan",
        Arc::new(StaticHandler(json!({
            "staged_files": ["a.py"],
            "diff": "+ line",
            "security_issues": [],
            "lefthook_error": "",
        }))),
    );
    registry.register_handler(
        "git.commit",
        Arc::new(StaticHandler(json!({"status": "success", "sha": "abc123"}))),
    );
    Arc::new(SkillRunner::new(
        registry,
        Arc::new(SwarmPool::new(NodeConfig::default())),
    ))
}

fn checkpoints() -> CheckpointStore {
    CheckpointStore::new(VectorStore::open_in_memory().unwrap())
}

/// The smart-commit graph: prepare -> route_prepare -> format_review,
/// then a conditional hop into execute guarded by interrupt_before.
fn smart_commit_graph(store: CheckpointStore) -> CompiledGraph {
    let mut builder = GraphBuilder::new();

    builder.add_skill_node(
        "prepare",
        "git",
        "stage_and_scan",
        None,
        Some(HashMap::from([
            ("staged_files".to_string(), "staged_files".to_string()),
            ("diff".to_string(), "diff_content".to_string()),
            ("security_issues".to_string(), "security_issues".to_string()),
            ("lefthook_error".to_string(), "lefthook_error".to_string()),
        ])),
    );

    builder.add_function_node(
        "route_prepare",
        Arc::new(FnNode(|state: WorkflowState| async move {
            let staged = state
                .get("staged_files")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            let lefthook_error = state.get_str("lefthook_error").unwrap_or_default();
            let security_issues = state
                .get("security_issues")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);

            let mut partial = WorkflowState::new();
            let status = if staged == 0 {
                "empty"
            } else if !lefthook_error.is_empty() {
                "lefthook_failed"
            } else if security_issues > 0 {
                "security_violation"
            } else {
                "prepared"
            };
            partial.set("status", json!(status));
            Ok(partial)
        })),
    );

    builder.add_function_node(
        "format_review",
        Arc::new(FnNode(|state: WorkflowState| async move {
            let mut partial = WorkflowState::new();
            match state.get_str("status") {
                Some("prepared") => {
                    let staged = state
                        .get("staged_files")
                        .and_then(|v| v.as_array())
                        .map(|a| a.len())
                        .unwrap_or(0);
                    partial.set("review", json!(format!("**{staged} Files to commit**")));
                }
                other => {
                    partial.set(
                        "review",
                        json!(format!("**Status**: {}", other.unwrap_or("unknown"))),
                    );
                }
            }
            Ok(partial)
        })),
    );

    builder.add_skill_node("execute", "git", "commit", None, None);

    builder.add_sequence(&["prepare", "route_prepare", "format_review"]);
    builder.add_conditional_edges(
        "format_review",
        |state| {
            if state.get_str("status") == Some("prepared") {
                "execute".to_string()
            } else {
                END.to_string()
            }
        },
        HashMap::from([
            ("execute".to_string(), "execute".to_string()),
            (END.to_string(), END.to_string()),
        ]),
    );
    builder.add_edge("execute", END);
    builder.set_entry_point("prepare");

    builder
        .compile(git_runner(), vec!["execute".into()], vec![])
        .unwrap()
        .with_checkpointer(store)
}

#[tokio::test]
async fn hitl_commit_suspends_before_execute_then_resumes() {
    let store = checkpoints();
    let graph = smart_commit_graph(store.clone());

    let outcome = graph.run("commit-1", WorkflowState::new()).await.unwrap();
    let state = match outcome {
        RunOutcome::Suspended { state, next_node } => {
            assert_eq!(next_node, "execute");
            state
        }
        other => panic!("expected suspension, got {other:?}"),
    };

    // At suspension the review is formatted and execute has not run.
    assert_eq!(state.get_str("status"), Some("prepared"));
    assert_eq!(state.get_str("review"), Some("**1 Files to commit**"));
    assert!(state
        .messages()
        .iter()
        .all(|m| !m.content.contains("abc123")));

    // Human approved: resume runs execute exactly once.
    let outcome = graph.resume("commit-1").await.unwrap();
    let final_state = match outcome {
        RunOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    };
    let messages = final_state.messages();
    let last = messages.last().unwrap();
    assert!(last.content.contains("success"));

    // Resuming a finished thread returns immediately with current state.
    let again = graph.resume("commit-1").await.unwrap();
    match again {
        RunOutcome::Completed(state) => {
            assert_eq!(state.get_str("review"), Some("**1 Files to commit**"));
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn checkpoint_chain_is_parent_linked_and_monotonic() {
    let store = checkpoints();
    let graph = smart_commit_graph(store.clone());

    graph.run("commit-2", WorkflowState::new()).await.unwrap();
    graph.resume("commit-2").await.unwrap();

    let history = store.history("commit-2", 50).await.unwrap();
    assert!(history.len() >= 3);
    for pair in history.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp);
        assert_eq!(
            pair[0].parent_checkpoint_id.as_deref(),
            Some(pair[1].checkpoint_id.as_str())
        );
        assert_eq!(pair[0].thread_id, pair[1].thread_id);
    }
}

#[tokio::test]
async fn interrupt_before_entry_suspends_without_running_anything() {
    let store = checkpoints();
    let mut builder = GraphBuilder::new();
    builder.add_skill_node("prepare", "git", "stage_and_scan", None, None);
    builder.add_edge("prepare", END);
    builder.set_entry_point("prepare");
    let graph = builder
        .compile(git_runner(), vec!["prepare".into()], vec![])
        .unwrap()
        .with_checkpointer(store.clone());

    let outcome = graph.run("gate-1", WorkflowState::new()).await.unwrap();
    match outcome {
        RunOutcome::Suspended { state, next_node } => {
            assert_eq!(next_node, "prepare");
            assert!(state.messages().is_empty());
        }
        other => panic!("expected suspension, got {other:?}"),
    }
    // Exactly two checkpoints: graph start and the suspension gate.
    assert_eq!(store.count("gate-1").await.unwrap(), 2);
}

#[tokio::test]
async fn cancellation_writes_cancelled_checkpoint() {
    let store = checkpoints();
    let graph = smart_commit_graph(store.clone());
    graph
        .cancel_flag()
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let outcome = graph.run("commit-3", WorkflowState::new()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled(_)));

    let latest = store.get_latest("commit-3").await.unwrap().unwrap();
    assert_eq!(latest.metadata["status"], "cancelled");
}

#[tokio::test]
async fn fan_out_merges_branch_outputs_in_arrival_order() {
    let mut builder = GraphBuilder::new();
    builder.add_function_node(
        "start",
        Arc::new(FnNode(|_state: WorkflowState| async { Ok(WorkflowState::new()) })),
    );
    builder.add_function_node(
        "left",
        Arc::new(FnNode(|_state: WorkflowState| async {
            let mut partial = WorkflowState::new();
            partial.set("left_done", json!(true));
            partial.push_message(StateMessage::assistant("left"));
            Ok(partial)
        })),
    );
    builder.add_function_node(
        "right",
        Arc::new(FnNode(|_state: WorkflowState| async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let mut partial = WorkflowState::new();
            partial.set("right_done", json!(true));
            partial.push_message(StateMessage::assistant("right"));
            Ok(partial)
        })),
    );
    builder.add_function_node(
        "join",
        Arc::new(FnNode(|state: WorkflowState| async move {
            assert_eq!(state.get("left_done"), Some(&json!(true)));
            assert_eq!(state.get("right_done"), Some(&json!(true)));
            let mut partial = WorkflowState::new();
            partial.set("joined", json!(true));
            Ok(partial)
        })),
    );

    builder.add_edge("start", "left");
    builder.add_edge("start", "right");
    builder.add_edge("left", "join");
    builder.add_edge("right", "join");
    builder.add_edge("join", END);
    builder.set_entry_point("start");

    let graph = builder.compile(git_runner(), vec![], vec![]).unwrap();
    let outcome = graph.run("fan-1", WorkflowState::new()).await.unwrap();
    let state = match outcome {
        RunOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(state.get("joined"), Some(&json!(true)));

    // Both branch messages arrived; the fast branch merged first.
    let contents: Vec<String> = state.messages().iter().map(|m| m.content.clone()).collect();
    assert!(contents.contains(&"left".to_string()));
    assert!(contents.contains(&"right".to_string()));
    assert_eq!(contents[0], "left");
}

#[tokio::test]
async fn diverging_fan_out_is_an_error() {
    let mut builder = GraphBuilder::new();
    for name in ["start", "left", "right", "join_a", "join_b"] {
        builder.add_function_node(
            name,
            Arc::new(FnNode(|_state: WorkflowState| async { Ok(WorkflowState::new()) })),
        );
    }
    builder.add_edge("start", "left");
    builder.add_edge("start", "right");
    builder.add_edge("left", "join_a");
    builder.add_edge("right", "join_b");
    builder.add_edge("join_a", END);
    builder.add_edge("join_b", END);
    builder.set_entry_point("start");

    let graph = builder.compile(git_runner(), vec![], vec![]).unwrap();
    assert!(graph.run("fan-2", WorkflowState::new()).await.is_err());
}

#[tokio::test]
async fn visualize_emits_mermaid() {
    let graph = smart_commit_graph(checkpoints());
    let diagram = graph.visualize();
    assert!(diagram.contains("```mermaid"));
    assert!(diagram.contains("graph TD"));
    assert!(diagram.contains("prepare"));
    assert!(diagram.contains("execute"));
    assert!(diagram.contains("-.->|execute| execute"));
}

#[tokio::test]
async fn run_without_checkpointer_still_completes() {
    let mut builder = GraphBuilder::new();
    builder.add_function_node(
        "only",
        Arc::new(FnNode(|_state: WorkflowState| async {
            let mut partial = WorkflowState::new();
            partial.set("done", json!(true));
            Ok(partial)
        })),
    );
    builder.add_edge("only", END);
    builder.set_entry_point("only");
    let graph = builder.compile(git_runner(), vec![], vec![]).unwrap();

    let outcome = graph.run("mem-1", WorkflowState::new()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
}
