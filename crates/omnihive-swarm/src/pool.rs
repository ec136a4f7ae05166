//! The pool: named nodes behind a read-write lock, aggregate health and
//! manual restart. Callers may run different nodes in parallel; each
//! node serializes its own calls.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use omnihive_schema::{SwarmError, SwarmHealthReport};

use crate::node::{NodeConfig, SwarmNode};
use crate::protocol::WorkerTool;

#[derive(Default)]
pub struct SwarmPool {
    nodes: RwLock<HashMap<String, Arc<SwarmNode>>>,
    config: NodeConfig,
}

impl SwarmPool {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn register(&self, name: impl Into<String>, script: impl Into<PathBuf>) {
        self.register_with_env(name, script, HashMap::new());
    }

    /// Register a node with scoped environment overrides for its worker.
    pub fn register_with_env(
        &self,
        name: impl Into<String>,
        script: impl Into<PathBuf>,
        env: HashMap<String, String>,
    ) {
        let name = name.into();
        let node = Arc::new(SwarmNode::new(
            name.clone(),
            script,
            env,
            self.config.clone(),
        ));
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(name, node);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<SwarmNode>> {
        self.nodes.read().ok()?.get(name).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes
            .read()
            .map(|nodes| {
                let mut names: Vec<String> = nodes.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    pub async fn call_tool(
        &self,
        node: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, SwarmError> {
        let node = self
            .get(node)
            .ok_or_else(|| SwarmError::UnknownNode(node.to_string()))?;
        node.call_tool(name, arguments).await
    }

    pub async fn list_tools(&self, node: &str) -> Vec<WorkerTool> {
        match self.get(node) {
            Some(node) => node.list_tools().await,
            None => Vec::new(),
        }
    }

    /// Aggregate health report across every registered node.
    pub async fn system_health(&self) -> SwarmHealthReport {
        let nodes: Vec<Arc<SwarmNode>> = self
            .nodes
            .read()
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default();

        let mut report = SwarmHealthReport::new();
        for node in nodes {
            let health = node.health_check().await;
            report.insert(node.name().to_string(), health);
        }
        report
    }

    pub async fn restart_node(&self, name: &str) -> bool {
        match self.get(name) {
            Some(node) => node.restart().await,
            None => false,
        }
    }
}
