//! A self-healing worker node: auto-reconnect, bounded retries, circuit
//! breaker and call metrics over a line-delimited JSON-RPC child process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use omnihive_schema::{NodeHealth, NodeMetricsSnapshot, SwarmError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::protocol::{RpcRequest, RpcResponse, WorkerTool};

const RECONNECT_PAUSE: Duration = Duration::from_millis(500);
const LATENCY_EWMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub connect_timeout: Duration,
    pub execute_timeout: Duration,
    pub max_retries: usize,
    pub circuit_cooldown: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            execute_timeout: Duration::from_secs(120),
            max_retries: 2,
            circuit_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct NodeMetrics {
    total_calls: u64,
    success_count: u64,
    failure_count: u64,
    restarts: u64,
    avg_latency_ms: f64,
    last_error: Option<String>,
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

/// One worker process and the breaker protecting it. All calls go
/// through a per-node async mutex, so at most one RPC is in flight.
pub struct SwarmNode {
    name: String,
    script: PathBuf,
    env: HashMap<String, String>,
    config: NodeConfig,
    session: Mutex<Option<Session>>,
    metrics: StdMutex<NodeMetrics>,
    circuit_open_until: StdMutex<Option<Instant>>,
}

impl SwarmNode {
    pub fn new(
        name: impl Into<String>,
        script: impl Into<PathBuf>,
        env: HashMap<String, String>,
        config: NodeConfig,
    ) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            env,
            config,
            session: Mutex::new(None),
            metrics: StdMutex::new(NodeMetrics::default()),
            circuit_open_until: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// While the circuit is open the node reports disconnected even if
    /// the child process is technically alive.
    pub fn circuit_open_remaining(&self) -> Option<Duration> {
        let guard = self.circuit_open_until.lock().ok()?;
        let until = (*guard)?;
        let now = Instant::now();
        if now < until {
            Some(until - now)
        } else {
            None
        }
    }

    pub async fn is_connected(&self) -> bool {
        if self.circuit_open_remaining().is_some() {
            return false;
        }
        self.session.lock().await.is_some()
    }

    pub fn metrics(&self) -> NodeMetricsSnapshot {
        let metrics = self.metrics.lock().ok();
        metrics
            .map(|m| NodeMetricsSnapshot {
                total_calls: m.total_calls,
                success_count: m.success_count,
                failure_count: m.failure_count,
                restarts: m.restarts,
                avg_latency_ms: m.avg_latency_ms,
                last_error: m.last_error.clone(),
            })
            .unwrap_or_default()
    }

    /// Execute a worker tool with auto-reconnect and bounded retries.
    /// Exhausted retries open the circuit for the configured cooldown.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, SwarmError> {
        self.call_with_retries(name, arguments, self.config.max_retries, true)
            .await
    }

    async fn call_with_retries(
        &self,
        name: &str,
        arguments: serde_json::Value,
        max_retries: usize,
        trip_breaker: bool,
    ) -> Result<serde_json::Value, SwarmError> {
        if let Some(remaining) = self.circuit_open_remaining() {
            return Err(SwarmError::CircuitOpen {
                node: self.name.clone(),
                remaining,
            });
        }

        {
            let mut metrics = self.metrics.lock().map_err(poisoned)?;
            metrics.total_calls += 1;
        }

        let mut session = self.session.lock().await;
        let mut retries_left = max_retries;
        let started = Instant::now();

        loop {
            if session.is_none() {
                match self.connect().await {
                    Ok(new_session) => *session = Some(new_session),
                    Err(e) => {
                        self.record_failure(&format!("connection failed: {e}"));
                        return Err(SwarmError::Unreachable(self.name.clone()));
                    }
                }
            }

            let current = session.as_mut().ok_or_else(|| {
                SwarmError::Unreachable(self.name.clone())
            })?;
            let request = RpcRequest::call(current.next_id, name, arguments.clone());
            current.next_id += 1;

            match self.exchange(current, &request).await {
                Ok(response) => {
                    if let Some(error) = response.error {
                        // Worker-reported errors still close the session:
                        // the worker state after a failed call is suspect.
                        tracing::warn!(
                            node = %self.name,
                            code = error.code,
                            "worker rpc error: {}",
                            error.message
                        );
                        Self::close_session(session.take()).await;
                        if retries_left > 0 {
                            retries_left -= 1;
                            self.note_restart();
                            tokio::time::sleep(RECONNECT_PAUSE).await;
                            continue;
                        }
                        let err = SwarmError::Rpc {
                            code: error.code,
                            message: error.message,
                        };
                        self.record_failure(&err.to_string());
                        if trip_breaker {
                            self.trip_circuit(&err.to_string());
                        }
                        return Err(err);
                    }
                    self.record_success(started.elapsed());
                    return Ok(response.result.unwrap_or(serde_json::Value::Null));
                }
                Err(transport) => {
                    tracing::warn!(
                        node = %self.name,
                        retries_left,
                        "transport error: {transport}"
                    );
                    Self::close_session(session.take()).await;
                    if retries_left > 0 {
                        retries_left -= 1;
                        self.note_restart();
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                        continue;
                    }
                    self.record_failure(&transport.to_string());
                    if trip_breaker {
                        self.trip_circuit(&transport.to_string());
                    }
                    return Err(transport);
                }
            }
        }
    }

    /// List worker tools. Follows the same connect/execute discipline but
    /// never trips the breaker; failures degrade to an empty list.
    pub async fn list_tools(&self) -> Vec<WorkerTool> {
        if self.circuit_open_remaining().is_some() {
            return Vec::new();
        }
        let mut session = self.session.lock().await;
        if session.is_none() {
            match self.connect().await {
                Ok(new_session) => *session = Some(new_session),
                Err(_) => return Vec::new(),
            }
        }
        let Some(current) = session.as_mut() else {
            return Vec::new();
        };
        let request = RpcRequest::list(current.next_id);
        current.next_id += 1;
        match self.exchange(current, &request).await {
            Ok(response) => response
                .result
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            Err(_) => {
                Self::close_session(session.take()).await;
                Vec::new()
            }
        }
    }

    /// Active probe via the reserved `ping` method, retries = 0. An
    /// unhealthy node is reported, not tripped.
    pub async fn health_check(&self) -> NodeHealth {
        let circuit = if self.circuit_open_remaining().is_some() {
            "OPEN"
        } else {
            "CLOSED"
        };
        let connected = self.is_connected().await;

        let (healthy, ping_error) = if self.circuit_open_remaining().is_some() {
            (false, None)
        } else {
            match self.ping().await {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            }
        };

        NodeHealth {
            name: self.name.clone(),
            connected,
            circuit: circuit.to_string(),
            healthy,
            ping_error,
            metrics: self.metrics(),
        }
    }

    async fn ping(&self) -> Result<(), SwarmError> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            match self.connect().await {
                Ok(new_session) => *session = Some(new_session),
                Err(e) => return Err(SwarmError::Transport(e.to_string())),
            }
        }
        let current = session
            .as_mut()
            .ok_or_else(|| SwarmError::Unreachable(self.name.clone()))?;
        let request = RpcRequest::ping(current.next_id);
        current.next_id += 1;
        match self.exchange(current, &request).await {
            Ok(response) if response.error.is_none() => Ok(()),
            Ok(response) => Err(SwarmError::Rpc {
                code: response.error.as_ref().map(|e| e.code).unwrap_or(0),
                message: response
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "ping failed".into()),
            }),
            Err(e) => {
                Self::close_session(session.take()).await;
                Err(e)
            }
        }
    }

    /// Disconnect and reconnect immediately (manual restart).
    pub async fn restart(&self) -> bool {
        let mut session = self.session.lock().await;
        Self::close_session(session.take()).await;
        match self.connect().await {
            Ok(new_session) => {
                *session = Some(new_session);
                true
            }
            Err(_) => false,
        }
    }

    async fn connect(&self) -> Result<Session> {
        if !self.script.exists() {
            anyhow::bail!("worker script not found: {}", self.script.display());
        }
        tracing::debug!(node = %self.name, "connecting to worker");

        let (program, args) = worker_command(&self.script);
        let script_dir = self
            .script
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let python_path = match std::env::var("PYTHONPATH") {
            Ok(existing) if !existing.is_empty() => {
                format!("{}:{existing}", script_dir.display())
            }
            _ => script_dir.display().to_string(),
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONPATH", python_path)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let spawn = async {
            let mut child = command.spawn()?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow::anyhow!("worker stdin unavailable"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow::anyhow!("worker stdout unavailable"))?;
            Ok::<Session, anyhow::Error>(Session {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
                next_id: 1,
            })
        };

        match tokio::time::timeout(self.config.connect_timeout, spawn).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            ),
        }
    }

    async fn exchange(
        &self,
        session: &mut Session,
        request: &RpcRequest,
    ) -> Result<RpcResponse, SwarmError> {
        let line = serde_json::to_string(request)
            .map_err(|e| SwarmError::Transport(e.to_string()))?;

        let io = async {
            session
                .stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| SwarmError::Transport(format!("write failed: {e}")))?;
            session
                .stdin
                .write_all(b"\n")
                .await
                .map_err(|e| SwarmError::Transport(format!("write failed: {e}")))?;
            session
                .stdin
                .flush()
                .await
                .map_err(|e| SwarmError::Transport(format!("flush failed: {e}")))?;

            loop {
                let reply = session
                    .stdout
                    .next_line()
                    .await
                    .map_err(|e| SwarmError::Transport(format!("read failed: {e}")))?
                    .ok_or_else(|| {
                        SwarmError::Transport("worker closed stdout".into())
                    })?;
                if reply.trim().is_empty() {
                    continue;
                }
                let response: RpcResponse = serde_json::from_str(&reply).map_err(|e| {
                    SwarmError::Transport(format!("malformed response: {e}"))
                })?;
                if response.id != request.id {
                    // Stale reply from a previous timed-out call; skip it.
                    tracing::debug!(
                        node = %self.name,
                        got = response.id,
                        want = request.id,
                        "skipping stale response"
                    );
                    continue;
                }
                return Ok(response);
            }
        };

        match tokio::time::timeout(self.config.execute_timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(SwarmError::Timeout {
                node: self.name.clone(),
                timeout: self.config.execute_timeout,
            }),
        }
    }

    async fn close_session(session: Option<Session>) {
        if let Some(mut session) = session {
            let _ = session.child.start_kill();
            let _ = session.child.wait().await;
        }
    }

    fn record_success(&self, elapsed: Duration) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.success_count += 1;
            let duration_ms = elapsed.as_secs_f64() * 1000.0;
            if metrics.avg_latency_ms == 0.0 {
                metrics.avg_latency_ms = duration_ms;
            } else {
                metrics.avg_latency_ms = metrics.avg_latency_ms * (1.0 - LATENCY_EWMA_ALPHA)
                    + duration_ms * LATENCY_EWMA_ALPHA;
            }
        }
    }

    fn record_failure(&self, error: &str) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.failure_count += 1;
            metrics.last_error = Some(error.to_string());
        }
    }

    fn note_restart(&self) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.restarts += 1;
        }
    }

    fn trip_circuit(&self, reason: &str) {
        if let Ok(mut guard) = self.circuit_open_until.lock() {
            *guard = Some(Instant::now() + self.config.circuit_cooldown);
        }
        tracing::warn!(
            node = %self.name,
            cooldown = ?self.config.circuit_cooldown,
            "circuit OPEN: {reason}"
        );
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> SwarmError {
    SwarmError::Transport("metrics lock poisoned".into())
}

/// Interpreter selection by script extension; unknown extensions run the
/// script directly.
fn worker_command(script: &Path) -> (String, Vec<String>) {
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => (
            "python3".to_string(),
            vec![script.display().to_string()],
        ),
        Some("sh") => ("sh".to_string(), vec![script.display().to_string()]),
        _ => (script.display().to_string(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// A POSIX-sh JSON-RPC worker: answers every request on stdin with a
    /// matching-id response, using sed to pull the id out.
    const ECHO_WORKER: &str = r#"#!/bin/sh
while read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
  case "$line" in
    *'"method":"ping"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"pong":true}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":[{"name":"echo","description":"echo"}]}\n' "$id" ;;
    *'"name":"fail.tool"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"unknown tool"}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id" ;;
  esac
done
"#;

    fn write_worker(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("worker.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn fast_config() -> NodeConfig {
        NodeConfig {
            connect_timeout: Duration::from_secs(5),
            execute_timeout: Duration::from_secs(5),
            max_retries: 1,
            circuit_cooldown: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn call_tool_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_worker(&dir, ECHO_WORKER);
        let node = SwarmNode::new("echo", script, HashMap::new(), fast_config());

        let result = node
            .call_tool("demo.echo", serde_json::json!({"msg": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        let metrics = node.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert!(metrics.avg_latency_ms > 0.0);
    }

    #[tokio::test]
    async fn missing_script_is_unreachable() {
        let node = SwarmNode::new(
            "ghost",
            "/nonexistent/worker.sh",
            HashMap::new(),
            fast_config(),
        );
        let err = node
            .call_tool("x", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::Unreachable(_)));
        assert_eq!(node.metrics().failure_count, 1);
    }

    #[tokio::test]
    async fn worker_exit_opens_circuit_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        // Worker exits immediately: connect succeeds, first read fails.
        let script = write_worker(&dir, "#!/bin/sh\nexit 0\n");
        let node = SwarmNode::new("dead", script, HashMap::new(), fast_config());

        let err = node
            .call_tool("x", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SwarmError::Transport(_) | SwarmError::Unreachable(_)
        ));

        // Circuit is now open; the next call fails fast without a spawn.
        let err = node
            .call_tool("x", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::CircuitOpen { .. }));
        assert!(!node.is_connected().await);

        // After the cooldown the breaker closes and a connect is attempted.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let err = node
            .call_tool("x", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(!matches!(err, SwarmError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn circuit_cannot_close_before_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_worker(&dir, "#!/bin/sh\nexit 0\n");
        let mut config = fast_config();
        config.circuit_cooldown = Duration::from_secs(30);
        let node = SwarmNode::new("dead", script, HashMap::new(), config);

        let _ = node.call_tool("x", serde_json::json!({})).await;
        let remaining = node.circuit_open_remaining().unwrap();
        assert!(remaining > Duration::from_secs(25));
    }

    #[tokio::test]
    async fn rpc_error_surfaces_after_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_worker(&dir, ECHO_WORKER);
        let node = SwarmNode::new("echo", script, HashMap::new(), fast_config());

        let err = node
            .call_tool("fail.tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::Rpc { code: -32601, .. }));
        assert!(node.metrics().restarts >= 1);
    }

    #[tokio::test]
    async fn list_tools_never_trips_breaker() {
        let node = SwarmNode::new(
            "ghost",
            "/nonexistent/worker.sh",
            HashMap::new(),
            fast_config(),
        );
        assert!(node.list_tools().await.is_empty());
        // Breaker stays closed after a failed listing.
        assert!(node.circuit_open_remaining().is_none());
    }

    #[tokio::test]
    async fn list_tools_returns_worker_tools() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_worker(&dir, ECHO_WORKER);
        let node = SwarmNode::new("echo", script, HashMap::new(), fast_config());

        let tools = node.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn health_check_reports_healthy_worker() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_worker(&dir, ECHO_WORKER);
        let node = SwarmNode::new("echo", script, HashMap::new(), fast_config());

        let health = node.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.circuit, "CLOSED");
    }

    #[tokio::test]
    async fn health_check_reports_unreachable_worker() {
        let node = SwarmNode::new(
            "ghost",
            "/nonexistent/worker.sh",
            HashMap::new(),
            fast_config(),
        );
        let health = node.health_check().await;
        assert!(!health.healthy);
        assert!(health.ping_error.is_some());
    }

    #[test]
    fn worker_command_picks_interpreter() {
        let (program, args) = worker_command(Path::new("/w/server.py"));
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["/w/server.py"]);

        let (program, _) = worker_command(Path::new("/w/server.sh"));
        assert_eq!(program, "sh");

        let (program, args) = worker_command(Path::new("/w/server"));
        assert_eq!(program, "/w/server");
        assert!(args.is_empty());
    }
}
