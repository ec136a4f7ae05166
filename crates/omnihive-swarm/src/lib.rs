//! Self-healing subprocess pool: long-lived workers speaking
//! line-delimited JSON-RPC over stdio, with auto-reconnect, bounded
//! retries, per-node circuit breakers and call metrics.

pub mod node;
pub mod pool;
pub mod protocol;

pub use node::{NodeConfig, SwarmNode};
pub use pool::SwarmPool;
pub use protocol::{RpcError, RpcRequest, RpcResponse, WorkerTool};
