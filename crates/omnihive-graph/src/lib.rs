//! Dynamically built, checkpointed workflow graphs: nodes are skill
//! invocations or async functions, edges route conditionally, and
//! `interrupt_before` gates give a human the last word.

pub mod builder;
pub mod executor;

pub use builder::{FnNode, FunctionNode, GraphBuilder, NodeCtx, END};
pub use executor::{CompiledGraph, RunOutcome};
