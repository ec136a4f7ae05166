//! The adaptive executor core: context pruning, tolerant tool-call
//! parsing, semantic recall, and the OODA loop with its closure guard.

pub mod context;
pub mod ooda;
pub mod parser;
pub mod recall;

pub use context::{estimate_tokens, ContextConfig, ContextManager};
pub use ooda::{extract_artifact_paths, OodaExecutor, OodaReport};
pub use parser::{parse_response, ToolAction};
pub use recall::{is_knowledge_intent, Librarian};
