//! Skill runner: resolves router hits to executable handlers, validates
//! arguments, serves pure results from a mtime-sound cache, and
//! dispatches to the in-process fast path or the isolated subprocess
//! path.

pub mod cache;
pub mod runner;
pub mod validate;

pub use cache::ResultCache;
pub use runner::{RunOptions, SkillRunner};
pub use validate::validate_args;
