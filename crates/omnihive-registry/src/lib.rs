//! Skill registry and live-wire indexer: on-disk bundles are scanned,
//! embedded and hybrid-indexed; filesystem events stream through a
//! debounce window into incremental reindex passes without restart.

pub mod bundle;
pub mod indexer;
pub mod registry;
pub mod scanner;
pub mod watcher;

pub use bundle::{load_bundle, scan_bundles, SkillBundle, SkillManifest};
pub use indexer::{LiveWireIndexer, SKILLS_TABLE};
pub use registry::{CommandHandler, Handler, SkillRegistry};
pub use watcher::SkillWatcher;
